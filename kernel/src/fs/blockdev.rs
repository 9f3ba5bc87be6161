//! Block Device Abstraction
//!
//! Common interface for block-level storage. The swap layer drives one of
//! these as its partition backing.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Block device trait
pub trait BlockDevice: Send {
    /// Get block size in bytes
    fn block_size(&self) -> usize;

    /// Get total number of blocks
    fn block_count(&self) -> u64;

    /// Read blocks from device
    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KernelResult<()>;

    /// Write blocks to device
    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> KernelResult<()>;
}

/// RAM-backed block device (swap partition for tests and bring-up)
pub struct RamBlockDevice {
    block_size: usize,
    data: Vec<u8>,
}

impl RamBlockDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        let size = block_size * block_count as usize;
        Self {
            block_size,
            data: vec![0u8; size],
        }
    }

    fn range(&self, start_block: u64, len: usize) -> KernelResult<(usize, usize)> {
        let start_byte = start_block as usize * self.block_size;
        let end_byte = start_byte + len;
        if end_byte > self.data.len() {
            return Err(KernelError::DeviceRange { block: start_block });
        }
        Ok((start_byte, end_byte))
    }
}

impl BlockDevice for RamBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KernelResult<()> {
        let (start, end) = self.range(start_block, buffer.len())?;
        buffer.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_blocks(&mut self, start_block: u64, buffer: &[u8]) -> KernelResult<()> {
        let (start, end) = self.range(start_block, buffer.len())?;
        self.data[start..end].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_block_device_roundtrip() {
        let mut dev = RamBlockDevice::new(512, 100);
        assert_eq!(dev.block_size(), 512);
        assert_eq!(dev.block_count(), 100);

        let write_data = [0x42u8; 512];
        dev.write_blocks(3, &write_data)
            .expect("write within the device should succeed");

        let mut read_data = [0u8; 512];
        dev.read_blocks(3, &mut read_data)
            .expect("read within the device should succeed");
        assert_eq!(read_data, write_data);
    }

    #[test]
    fn test_out_of_bounds_refused() {
        let mut dev = RamBlockDevice::new(512, 2);
        let buf = [0u8; 512];
        assert!(matches!(
            dev.write_blocks(2, &buf),
            Err(KernelError::DeviceRange { block: 2 })
        ));
    }
}
