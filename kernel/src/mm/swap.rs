//! Swap slot pool.
//!
//! The swap partition is carved into page-sized slots, slot `i` starting at
//! sector `i * (PAGE_SIZE / sector)`. A word bitmap under the swap lock
//! tracks slot ownership; a slot belongs to the page entry that last
//! swapped out to it and is handed back on swap-in or entry destruction.
//! The bitmap is not persisted; swap contents do not survive a reboot.

use log::{debug, trace};

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;
use crate::mm::{FrameNumber, SwapSlot, UserPool, PAGE_SIZE};

struct SlotBitmap {
    /// 1 = slot in use
    words: Vec<u64>,
    used: usize,
}

/// Fixed-size pool of swap slots over a block device.
pub struct SwapPool {
    bitmap: Mutex<SlotBitmap>,
    device: Mutex<Box<dyn BlockDevice>>,
    slots: usize,
    sectors_per_page: usize,
    sector_size: usize,
}

impl SwapPool {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let sector_size = device.block_size();
        let sectors_per_page = PAGE_SIZE / sector_size;
        let slots = device.block_count() as usize / sectors_per_page;
        debug!(
            "[SWAP] {} slots ({} KiB partition)",
            slots,
            slots * PAGE_SIZE / 1024
        );
        Self {
            bitmap: Mutex::new(SlotBitmap {
                words: vec![0u64; slots.div_ceil(64)],
                used: 0,
            }),
            device: Mutex::new(device),
            slots,
            sectors_per_page,
            sector_size,
        }
    }

    /// Copy a frame out to a free slot. Returns the slot index; fails only
    /// when every slot is in use.
    pub fn swap_out(&self, pool: &UserPool, frame: FrameNumber) -> KernelResult<SwapSlot> {
        let slot = self.alloc_slot()?;

        let mut buf = vec![0u8; PAGE_SIZE];
        pool.read(frame, 0, &mut buf)?;

        let base = (slot * self.sectors_per_page) as u64;
        let mut device = self.device.lock();
        for sector in 0..self.sectors_per_page {
            let start = sector * self.sector_size;
            device.write_blocks(base + sector as u64, &buf[start..start + self.sector_size])?;
        }
        trace!("[SWAP] frame {} -> slot {}", frame, slot);
        Ok(slot)
    }

    /// Copy a slot's contents into a frame and release the slot. Swapping in
    /// a slot that is not allocated is a programming error and is reported.
    pub fn swap_in(&self, pool: &UserPool, slot: SwapSlot, frame: FrameNumber) -> KernelResult<()> {
        if !self.slot_in_use(slot) {
            return Err(KernelError::SwapSlotFree { slot });
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let device = self.device.lock();
            let base = (slot * self.sectors_per_page) as u64;
            for sector in 0..self.sectors_per_page {
                let start = sector * self.sector_size;
                device.read_blocks(
                    base + sector as u64,
                    &mut buf[start..start + self.sector_size],
                )?;
            }
        }
        pool.write(frame, 0, &buf)?;

        self.release(slot);
        trace!("[SWAP] slot {} -> frame {}", slot, frame);
        Ok(())
    }

    /// Hand a slot back without reading it (entry destruction).
    pub fn release(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        let word = slot / 64;
        let bit = slot % 64;
        if word < bitmap.words.len() && bitmap.words[word] & (1 << bit) != 0 {
            bitmap.words[word] &= !(1 << bit);
            bitmap.used -= 1;
        }
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().used
    }

    pub fn total_slots(&self) -> usize {
        self.slots
    }

    fn alloc_slot(&self) -> KernelResult<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        for (word_idx, word) in bitmap.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let slot = word_idx * 64 + bit;
            if slot >= self.slots {
                break;
            }
            *word |= 1 << bit;
            bitmap.used += 1;
            return Ok(slot);
        }
        Err(KernelError::SwapExhausted { slots: self.slots })
    }

    fn slot_in_use(&self, slot: SwapSlot) -> bool {
        let bitmap = self.bitmap.lock();
        let word = slot / 64;
        let bit = slot % 64;
        word < bitmap.words.len() && bitmap.words[word] & (1 << bit) != 0
    }
}
