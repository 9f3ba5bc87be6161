//! Kernel access to user memory.
//!
//! All byte traffic between kernel and user space goes through here,
//! page by page via the process's page directory. Accesses behave like the
//! MMU: they set the accessed bit, writes set the dirty bit, a write to a
//! read-only mapping is refused, and a touch of a non-resident page runs
//! the fault resolver (with `esp` feeding the stack heuristic).
//!
//! Syscall handlers call these after validation has pinned the range, so
//! the fault path is normally already settled by the time bytes move.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::{fault, FrameNumber, VirtAddr, PAGE_SIZE};
use crate::process::Process;

/// Longest C string the kernel will pull out of user space.
pub const MAX_USER_STRING_LEN: usize = 4096;

/// Copy `dst.len()` bytes from user memory at `addr`.
pub fn read_bytes(
    process: &Process,
    esp: VirtAddr,
    addr: VirtAddr,
    dst: &mut [u8],
) -> KernelResult<()> {
    check_span(addr, dst.len())?;
    let mut done = 0usize;
    while done < dst.len() {
        let cur = addr.offset(done as u32);
        let (frame, page_ofs, n) = resolve(process, esp, cur, dst.len() - done)?;
        process.kernel.pool.read(frame, page_ofs, &mut dst[done..done + n])?;
        process.page_dir.set_accessed(cur.round_down(), true);
        done += n;
    }
    Ok(())
}

/// Copy `src` into user memory at `addr`. Fails on read-only mappings.
pub fn write_bytes(
    process: &Process,
    esp: VirtAddr,
    addr: VirtAddr,
    src: &[u8],
) -> KernelResult<()> {
    check_span(addr, src.len())?;
    let mut done = 0usize;
    while done < src.len() {
        let cur = addr.offset(done as u32);
        let upage = cur.round_down();
        let (frame, page_ofs, n) = resolve(process, esp, cur, src.len() - done)?;
        if !process.page_dir.is_writable(upage) {
            return Err(KernelError::ReadOnlyPage {
                addr: upage.as_u32(),
            });
        }
        process.kernel.pool.write(frame, page_ofs, &src[done..done + n])?;
        process.page_dir.set_accessed(upage, true);
        process.page_dir.set_dirty(upage, true);
        done += n;
    }
    Ok(())
}

/// Read one little-endian 32-bit word (syscall arguments).
pub fn read_u32(process: &Process, esp: VirtAddr, addr: VirtAddr) -> KernelResult<u32> {
    let mut buf = [0u8; 4];
    read_bytes(process, esp, addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a NUL-terminated string, excluding the terminator. Refuses strings
/// longer than [`MAX_USER_STRING_LEN`].
pub fn read_cstring(process: &Process, esp: VirtAddr, addr: VirtAddr) -> KernelResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut cur = addr;
    loop {
        if bytes.len() >= MAX_USER_STRING_LEN {
            return Err(KernelError::StringTooLong {
                max: MAX_USER_STRING_LEN,
            });
        }
        let mut byte = [0u8; 1];
        read_bytes(process, esp, cur, &mut byte)?;
        if byte[0] == 0 {
            return Ok(bytes);
        }
        bytes.push(byte[0]);
        cur = cur.checked_offset(1).ok_or(KernelError::InvalidAddress {
            addr: cur.as_u32(),
        })?;
    }
}

fn check_span(addr: VirtAddr, len: usize) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    addr.checked_offset(len as u32 - 1)
        .ok_or(KernelError::InvalidAddress {
            addr: addr.as_u32(),
        })?;
    Ok(())
}

/// Residency for the page under `cur`: the backing frame, the offset of
/// `cur` within it, and how many of `remaining` bytes fit in this page.
fn resolve(
    process: &Process,
    esp: VirtAddr,
    cur: VirtAddr,
    remaining: usize,
) -> KernelResult<(FrameNumber, usize, usize)> {
    if !cur.is_user() {
        return Err(KernelError::InvalidAddress { addr: cur.as_u32() });
    }
    let upage = cur.round_down();

    if process.page_dir.lookup(upage).is_none() {
        fault::handle_fault(process, cur, esp)?;
    }
    let frame = process
        .page_dir
        .lookup(upage)
        .ok_or(KernelError::UnmappedMemory { addr: cur.as_u32() })?;

    let page_ofs = cur.page_offset();
    let n = (PAGE_SIZE - page_ofs).min(remaining);
    Ok((frame, page_ofs, n))
}
