//! Syscall pointer validation and pinning.
//!
//! Before a syscall hands a user buffer to the file system (or reads its
//! own arguments off the user stack), every touched page is validated and
//! pinned: null and kernel addresses fail outright, registered pages are
//! made resident with `pinned` set, and unregistered addresses near the
//! saved user stack pointer grow the stack pre-pinned. A pinned page is
//! never chosen by eviction, its frame address is stable, and it may be
//! touched with only the global file lock held.
//!
//! Coverage is per the classic layout rule: the first byte, the last byte,
//! and the first byte of every page in between; strings are walked a byte
//! at a time until their terminator. Errors mean the pointer is bogus and
//! the caller must terminate the process.

use crate::error::{KernelError, KernelResult};
use crate::mm::usermem::MAX_USER_STRING_LEN;
use crate::mm::{fault, usermem, VirtAddr, PAGE_SIZE, STACK_HEURISTIC};
use crate::process::Process;

/// Validate and pin a single byte address.
fn valid_up(process: &Process, esp: VirtAddr, ptr: VirtAddr) -> KernelResult<()> {
    if !ptr.is_user() {
        return Err(KernelError::InvalidAddress { addr: ptr.as_u32() });
    }

    let entry = process.pages.lock().lookup(ptr);
    if let Some(entry) = entry {
        entry.set_pinned(true);
        if process.page_dir.lookup(ptr.round_down()).is_none() {
            fault::load_page(process, &entry, true)?;
        }
        Ok(())
    } else if process.page_dir.lookup(ptr.round_down()).is_some() {
        Ok(())
    } else if ptr.as_u32() >= esp.as_u32().saturating_sub(STACK_HEURISTIC) {
        fault::grow_stack(process, ptr, true).map(|_| ())
    } else {
        Err(KernelError::UnmappedMemory { addr: ptr.as_u32() })
    }
}

/// Validate and pin every page touched by `[ptr, ptr + size)`.
pub fn validate_range(
    process: &Process,
    esp: VirtAddr,
    ptr: VirtAddr,
    size: usize,
) -> KernelResult<()> {
    valid_up(process, esp, ptr)?;
    if size > 1 {
        let last = ptr
            .checked_offset(size as u32 - 1)
            .ok_or(KernelError::InvalidAddress { addr: ptr.as_u32() })?;
        valid_up(process, esp, last)?;
    }
    let mut i = PAGE_SIZE;
    while i < size {
        valid_up(process, esp, ptr.offset(i as u32))?;
        i += PAGE_SIZE;
    }
    Ok(())
}

/// Validate and pin a NUL-terminated string a byte at a time.
pub fn validate_string(process: &Process, esp: VirtAddr, s: VirtAddr) -> KernelResult<()> {
    let mut cur = s;
    let mut len = 0usize;
    loop {
        valid_up(process, esp, cur)?;
        let mut byte = [0u8; 1];
        usermem::read_bytes(process, esp, cur, &mut byte)?;
        if byte[0] == 0 {
            return Ok(());
        }
        len += 1;
        if len >= MAX_USER_STRING_LEN {
            return Err(KernelError::StringTooLong {
                max: MAX_USER_STRING_LEN,
            });
        }
        cur = cur.checked_offset(1).ok_or(KernelError::InvalidAddress {
            addr: cur.as_u32(),
        })?;
    }
}

/// Clear `pinned` on every page covered by `[ptr, ptr + size)`, from the
/// original buffer address and size only.
pub fn unpin_range(process: &Process, ptr: VirtAddr, size: usize) {
    let size = size.max(1);

    unpin_one(process, ptr);
    if let Some(last) = ptr.checked_offset(size as u32 - 1) {
        unpin_one(process, last);
    }
    let mut i = PAGE_SIZE;
    while i < size {
        unpin_one(process, ptr.offset(i as u32));
        i += PAGE_SIZE;
    }
}

/// Clear `pinned` on the pages holding the string at `s` (its `strlen`
/// bytes, matching what validation pinned).
pub fn unpin_string(process: &Process, s: VirtAddr) {
    let mut len = 0usize;
    let mut cur = s;
    while len < MAX_USER_STRING_LEN {
        let Some(frame) = process.page_dir.lookup(cur.round_down()) else {
            break;
        };
        let mut byte = [0u8; 1];
        if process
            .kernel
            .pool
            .read(frame, cur.page_offset(), &mut byte)
            .is_err()
        {
            break;
        }
        if byte[0] == 0 {
            break;
        }
        len += 1;
        match cur.checked_offset(1) {
            Some(next) => cur = next,
            None => break,
        }
    }
    unpin_range(process, s, len);
}

fn unpin_one(process: &Process, addr: VirtAddr) {
    if let Some(entry) = process.pages.lock().lookup(addr) {
        entry.set_pinned(false);
    }
}
