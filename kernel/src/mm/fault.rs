//! Fault resolver and lazy load.
//!
//! Single entry point for user page faults and for the syscall validator's
//! eager residency checks. Resolution order: a registered page loads by its
//! backing kind; an unregistered address near the saved user stack pointer
//! grows the stack; anything else is the caller's cue to terminate the
//! process.
//!
//! This module is the only call site of [`FrameTable::acquire`]
//! (`crate::mm::FrameTable::acquire`) for user pages.

use alloc::sync::Arc;
use alloc::vec;
use log::trace;

use crate::error::{KernelError, KernelResult};
use crate::mm::page::{Backing, PageEntry};
use crate::mm::{
    AllocFlags, VirtAddr, MAX_STACK_SIZE, PAGE_SIZE, PHYS_BASE, STACK_HEURISTIC,
};
use crate::process::Process;

/// Resolve a user page fault at `addr` with the faulting stack pointer
/// `esp`. On error the process has no claim to the address and should be
/// terminated by the caller.
pub fn handle_fault(process: &Process, addr: VirtAddr, esp: VirtAddr) -> KernelResult<()> {
    if !addr.is_user() {
        return Err(KernelError::InvalidAddress {
            addr: addr.as_u32(),
        });
    }

    let entry = process.pages.lock().lookup(addr);
    match entry {
        Some(entry) => load_page(process, &entry, false),
        None if within_stack_window(addr, esp) => {
            grow_stack(process, addr, false).map(|_| ())
        }
        None => Err(KernelError::UnmappedMemory {
            addr: addr.as_u32(),
        }),
    }
}

/// Stack heuristic: at or above `esp - STACK_HEURISTIC` (computed without
/// wrap-around), below the kernel base, and within the stack cap.
pub fn within_stack_window(addr: VirtAddr, esp: VirtAddr) -> bool {
    addr.as_u32() >= esp.as_u32().saturating_sub(STACK_HEURISTIC)
        && addr.as_u32() < PHYS_BASE
        && (PHYS_BASE - addr.round_down().as_u32()) as usize <= MAX_STACK_SIZE
}

/// Register and materialize one anonymous stack page covering `addr`.
pub fn grow_stack(
    process: &Process,
    addr: VirtAddr,
    pinned: bool,
) -> KernelResult<Arc<PageEntry>> {
    if !addr.is_user() {
        return Err(KernelError::InvalidAddress {
            addr: addr.as_u32(),
        });
    }
    if (PHYS_BASE - addr.round_down().as_u32()) as usize > MAX_STACK_SIZE {
        return Err(KernelError::StackLimit {
            addr: addr.as_u32(),
        });
    }

    let entry = process.pages.lock().create_code(addr)?;
    if pinned {
        entry.set_pinned(true);
    }
    trace!("[FAULT] stack grows to {}", entry.upage());
    load_page(process, &entry, pinned)?;
    Ok(entry)
}

/// Materialize `entry` in a frame and install the hardware mapping.
///
/// The entry is held pinned while its frame is being filled so the clock
/// scan never selects a half-installed frame; the previous pin state is
/// restored afterwards unless `keep_pinned` asks otherwise. Already
/// resident entries return immediately.
pub fn load_page(process: &Process, entry: &Arc<PageEntry>, keep_pinned: bool) -> KernelResult<()> {
    let was_pinned = entry.pin();
    let result = load_page_inner(process, entry);
    let pinned_after = match result {
        Ok(()) => keep_pinned || was_pinned,
        Err(_) => was_pinned,
    };
    entry.set_pinned(pinned_after);
    result
}

fn load_page_inner(process: &Process, entry: &Arc<PageEntry>) -> KernelResult<()> {
    let kernel = &process.kernel;
    let upage = entry.upage();

    // Snapshot the backing; the entry lock is not held across frame
    // acquisition (eviction takes the frame-table lock first).
    let (backing, writable) = {
        let st = entry.state();
        if st.frame.is_some() {
            return Ok(());
        }
        (st.backing.clone(), st.writable)
    };

    match backing {
        Backing::Code { swap_slot } => {
            let frame = kernel.frames.acquire(
                kernel,
                AllocFlags::USER | AllocFlags::ZERO,
                entry,
                &process.page_dir,
            )?;

            if let Some(slot) = swap_slot {
                if let Err(e) = kernel.swap.swap_in(&kernel.pool, slot, frame) {
                    kernel.frames.free(&kernel.pool, frame)?;
                    return Err(e);
                }
            }

            if !process.page_dir.map(upage, frame, true) {
                kernel.frames.free(&kernel.pool, frame)?;
                return Err(KernelError::MappingExists {
                    addr: upage.as_u32(),
                });
            }
            let mut st = entry.state();
            st.frame = Some(frame);
            if let Backing::Code { swap_slot } = &mut st.backing {
                *swap_slot = None;
            }
            Ok(())
        }
        Backing::File(region) | Backing::Mmap(region) => {
            let frame = kernel
                .frames
                .acquire(kernel, AllocFlags::USER, entry, &process.page_dir)?;

            let mut buf = vec![0u8; PAGE_SIZE];
            let read = {
                let _guard = kernel.file_lock.lock();
                region.file.seek(region.ofs);
                region.file.read(&mut buf[..region.read_bytes])
            };
            if read != region.read_bytes {
                kernel.frames.free(&kernel.pool, frame)?;
                return Err(KernelError::ShortRead {
                    expected: region.read_bytes,
                    actual: read,
                });
            }
            // The tail past read_bytes stays zero.
            kernel.pool.write(frame, 0, &buf)?;

            if !process.page_dir.map(upage, frame, writable) {
                kernel.frames.free(&kernel.pool, frame)?;
                return Err(KernelError::MappingExists {
                    addr: upage.as_u32(),
                });
            }
            let mut st = entry.state();
            st.frame = Some(frame);
            Ok(())
        }
    }
}
