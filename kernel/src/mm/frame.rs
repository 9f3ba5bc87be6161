//! Frame table and eviction policy.
//!
//! Process-global directory of every user frame in use. Entries are kept in
//! insertion order; victim selection walks them with a three-phase enhanced
//! clock:
//!
//! - Phase 1 prefers frames that are neither accessed nor dirty, and
//!   opportunistically writes dirty file/mmap frames back to their own file
//!   (cheap compared to swap). A refused write-back leaves the dirty bit
//!   set, which keeps executable pages out of this phase.
//! - Phase 2 accepts anything unaccessed whose eviction needs no file
//!   write-back, and clears accessed bits so a later call sees the rest.
//! - Phase 3 falls back to FIFO so the search always terminates.
//!
//! Pinned pages are skipped in every phase. Eviction itself routes contents
//! by backing kind: mmap pages write back to their file, writable dirty
//! file pages are promoted to anonymous and parked in swap (the executable
//! is never modified), clean file pages are dropped, and anonymous pages go
//! to swap once they have ever been dirty.

use core::ptr;

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use log::{trace, warn};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::page::{Backing, FileRegion, PageEntry};
use crate::mm::page_dir::PageDir;
use crate::mm::{AllocFlags, FrameNumber, UserPool, VirtAddr};

/// One resident user frame: the frame itself, a non-owning reference to the
/// page occupying it, and the page directory of the page's owner (consulted
/// for the hardware dirty/accessed bits).
struct FrameSlot {
    frame: FrameNumber,
    page: Weak<PageEntry>,
    dir: Arc<PageDir>,
}

/// Process-global frame directory.
pub struct FrameTable {
    slots: Mutex<Vec<FrameSlot>>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Produce a frame for `page`, evicting if the pool is exhausted.
    ///
    /// The USER flag is required; this table only manages user-pool frames.
    /// The recorded owner is the owner of `page`, whatever thread happens to
    /// be faulting.
    pub fn acquire(
        &self,
        kernel: &Kernel,
        flags: AllocFlags,
        page: &Arc<PageEntry>,
        dir: &Arc<PageDir>,
    ) -> KernelResult<FrameNumber> {
        if !flags.contains(AllocFlags::USER) {
            return Err(KernelError::NotPermitted {
                operation: "frame acquisition outside the user pool",
            });
        }

        if let Ok(frame) = kernel.pool.alloc(flags) {
            self.record(frame, page, dir);
            return Ok(frame);
        }

        let mut slots = self.slots.lock();
        loop {
            assert!(
                !slots.is_empty(),
                "user pool exhausted with an empty frame table"
            );
            let victim = Self::choose_victim(kernel, &slots)
                .expect("no evictable frame: every resident page is pinned");
            Self::evict(kernel, &mut slots, victim);

            if let Ok(frame) = kernel.pool.alloc(flags) {
                slots.push(FrameSlot {
                    frame,
                    page: Arc::downgrade(page),
                    dir: dir.clone(),
                });
                return Ok(frame);
            }
        }
    }

    /// Drop the entry for `frame` and return the frame to the pool. Used on
    /// load failures, where the page never became resident.
    pub fn free(&self, pool: &UserPool, frame: FrameNumber) -> KernelResult<()> {
        let mut slots = self.slots.lock();
        if let Some(i) = slots.iter().position(|s| s.frame == frame) {
            slots.remove(i);
        }
        drop(slots);
        pool.free(frame)
    }

    /// Release `page`'s frame, if resident: write back dirty mmap or
    /// writable-file contents, clear the hardware mapping, drop the entry,
    /// free the frame. Used by unmap and process teardown; a refused
    /// write-back is logged and otherwise ignored there.
    pub fn release_page(&self, kernel: &Kernel, page: &Arc<PageEntry>) {
        let mut slots = self.slots.lock();
        let Some(i) = slots
            .iter()
            .position(|s| ptr::eq(s.page.as_ptr(), Arc::as_ptr(page)))
        else {
            return;
        };
        let slot = slots.remove(i);
        let upage = page.upage();
        let mut st = page.state();

        if slot.dir.is_dirty(upage) {
            let flush = match &st.backing {
                Backing::Mmap(r) => Some(r.clone()),
                Backing::File(r) if st.writable => Some(r.clone()),
                _ => None,
            };
            if let Some(region) = flush {
                if let Err(e) = write_back(kernel, &region, slot.frame) {
                    warn!("[FRAME] write-back refused while releasing {}: {}", upage, e);
                }
            }
        }

        slot.dir.clear(upage);
        st.frame = None;
        drop(st);
        kernel
            .pool
            .free(slot.frame)
            .expect("released frame unknown to the pool");
    }

    /// Number of resident frames.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Snapshot of (frame, user page) pairs for the live entries.
    pub fn resident(&self) -> Vec<(FrameNumber, VirtAddr)> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| s.page.upgrade().map(|p| (s.frame, p.upage())))
            .collect()
    }

    pub fn contains_frame(&self, frame: FrameNumber) -> bool {
        self.slots.lock().iter().any(|s| s.frame == frame)
    }

    fn record(&self, frame: FrameNumber, page: &Arc<PageEntry>, dir: &Arc<PageDir>) {
        self.slots.lock().push(FrameSlot {
            frame,
            page: Arc::downgrade(page),
            dir: dir.clone(),
        });
    }

    /// Three-phase enhanced clock over the slot list. Caller holds the
    /// frame-table lock.
    fn choose_victim(kernel: &Kernel, slots: &[FrameSlot]) -> Option<usize> {
        // Phase 1: clean dirty file/mmap frames in passing; pick the first
        // frame that is neither accessed nor in need of a write-back.
        for (i, slot) in slots.iter().enumerate() {
            let Some(page) = slot.page.upgrade() else {
                continue;
            };
            if page.is_pinned() {
                continue;
            }
            let upage = page.upage();
            let dirty = slot.dir.is_dirty(upage);
            let accessed = slot.dir.is_accessed(upage);
            let region = match &page.state().backing {
                Backing::File(r) | Backing::Mmap(r) => Some(r.clone()),
                Backing::Code { .. } => None,
            };

            match region {
                Some(region) => {
                    if dirty {
                        match write_back(kernel, &region, slot.frame) {
                            Ok(()) => slot.dir.set_dirty(upage, false),
                            Err(e) => {
                                trace!("[FRAME] write-back refused for {}: {}", upage, e);
                            }
                        }
                    } else if !accessed {
                        return Some(i);
                    }
                }
                None => {
                    if !dirty && !accessed {
                        return Some(i);
                    }
                }
            }
        }

        // Phase 2: anything unaccessed whose eviction needs no file
        // write-back; clear accessed bits on the rest.
        for (i, slot) in slots.iter().enumerate() {
            let Some(page) = slot.page.upgrade() else {
                continue;
            };
            if page.is_pinned() {
                continue;
            }
            let upage = page.upage();
            let dirty = slot.dir.is_dirty(upage);
            let accessed = slot.dir.is_accessed(upage);
            let is_code = page.state().backing.is_code();

            if (!dirty || is_code) && !accessed {
                return Some(i);
            }
            slot.dir.set_accessed(upage, false);
        }

        // Phase 3: FIFO fallback.
        slots.iter().position(|slot| {
            slot.page
                .upgrade()
                .map(|p| !p.is_pinned())
                .unwrap_or(false)
        })
    }

    /// Evict the slot at `idx`. Caller holds the frame-table lock.
    fn evict(kernel: &Kernel, slots: &mut Vec<FrameSlot>, idx: usize) {
        let slot = slots.remove(idx);
        let Some(page) = slot.page.upgrade() else {
            // Owner vanished; just reclaim the raw frame.
            kernel
                .pool
                .free(slot.frame)
                .expect("evicted frame unknown to the pool");
            return;
        };

        let upage = page.upage();
        let dirty = slot.dir.is_dirty(upage);
        let mut guard = page.state();
        let st = &mut *guard;

        if let Backing::Mmap(region) = &st.backing {
            if dirty {
                // A mapping of an ordinary file; failure here means the
                // page contents have nowhere to go.
                write_back(kernel, region, slot.frame)
                    .expect("mmap write-back failed during eviction");
            }
        }

        // First dirty eviction of a writable executable page: from here on
        // the page lives in swap, never in the file. Clean file pages are
        // simply dropped; they reload from the file on demand.
        let promote = matches!(st.backing, Backing::File(_)) && st.writable && dirty;
        if promote {
            trace!("[FRAME] promoting dirty file page {} to anonymous", upage);
            st.backing = Backing::Code { swap_slot: None };
        }

        if let Backing::Code { swap_slot } = &mut st.backing {
            if dirty || st.dirtied {
                let idx = match kernel.swap.swap_out(&kernel.pool, slot.frame) {
                    Ok(idx) => idx,
                    Err(e) => panic!("swap exhausted during eviction: {}", e),
                };
                *swap_slot = Some(idx);
                st.dirtied = true;
                trace!("[FRAME] {} evicted to swap slot {}", upage, idx);
            }
            // Never-dirtied anonymous pages zero-fill on the next fault.
        }

        slot.dir.clear(upage);
        st.frame = None;
        drop(guard);
        kernel
            .pool
            .free(slot.frame)
            .expect("evicted frame unknown to the pool");
    }
}

/// Copy `region.read_bytes` of `frame` back to the backing file. Refused
/// (short) writes surface as errors; deny-write files always refuse.
pub(crate) fn write_back(
    kernel: &Kernel,
    region: &FileRegion,
    frame: FrameNumber,
) -> KernelResult<()> {
    let mut buf = vec![0u8; region.read_bytes];
    kernel.pool.read(frame, 0, &mut buf)?;

    let _guard = kernel.file_lock.lock();
    let written = region.file.write_at(&buf, region.ofs);
    if written != region.read_bytes {
        return Err(KernelError::ShortWrite {
            expected: region.read_bytes,
            actual: written,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelConfig};
    use crate::mm::page::AddressSpace;

    fn small_kernel(frames: usize) -> alloc::sync::Arc<Kernel> {
        Kernel::new(KernelConfig {
            user_frames: frames,
            swap_slots: 16,
        })
    }

    /// Acquire a frame for `page` and install it the way the resolver does.
    fn make_resident(kernel: &Kernel, page: &Arc<PageEntry>, dir: &Arc<PageDir>) -> FrameNumber {
        let frame = kernel
            .frames
            .acquire(kernel, AllocFlags::USER | AllocFlags::ZERO, page, dir)
            .expect("acquire");
        page.state().frame = Some(frame);
        assert!(dir.map(page.upage(), frame, true));
        frame
    }

    #[test]
    fn test_user_flag_required() {
        let kernel = small_kernel(2);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());
        let page = space.create_code(VirtAddr::new(0x1000)).expect("entry");

        let err = kernel
            .frames
            .acquire(&kernel, AllocFlags::ZERO, &page, &dir);
        assert!(matches!(err, Err(KernelError::NotPermitted { .. })));
    }

    #[test]
    fn test_clean_code_page_discarded_not_swapped() {
        let kernel = small_kernel(2);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());

        let a = space.create_code(VirtAddr::new(0x1000)).expect("a");
        let b = space.create_code(VirtAddr::new(0x2000)).expect("b");
        let c = space.create_code(VirtAddr::new(0x3000)).expect("c");

        make_resident(&kernel, &a, &dir);
        make_resident(&kernel, &b, &dir);
        // `a` has been written to; `b` is untouched.
        dir.set_dirty(a.upage(), true);

        make_resident(&kernel, &c, &dir);

        assert!(a.frame().is_some(), "dirty page survives phase 1");
        assert!(b.frame().is_none(), "clean page was the victim");
        assert!(!b.in_swap(), "clean anonymous page is discarded, not swapped");
        assert_eq!(kernel.swap.used_slots(), 0);
    }

    #[test]
    fn test_dirty_code_page_goes_to_swap() {
        let kernel = small_kernel(1);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());

        let a = space.create_code(VirtAddr::new(0x1000)).expect("a");
        let b = space.create_code(VirtAddr::new(0x2000)).expect("b");

        let frame = make_resident(&kernel, &a, &dir);
        kernel.pool.write(frame, 0, &[9u8; 8]).expect("fill");
        dir.set_dirty(a.upage(), true);

        make_resident(&kernel, &b, &dir);

        assert!(a.in_swap(), "dirty anonymous page must be parked in swap");
        assert_eq!(kernel.swap.used_slots(), 1);
        assert!(a.frame().is_none());
        assert_eq!(dir.lookup(a.upage()), None, "hardware mapping cleared");
    }

    #[test]
    fn test_pinned_page_never_selected() {
        let kernel = small_kernel(2);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());

        let a = space.create_code(VirtAddr::new(0x1000)).expect("a");
        let b = space.create_code(VirtAddr::new(0x2000)).expect("b");
        let c = space.create_code(VirtAddr::new(0x3000)).expect("c");

        let frame_a = make_resident(&kernel, &a, &dir);
        make_resident(&kernel, &b, &dir);
        a.set_pinned(true);

        make_resident(&kernel, &c, &dir);

        assert_eq!(a.frame(), Some(frame_a), "pinned page keeps its frame");
        assert!(b.frame().is_none(), "unpinned neighbour evicted instead");
        assert!(kernel.frames.contains_frame(frame_a));
    }

    #[test]
    fn test_fifo_fallback_when_everything_is_hot() {
        let kernel = small_kernel(2);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());

        let a = space.create_code(VirtAddr::new(0x1000)).expect("a");
        let b = space.create_code(VirtAddr::new(0x2000)).expect("b");
        let c = space.create_code(VirtAddr::new(0x3000)).expect("c");

        make_resident(&kernel, &a, &dir);
        make_resident(&kernel, &b, &dir);
        for page in [&a, &b] {
            dir.set_dirty(page.upage(), true);
            dir.set_accessed(page.upage(), true);
        }

        make_resident(&kernel, &c, &dir);

        // Both candidates were accessed and dirty; FIFO order makes `a` the
        // victim (phase 2 cleared the accessed bits, then `a` qualifies).
        assert!(a.frame().is_none());
        assert!(b.frame().is_some());
    }

    #[test]
    fn test_free_returns_frame_to_pool() {
        let kernel = small_kernel(2);
        let mut space = AddressSpace::new();
        let dir = Arc::new(PageDir::new());
        let a = space.create_code(VirtAddr::new(0x1000)).expect("a");

        let frame = kernel
            .frames
            .acquire(&kernel, AllocFlags::USER, &a, &dir)
            .expect("acquire");
        assert_eq!(kernel.pool.free_count(), 1);

        kernel.frames.free(&kernel.pool, frame).expect("free");
        assert_eq!(kernel.pool.free_count(), 2);
        assert!(kernel.frames.is_empty());
    }
}
