//! Hardware page directory model.
//!
//! One directory per process, mapping user pages to the frame currently
//! backing them together with the permission bit and the accessed/dirty
//! bits the eviction policy classifies on. The real MMU sets those bits as
//! a side effect of loads and stores; here [`usermem`](crate::mm::usermem)
//! sets them on every kernel- or user-initiated access.

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::mm::{FrameNumber, VirtAddr};

#[derive(Debug, Clone, Copy)]
struct DirEntry {
    frame: FrameNumber,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Per-process hardware mapping state.
pub struct PageDir {
    entries: Mutex<BTreeMap<u32, DirEntry>>,
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Install a mapping. Fails (returns false) if the page is already
    /// mapped; the caller is expected to release the frame in that case.
    pub fn map(&self, upage: VirtAddr, frame: FrameNumber, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        let key = upage.round_down().as_u32();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(
            key,
            DirEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// Remove a mapping, if present.
    pub fn clear(&self, upage: VirtAddr) {
        self.entries.lock().remove(&upage.round_down().as_u32());
    }

    /// Frame currently backing `upage`, if any.
    pub fn lookup(&self, upage: VirtAddr) -> Option<FrameNumber> {
        self.entries
            .lock()
            .get(&upage.round_down().as_u32())
            .map(|e| e.frame)
    }

    pub fn is_writable(&self, upage: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&upage.round_down().as_u32())
            .map(|e| e.writable)
            .unwrap_or(false)
    }

    pub fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&upage.round_down().as_u32())
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    pub fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        if let Some(e) = self
            .entries
            .lock()
            .get_mut(&upage.round_down().as_u32())
        {
            e.dirty = dirty;
        }
    }

    pub fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&upage.round_down().as_u32())
            .map(|e| e.accessed)
            .unwrap_or(false)
    }

    pub fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        if let Some(e) = self
            .entries
            .lock()
            .get_mut(&upage.round_down().as_u32())
        {
            e.accessed = accessed;
        }
    }

    /// Number of live mappings.
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}
