//! Per-process lazy page registry.
//!
//! Every user page a process has been promised is recorded here, resident
//! or not. An entry names the page's backing source: anonymous memory
//! (zero-fill at birth, swap once dirtied), a region of an executable file,
//! or a region of a memory-mapped file. The fault resolver consults this
//! registry to decide how to materialize a page; eviction consults it in
//! reverse to decide where the contents go.
//!
//! Entries are shared: the registry owns them, the frame table keeps
//! non-owning back-references. The `pinned` flag is atomic so the syscall
//! validator can flip it without taking the entry lock; `state` guards
//! everything eviction and loading mutate. The entry lock is never held
//! while acquiring the frame-table lock.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::error::{KernelError, KernelResult};
use crate::fs::File;
use crate::mm::{FrameNumber, VirtAddr, PAGE_SIZE, PHYS_BASE};

/// Index of a slot on the swap partition.
pub type SwapSlot = usize;

/// A page-sized window of a backing file.
#[derive(Clone)]
pub struct FileRegion {
    pub file: Arc<File>,
    /// Byte offset of the window in the file (page-aligned for executables).
    pub ofs: usize,
    /// Bytes read from the file; the rest of the page is zero-filled.
    pub read_bytes: usize,
    /// Zero-padded tail; `read_bytes + zero_bytes == PAGE_SIZE`.
    pub zero_bytes: usize,
}

/// What materializes a page when it is faulted in, and where its contents
/// go when its frame is reclaimed.
#[derive(Clone)]
pub enum Backing {
    /// Anonymous page: stack, BSS, or a promoted file page. Zero-filled at
    /// birth; parked in `swap_slot` while non-resident after being dirtied.
    Code { swap_slot: Option<SwapSlot> },
    /// Lazily loaded region of an executable. Read-only pages are reloaded
    /// from the file; writable pages are promoted to `Code` on first dirty
    /// eviction so the executable is never modified.
    File(FileRegion),
    /// Page of a user-requested file mapping. Dirty evictions write back to
    /// the original file; the kind never changes.
    Mmap(FileRegion),
}

impl Backing {
    pub fn is_code(&self) -> bool {
        matches!(self, Backing::Code { .. })
    }
}

/// Mutable per-page state, guarded by the entry lock.
pub struct PageState {
    pub backing: Backing,
    /// Frame currently backing the page, if resident.
    pub frame: Option<FrameNumber>,
    /// Permission of the hardware mapping when installed.
    pub writable: bool,
    /// The page has been dirty at least once; once set, anonymous evictions
    /// always go through swap (the only copy of the data lives in RAM).
    pub dirtied: bool,
}

/// One promised virtual page.
pub struct PageEntry {
    upage: VirtAddr,
    pinned: AtomicBool,
    state: Mutex<PageState>,
}

impl PageEntry {
    fn new(upage: VirtAddr, backing: Backing, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            upage,
            pinned: AtomicBool::new(false),
            state: Mutex::new(PageState {
                backing,
                frame: None,
                writable,
                dirtied: false,
            }),
        })
    }

    pub fn upage(&self) -> VirtAddr {
        self.upage
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    /// Pin and report the previous state.
    pub fn pin(&self) -> bool {
        self.pinned.swap(true, Ordering::AcqRel)
    }

    pub fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.state.lock().frame
    }

    pub fn in_swap(&self) -> bool {
        matches!(
            self.state.lock().backing,
            Backing::Code {
                swap_slot: Some(_)
            }
        )
    }
}

/// The registry: user page number -> entry, for one process.
pub struct AddressSpace {
    entries: BTreeMap<u32, Arc<PageEntry>>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, entry: Arc<PageEntry>) -> KernelResult<Arc<PageEntry>> {
        let key = entry.upage().as_u32();
        if self.entries.contains_key(&key) {
            return Err(KernelError::MappingExists { addr: key });
        }
        self.entries.insert(key, entry.clone());
        Ok(entry)
    }

    /// Record the pages of a file segment for lazy loading.
    ///
    /// `read_bytes + zero_bytes` is split into page-sized chunks, the last
    /// one zero-padded. `upage` and `ofs` must be page-aligned and the total
    /// a multiple of the page size. Created entries are unwound if any
    /// target page is already promised.
    pub fn install_file(
        &mut self,
        file: &Arc<File>,
        ofs: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KernelResult<()> {
        if !upage.is_page_aligned() {
            return Err(KernelError::MisalignedAddress {
                addr: upage.as_u32(),
            });
        }
        if ofs % PAGE_SIZE != 0 || (read_bytes + zero_bytes) % PAGE_SIZE != 0 {
            return Err(KernelError::MisalignedAddress { addr: ofs as u32 });
        }

        let mut created = Vec::new();
        let mut upage = upage;
        let mut ofs = ofs;
        let mut read_bytes = read_bytes;
        let mut zero_bytes = zero_bytes;

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            let region = FileRegion {
                file: file.clone(),
                ofs,
                read_bytes: page_read_bytes,
                zero_bytes: page_zero_bytes,
            };
            match self.insert(PageEntry::new(upage, Backing::File(region), writable)) {
                Ok(_) => created.push(upage),
                Err(e) => {
                    for page in created {
                        self.entries.remove(&page.as_u32());
                    }
                    return Err(e);
                }
            }

            ofs += page_read_bytes;
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            upage = upage.offset(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Record the pages of a user file mapping.
    ///
    /// Covers `ceil(length / PAGE_SIZE)` pages starting at `upage`, always
    /// writable. Fails atomically: a collision with an existing page unwinds
    /// everything created so far. Returns the anchor entry.
    pub fn install_mmap(
        &mut self,
        file: Arc<File>,
        upage: VirtAddr,
        length: usize,
    ) -> KernelResult<Arc<PageEntry>> {
        if !upage.is_page_aligned() {
            return Err(KernelError::MisalignedAddress {
                addr: upage.as_u32(),
            });
        }
        if length == 0 {
            return Err(KernelError::InvalidAddress {
                addr: upage.as_u32(),
            });
        }
        let pages = length.div_ceil(PAGE_SIZE);
        if (upage.as_usize() + pages * PAGE_SIZE) > PHYS_BASE as usize {
            return Err(KernelError::InvalidAddress {
                addr: upage.as_u32(),
            });
        }

        let mut anchor = None;
        let mut created = Vec::new();
        let mut upage = upage;
        let mut ofs = 0usize;
        let mut remaining = length;

        while remaining > 0 {
            let page_read_bytes = remaining.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;

            let region = FileRegion {
                file: file.clone(),
                ofs,
                read_bytes: page_read_bytes,
                zero_bytes: page_zero_bytes,
            };
            match self.insert(PageEntry::new(upage, Backing::Mmap(region), true)) {
                Ok(entry) => {
                    if anchor.is_none() {
                        anchor = Some(entry.clone());
                    }
                    created.push(upage);
                }
                Err(e) => {
                    for page in created {
                        self.entries.remove(&page.as_u32());
                    }
                    return Err(e);
                }
            }

            ofs += page_read_bytes;
            remaining -= page_read_bytes;
            upage = upage.offset(PAGE_SIZE as u32);
        }

        // length > 0, so at least one entry was created.
        Ok(anchor.expect("mmap of a non-empty file creates an anchor"))
    }

    /// Record an anonymous page (stack growth, uninitialized data).
    pub fn create_code(&mut self, upage: VirtAddr) -> KernelResult<Arc<PageEntry>> {
        self.insert(PageEntry::new(
            upage.round_down(),
            Backing::Code { swap_slot: None },
            true,
        ))
    }

    /// Entry covering `addr`, rounded down to its page.
    pub fn lookup(&self, addr: VirtAddr) -> Option<Arc<PageEntry>> {
        self.entries.get(&addr.round_down().as_u32()).cloned()
    }

    /// Drop a single page from the registry.
    pub fn remove(&mut self, upage: VirtAddr) -> Option<Arc<PageEntry>> {
        self.entries.remove(&upage.round_down().as_u32())
    }

    /// Drain every entry (process teardown).
    pub fn take_all(&mut self) -> Vec<Arc<PageEntry>> {
        let entries = core::mem::take(&mut self.entries);
        entries.into_values().collect()
    }

    /// Snapshot of the current entries.
    pub fn entries(&self) -> Vec<Arc<PageEntry>> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileStore;

    fn file_of(len: usize) -> Arc<File> {
        let store = FileStore::new();
        store.create("f", len);
        Arc::new(store.open("f").expect("open"))
    }

    #[test]
    fn test_install_file_chunks_pages() {
        let mut space = AddressSpace::new();
        let file = file_of(5000);

        space
            .install_file(&file, 0, VirtAddr::new(0x8048000), 5000, 3192, false)
            .expect("aligned install should succeed");
        assert_eq!(space.len(), 2);

        let first = space
            .lookup(VirtAddr::new(0x8048000))
            .expect("first page recorded");
        let second = space
            .lookup(VirtAddr::new(0x8049000))
            .expect("second page recorded");

        match &first.state().backing {
            Backing::File(r) => {
                assert_eq!(r.read_bytes, 4096);
                assert_eq!(r.zero_bytes, 0);
            }
            _ => panic!("expected file backing"),
        }
        match &second.state().backing {
            Backing::File(r) => {
                assert_eq!(r.ofs, 4096);
                assert_eq!(r.read_bytes, 904);
                assert_eq!(r.zero_bytes, 3192);
            }
            _ => panic!("expected file backing"),
        };
    }

    #[test]
    fn test_install_file_rejects_misalignment() {
        let mut space = AddressSpace::new();
        let file = file_of(100);
        assert!(space
            .install_file(&file, 0, VirtAddr::new(0x8048010), 4096, 0, false)
            .is_err());
        assert!(space
            .install_file(&file, 100, VirtAddr::new(0x8048000), 4096, 0, false)
            .is_err());
        assert!(space.is_empty());
    }

    #[test]
    fn test_install_mmap_collision_unwinds() {
        let mut space = AddressSpace::new();
        space
            .create_code(VirtAddr::new(0x10002000))
            .expect("pre-existing page");

        let file = file_of(3 * PAGE_SIZE);
        let err = space.install_mmap(file, VirtAddr::new(0x10000000), 3 * PAGE_SIZE);
        assert!(matches!(err, Err(KernelError::MappingExists { .. })));

        // Only the pre-existing page survives; partial creations are gone.
        assert_eq!(space.len(), 1);
        assert!(space.lookup(VirtAddr::new(0x10000000)).is_none());
        assert!(space.lookup(VirtAddr::new(0x10001000)).is_none());
    }

    #[test]
    fn test_install_mmap_partial_last_page() {
        let mut space = AddressSpace::new();
        let file = file_of(3000);
        let anchor = space
            .install_mmap(file, VirtAddr::new(0x10000000), 3000)
            .expect("install");
        assert_eq!(anchor.upage(), VirtAddr::new(0x10000000));
        assert_eq!(space.len(), 1);

        match &anchor.state().backing {
            Backing::Mmap(r) => {
                assert_eq!(r.read_bytes, 3000);
                assert_eq!(r.zero_bytes, 1096);
            }
            _ => panic!("expected mmap backing"),
        };
    }

    #[test]
    fn test_lookup_rounds_down() {
        let mut space = AddressSpace::new();
        let entry = space.create_code(VirtAddr::new(0xBFFFF000)).expect("code");
        let found = space
            .lookup(VirtAddr::new(0xBFFFFFFC))
            .expect("interior address resolves");
        assert!(Arc::ptr_eq(&entry, &found));
    }

    #[test]
    fn test_duplicate_code_page_refused() {
        let mut space = AddressSpace::new();
        space.create_code(VirtAddr::new(0x1000)).expect("first");
        assert!(matches!(
            space.create_code(VirtAddr::new(0x1234)),
            Err(KernelError::MappingExists { .. })
        ));
    }
}
