//! Process control block and teardown.
//!
//! A process owns its page directory, its lazy page registry, and fixed
//! tables of open files and live file mappings. Exit runs the full
//! resource walk: dirty mapped pages are written back, resident frames are
//! freed, parked swap slots are released, and the registry is destroyed.
//!
//! Thread scheduling and program loading live outside this subsystem; the
//! [`ProcessLifecycle`] seam is what exec/wait delegate to.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::debug;
use spin::Mutex;

use crate::error::KernelResult;
use crate::fs::File;
use crate::kernel::Kernel;
use crate::mm::page::{AddressSpace, Backing, PageEntry};
use crate::mm::page_dir::PageDir;
use crate::mm::{usermem, VirtAddr, MAX_FILES, PAGE_SIZE};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-lifecycle collaborator: program spawning and child reaping are
/// owned by the scheduler side of the kernel, not by this subsystem.
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn the program named by `cmd`; `None` if it cannot load.
    fn exec(&self, cmd: &str) -> Option<ProcessId>;
    /// Wait for `pid` and return its exit status; `None` for a pid that is
    /// not an un-waited child of the caller.
    fn wait(&self, pid: ProcessId) -> Option<i32>;
}

/// Default lifecycle: refuses everything.
pub struct NullLifecycle;

impl ProcessLifecycle for NullLifecycle {
    fn exec(&self, _cmd: &str) -> Option<ProcessId> {
        None
    }

    fn wait(&self, _pid: ProcessId) -> Option<i32> {
        None
    }
}

/// One live file mapping: the page the mapping starts at and the (reopened)
/// handle whose length bounds the munmap walk.
#[derive(Clone)]
pub struct MmapRegion {
    pub anchor: VirtAddr,
    pub file: Arc<File>,
}

/// Process Control Block
pub struct Process {
    pub pid: ProcessId,
    pub name: String,
    pub kernel: Arc<Kernel>,
    /// Hardware mapping state.
    pub page_dir: Arc<PageDir>,
    /// Lazy page registry; accessed by this process's thread, and through
    /// entry handles by the evictor.
    pub pages: Mutex<AddressSpace>,
    /// Open files; slots 0 and 1 are the console and stay `None`.
    files: Mutex<Vec<Option<Arc<File>>>>,
    /// Live file mappings by mapping id.
    mmaps: Mutex<Vec<Option<MmapRegion>>>,
    exited: AtomicBool,
    exit_status: AtomicI32,
}

impl Process {
    pub fn new(kernel: &Arc<Kernel>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            pid: kernel.alloc_pid(),
            name: String::from(name),
            kernel: kernel.clone(),
            page_dir: Arc::new(PageDir::new()),
            pages: Mutex::new(AddressSpace::new()),
            files: Mutex::new(vec![None; MAX_FILES]),
            mmaps: Mutex::new(vec![None; MAX_FILES]),
            exited: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
        })
    }

    /// Record an executable segment for lazy loading (program load path).
    pub fn map_segment(
        &self,
        file: &Arc<File>,
        ofs: usize,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> KernelResult<()> {
        self.pages
            .lock()
            .install_file(file, ofs, upage, read_bytes, zero_bytes, writable)
    }

    // ------------------------------------------------------------------
    // Descriptor tables
    // ------------------------------------------------------------------

    /// Put `file` in the first free descriptor slot at 2 or above.
    pub fn install_fd(&self, file: Arc<File>) -> Option<usize> {
        let mut files = self.files.lock();
        for (fd, slot) in files.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(file);
                return Some(fd);
            }
        }
        None
    }

    pub fn fd(&self, fd: usize) -> Option<Arc<File>> {
        self.files.lock().get(fd).and_then(|slot| slot.clone())
    }

    /// Close a descriptor. Closing an empty or out-of-range slot is a no-op.
    pub fn close_fd(&self, fd: usize) {
        let file = self.files.lock().get_mut(fd).and_then(|slot| slot.take());
        if let Some(file) = file {
            let _guard = self.kernel.file_lock.lock();
            drop(file);
        }
    }

    /// Record a live mapping; the slot index is the mapping id.
    pub fn install_mapping(&self, region: MmapRegion) -> Option<usize> {
        let mut mmaps = self.mmaps.lock();
        for (id, slot) in mmaps.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(region);
                return Some(id);
            }
        }
        None
    }

    pub fn take_mapping(&self, id: usize) -> Option<MmapRegion> {
        self.mmaps.lock().get_mut(id).and_then(|slot| slot.take())
    }

    // ------------------------------------------------------------------
    // User memory access (the MMU-visible side of this process)
    // ------------------------------------------------------------------

    pub fn user_read(&self, esp: VirtAddr, addr: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
        usermem::read_bytes(self, esp, addr, dst)
    }

    pub fn user_write(&self, esp: VirtAddr, addr: VirtAddr, src: &[u8]) -> KernelResult<()> {
        usermem::write_bytes(self, esp, addr, src)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release one page wherever it currently lives: frame (with write-back
    /// of dirty mapped contents), swap slot, or nowhere.
    pub(crate) fn dispose_entry(&self, entry: &Arc<PageEntry>) {
        self.kernel.frames.release_page(&self.kernel, entry);
        let st = entry.state();
        if let Backing::Code {
            swap_slot: Some(slot),
        } = &st.backing
        {
            self.kernel.swap.release(*slot);
        }
    }

    /// Remove the mapping that starts at `anchor`, walking until `file`'s
    /// length is exhausted. Dirty pages are flushed on release.
    pub fn unmap_region(&self, anchor: VirtAddr, file: &File) {
        let mut remaining = {
            let _guard = self.kernel.file_lock.lock();
            file.length()
        };
        let mut upage = anchor;

        while remaining > 0 {
            let entry = self.pages.lock().lookup(upage);
            let Some(entry) = entry else {
                break;
            };
            let read_bytes = match &entry.state().backing {
                Backing::Mmap(region) if region.file.same_node(file) => region.read_bytes,
                _ => break,
            };

            self.pages.lock().remove(upage);
            self.dispose_entry(&entry);

            remaining = remaining.saturating_sub(read_bytes);
            upage = upage.offset(PAGE_SIZE as u32);
        }
    }

    /// Full exit path: close descriptors, drop mappings, release every
    /// promised page, report the status on the console.
    pub fn exit(&self, status: i32) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        self.exit_status.store(status, Ordering::Release);

        let open: Vec<Arc<File>> = {
            let mut files = self.files.lock();
            files.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        if !open.is_empty() {
            let _guard = self.kernel.file_lock.lock();
            drop(open);
        }
        self.mmaps.lock().iter_mut().for_each(|slot| {
            slot.take();
        });

        let entries = self.pages.lock().take_all();
        for entry in &entries {
            self.dispose_entry(entry);
        }

        let line = format!("{}: exit({})\n", self.name, status);
        {
            let _guard = self.kernel.file_lock.lock();
            self.kernel.console.write_bytes(line.as_bytes());
        }
        debug!("[PROCESS] {} (pid {}) exited with {}", self.name, self.pid, status);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }
}
