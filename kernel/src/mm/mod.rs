//! Memory management for OpalOS user processes.
//!
//! The subsystem is split the way the fault path flows through it:
//! [`user_pool`] hands out raw physical frames, [`page`] records what every
//! promised virtual page is backed by, [`frame`] tracks residency and picks
//! eviction victims, [`swap`] parks dirty anonymous pages on the swap
//! partition, [`fault`] resolves page faults and lazy loads, [`validation`]
//! pins pages for the syscall layer, and [`usermem`] moves bytes between
//! kernel and user space through the hardware page directory model in
//! [`page_dir`].

pub mod fault;
pub mod frame;
pub mod page;
pub mod page_dir;
pub mod swap;
pub mod user_pool;
pub mod usermem;
pub mod validation;

use bitflags::bitflags;

pub use frame::FrameTable;
pub use page::{AddressSpace, Backing, FileRegion, PageEntry, SwapSlot};
pub use page_dir::PageDir;
pub use swap::SwapPool;
pub use user_pool::UserPool;

/// Size of a page and of a physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Sector size of the swap block device.
pub const SECTOR_SIZE: usize = 512;

/// First kernel virtual address; user space lies strictly below it.
pub const PHYS_BASE: u32 = 0xC000_0000;

/// Per-process stack cap (8 MiB).
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Allowed distance below the saved user stack pointer at which a fault is
/// still treated as stack growth (covers `push` and `pusha`).
pub const STACK_HEURISTIC: u32 = 32;

/// Per-process file-descriptor and mapping-id table size.
pub const MAX_FILES: usize = 128;

bitflags! {
    /// Flags accepted by the raw user-frame pool.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Allocate from the user pool. Required for every frame that backs
        /// a user page.
        const USER = 1 << 0;
        /// Zero the frame before handing it out.
        const ZERO = 1 << 1;
    }
}

/// User-virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Round down to the containing page boundary.
    pub const fn round_down(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// Byte offset within the containing page.
    pub const fn page_offset(&self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Non-null and strictly below the kernel base.
    pub const fn is_user(&self) -> bool {
        self.0 != 0 && self.0 < PHYS_BASE
    }

    /// Address `n` bytes above, or `None` past the top of the address space.
    pub const fn checked_offset(&self, n: u32) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Address `n` bytes above. Callers guarantee no wrap-around.
    pub const fn offset(&self, n: u32) -> Self {
        Self(self.0 + n)
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical frame number in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
