//! Error types for the OpalOS kernel.
//!
//! One top-level [`KernelError`] with context-carrying variants, plus a
//! filesystem sub-enum. Fatal conditions (swap exhaustion during eviction,
//! frame-table corruption) are not represented here; those panic.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No user frame could be produced, even after eviction.
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    /// Address is null, above the user/kernel split, or wraps around.
    InvalidAddress {
        addr: u32,
    },
    /// No lazy mapping and no hardware mapping covers the address.
    UnmappedMemory {
        addr: u32,
    },
    /// A lazy mapping already covers the target page.
    MappingExists {
        addr: u32,
    },
    /// Page or offset argument is not page-aligned.
    MisalignedAddress {
        addr: u32,
    },
    /// A backing-file read returned fewer bytes than the region requires.
    ShortRead {
        expected: usize,
        actual: usize,
    },
    /// A write-back wrote fewer bytes than the region requires.
    ShortWrite {
        expected: usize,
        actual: usize,
    },
    /// Every swap slot is in use.
    SwapExhausted {
        slots: usize,
    },
    /// Swap-in of a slot that is not allocated.
    SwapSlotFree {
        slot: usize,
    },
    /// Frame number outside the pool, or freed twice.
    InvalidFrame {
        frame: u32,
    },
    /// Stack growth past the per-process stack cap.
    StackLimit {
        addr: u32,
    },
    /// User-level write to a read-only mapping.
    ReadOnlyPage {
        addr: u32,
    },
    /// Unterminated or oversized user string.
    StringTooLong {
        max: usize,
    },
    /// Block device access outside the device.
    DeviceRange {
        block: u64,
    },
    /// Operation refused by policy.
    NotPermitted {
        operation: &'static str,
    },
    /// Filesystem-related errors
    FsError(FsError),
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File not found
    NotFound,
    /// File already exists
    AlreadyExists,
    /// Invalid file descriptor
    BadFileDescriptor,
    /// File descriptor table is full
    TooManyOpenFiles,
    /// Write refused because the file is open deny-write
    WriteDenied,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "Out of memory: requested {} frames, {} available",
                requested, available
            ),
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::MappingExists { addr } => {
                write!(f, "Page at {:#x} is already mapped", addr)
            }
            Self::MisalignedAddress { addr } => {
                write!(f, "Address {:#x} is not page-aligned", addr)
            }
            Self::ShortRead { expected, actual } => {
                write!(f, "Short read: wanted {} bytes, got {}", expected, actual)
            }
            Self::ShortWrite { expected, actual } => {
                write!(f, "Short write: wanted {} bytes, wrote {}", expected, actual)
            }
            Self::SwapExhausted { slots } => {
                write!(f, "All {} swap slots are in use", slots)
            }
            Self::SwapSlotFree { slot } => {
                write!(f, "Swap slot {} is not allocated", slot)
            }
            Self::InvalidFrame { frame } => write!(f, "Invalid frame number {}", frame),
            Self::StackLimit { addr } => {
                write!(f, "Stack growth to {:#x} exceeds the stack cap", addr)
            }
            Self::ReadOnlyPage { addr } => {
                write!(f, "Write to read-only page at {:#x}", addr)
            }
            Self::StringTooLong { max } => {
                write!(f, "User string exceeds {} bytes", max)
            }
            Self::DeviceRange { block } => {
                write!(f, "Block {} is outside the device", block)
            }
            Self::NotPermitted { operation } => {
                write!(f, "Operation not permitted: {}", operation)
            }
            Self::FsError(e) => write!(f, "Filesystem error: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}
