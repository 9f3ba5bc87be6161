//! OpalOS Kernel Library
//!
//! Core of the OpalOS teaching kernel: a demand-paged user-memory subsystem.
//! Each user process sees a private virtual address space larger than
//! physical memory, backed lazily by executable files, memory-mapped files,
//! and a swap partition.
//!
//! The crate is `no_std`; host builds link the standard library through the
//! test harness so the suites under `tests/` run with a plain `cargo test`.

#![no_std]

extern crate alloc;

pub mod console;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod mm;
pub mod process;
pub mod syscall;

pub use error::{KernelError, KernelResult};
pub use kernel::{Kernel, KernelConfig};
pub use mm::{FrameNumber, VirtAddr, PAGE_SIZE};
pub use process::{Process, ProcessId};
