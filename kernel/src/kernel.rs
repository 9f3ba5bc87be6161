//! Kernel context.
//!
//! Every process-global singleton of the memory subsystem lives here as an
//! explicit handle rather than a module-level static: the raw user pool,
//! the frame table, the swap pool, the file store with its single global
//! lock, and the console. Embedders and test harnesses construct one
//! `Kernel` per machine.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use log::debug;
use spin::Mutex;

use crate::console::Console;
use crate::fs::blockdev::RamBlockDevice;
use crate::fs::FileStore;
use crate::mm::{FrameTable, SwapPool, UserPool, PAGE_SIZE, SECTOR_SIZE};
use crate::process::{NullLifecycle, ProcessId, ProcessLifecycle};

/// Machine-level tunables.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Frames in the raw user pool.
    pub user_frames: usize,
    /// Page-sized slots on the swap partition.
    pub swap_slots: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_frames: 256,
            swap_slots: 1024,
        }
    }
}

/// The machine: every singleton subsystem, as one explicit handle.
pub struct Kernel {
    /// Raw physical user-frame pool.
    pub pool: UserPool,
    /// Residency directory and eviction policy.
    pub frames: FrameTable,
    /// Swap partition slots.
    pub swap: SwapPool,
    /// The file store.
    pub fs: FileStore,
    /// Single global lock serializing every call into the file store.
    pub file_lock: Mutex<()>,
    /// stdin/stdout device.
    pub console: Console,
    /// Process-lifecycle collaborator for exec/wait.
    pub lifecycle: Box<dyn ProcessLifecycle>,
    next_pid: AtomicU64,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Arc<Self> {
        Self::with_lifecycle(config, Box::new(NullLifecycle))
    }

    pub fn with_lifecycle(
        config: KernelConfig,
        lifecycle: Box<dyn ProcessLifecycle>,
    ) -> Arc<Self> {
        // Bring-up order: swap before the frame table, which needs somewhere
        // to put victims from its very first eviction.
        let swap_sectors = (config.swap_slots * (PAGE_SIZE / SECTOR_SIZE)) as u64;
        let swap = SwapPool::new(Box::new(RamBlockDevice::new(SECTOR_SIZE, swap_sectors)));
        let pool = UserPool::new(config.user_frames);
        let frames = FrameTable::new();
        debug!(
            "[KERNEL] up: {} user frames, {} swap slots",
            config.user_frames, config.swap_slots
        );

        Arc::new(Self {
            pool,
            frames,
            swap,
            fs: FileStore::new(),
            file_lock: Mutex::new(()),
            console: Console::new(),
            lifecycle,
            next_pid: AtomicU64::new(1),
        })
    }

    pub fn alloc_pid(&self) -> ProcessId {
        ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }
}
