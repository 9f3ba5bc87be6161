//! System call interface for OpalOS.
//!
//! Arguments travel the classic way: 32-bit words on the user stack at
//! `esp`, each validated (and thereby pinned) before the kernel reads it.
//! The dispatcher always writes a return word to `eax` on a normal return;
//! for `close` and `munmap` that word is unspecified, by contract. The
//! word at the original `esp` is unpinned once dispatch finishes.
//!
//! A bad pointer anywhere terminates the process with status -1; a bad
//! file descriptor merely returns -1.

mod filesystem;
mod memory;
mod process;

use alloc::sync::Arc;
use log::warn;

use crate::error::KernelError;
use crate::mm::{usermem, validation, VirtAddr};
use crate::process::Process as Task;

/// Syscall numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Create = 4,
    Remove = 5,
    Open = 6,
    Filesize = 7,
    Read = 8,
    Write = 9,
    Seek = 10,
    Tell = 11,
    Close = 12,
    Mmap = 13,
    Munmap = 14,
    Chdir = 15,
    Mkdir = 16,
    Readdir = 17,
    Isdir = 18,
    Inumber = 19,
}

impl Syscall {
    fn from_number(n: u32) -> Option<Self> {
        Some(match n {
            0 => Self::Halt,
            1 => Self::Exit,
            2 => Self::Exec,
            3 => Self::Wait,
            4 => Self::Create,
            5 => Self::Remove,
            6 => Self::Open,
            7 => Self::Filesize,
            8 => Self::Read,
            9 => Self::Write,
            10 => Self::Seek,
            11 => Self::Tell,
            12 => Self::Close,
            13 => Self::Mmap,
            14 => Self::Munmap,
            15 => Self::Chdir,
            16 => Self::Mkdir,
            17 => Self::Readdir,
            18 => Self::Isdir,
            19 => Self::Inumber,
            _ => return None,
        })
    }
}

/// Saved user registers as the trap handler hands them over.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// User stack pointer at the moment of the trap.
    pub esp: u32,
    /// Return-value register; written on every normal return.
    pub eax: u32,
}

/// What the embedder does after the syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallEffect {
    /// Resume the process.
    Continue,
    /// The process terminated with this status (teardown already ran).
    Exit(i32),
    /// Power off the machine.
    Halt,
}

/// Non-local handler exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SysExit {
    Terminate(i32),
    Halt,
}

pub(crate) type SysResult = Result<i32, SysExit>;

impl From<KernelError> for SysExit {
    fn from(_: KernelError) -> Self {
        // Unresolvable user pointers cost the process its life.
        SysExit::Terminate(-1)
    }
}

/// Sequential reader of syscall arguments off the user stack.
pub(crate) struct ArgStream<'a> {
    process: &'a Task,
    esp: VirtAddr,
    cursor: VirtAddr,
}

impl<'a> ArgStream<'a> {
    fn new(process: &'a Task, esp: VirtAddr) -> Self {
        Self {
            process,
            esp,
            cursor: esp,
        }
    }

    /// The trap-time stack pointer (feeds the stack-growth heuristic).
    pub(crate) fn esp(&self) -> VirtAddr {
        self.esp
    }

    pub(crate) fn next_u32(&mut self) -> Result<u32, SysExit> {
        validation::validate_range(self.process, self.esp, self.cursor, 4)?;
        let value = usermem::read_u32(self.process, self.esp, self.cursor)?;
        self.cursor = self
            .cursor
            .checked_offset(4)
            .ok_or(SysExit::Terminate(-1))?;
        Ok(value)
    }

    pub(crate) fn next_i32(&mut self) -> Result<i32, SysExit> {
        Ok(self.next_u32()? as i32)
    }

    pub(crate) fn next_ptr(&mut self) -> Result<VirtAddr, SysExit> {
        Ok(VirtAddr::new(self.next_u32()?))
    }

    /// Probe the next stack word without consuming it.
    fn sanity_check(&self) -> Result<(), SysExit> {
        validation::validate_range(self.process, self.esp, self.cursor, 4)?;
        Ok(())
    }
}

/// Dispatch one system call for `process`.
pub fn handle_syscall(process: &Arc<Task>, frame: &mut TrapFrame) -> SyscallEffect {
    let esp = VirtAddr::new(frame.esp);
    let result = dispatch(process, esp);

    // The stack word at esp was pinned by argument validation.
    validation::unpin_range(process, esp, 4);

    match result {
        Ok(value) => {
            frame.eax = value as u32;
            SyscallEffect::Continue
        }
        Err(SysExit::Terminate(status)) => {
            process.exit(status);
            SyscallEffect::Exit(status)
        }
        Err(SysExit::Halt) => SyscallEffect::Halt,
    }
}

fn dispatch(process: &Arc<Task>, esp: VirtAddr) -> SysResult {
    let mut args = ArgStream::new(process, esp);
    let number = args.next_u32()?;
    // Probe the first argument word up front; handlers re-validate as they
    // consume.
    args.sanity_check()?;

    let Some(call) = Syscall::from_number(number) else {
        warn!("[SYSCALL] unknown syscall number {}", number);
        return Err(SysExit::Terminate(-1));
    };

    match call {
        Syscall::Halt => process::sys_halt(),
        Syscall::Exit => process::sys_exit(&mut args),
        Syscall::Exec => process::sys_exec(process, &mut args),
        Syscall::Wait => process::sys_wait(process, &mut args),
        Syscall::Create => filesystem::sys_create(process, &mut args),
        Syscall::Remove => filesystem::sys_remove(process, &mut args),
        Syscall::Open => filesystem::sys_open(process, &mut args),
        Syscall::Filesize => filesystem::sys_filesize(process, &mut args),
        Syscall::Read => filesystem::sys_read(process, &mut args),
        Syscall::Write => filesystem::sys_write(process, &mut args),
        Syscall::Seek => filesystem::sys_seek(process, &mut args),
        Syscall::Tell => filesystem::sys_tell(process, &mut args),
        Syscall::Close => filesystem::sys_close(process, &mut args),
        Syscall::Mmap => memory::sys_mmap(process, &mut args),
        Syscall::Munmap => memory::sys_munmap(process, &mut args),
        // Directory calls are recognised but not implemented.
        Syscall::Chdir
        | Syscall::Mkdir
        | Syscall::Readdir
        | Syscall::Isdir
        | Syscall::Inumber => process::sys_directory_stub(),
    }
}
