//! Process-control system calls.

use alloc::string::String;

use super::{ArgStream, SysExit, SysResult};
use crate::mm::{usermem, validation};
use crate::process::{Process, ProcessId};

pub(super) fn sys_halt() -> SysResult {
    Err(SysExit::Halt)
}

pub(super) fn sys_exit(args: &mut ArgStream) -> SysResult {
    // An unreadable status argument still terminates, just with -1.
    let status = args.next_i32().unwrap_or(-1);
    Err(SysExit::Terminate(status))
}

pub(super) fn sys_exec(process: &Process, args: &mut ArgStream) -> SysResult {
    let cmd_ptr = args.next_ptr()?;
    validation::validate_string(process, args.esp(), cmd_ptr)?;

    let bytes = usermem::read_cstring(process, args.esp(), cmd_ptr)?;
    let cmd = String::from_utf8_lossy(&bytes).into_owned();

    let pid = {
        let _guard = process.kernel.file_lock.lock();
        process.kernel.lifecycle.exec(&cmd)
    };
    validation::unpin_string(process, cmd_ptr);
    Ok(pid.map(|p| p.0 as i32).unwrap_or(-1))
}

pub(super) fn sys_wait(process: &Process, args: &mut ArgStream) -> SysResult {
    let pid = args.next_u32()? as u64;
    Ok(process
        .kernel
        .lifecycle
        .wait(ProcessId(pid))
        .unwrap_or(-1))
}

/// The five directory calls are recognised by number and nothing more.
pub(super) fn sys_directory_stub() -> SysResult {
    Err(SysExit::Terminate(-1))
}
