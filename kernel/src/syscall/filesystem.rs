//! Filesystem system calls.
//!
//! Every handler follows the same discipline: validate (and pin) what the
//! user handed over, take the global file lock for the store call, then
//! unpin from the original pointer and size. Descriptor mistakes return -1;
//! pointer mistakes never come back.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use super::{ArgStream, SysResult};
use crate::fs::{STDIN_FILENO, STDOUT_FILENO};
use crate::mm::page::Backing;
use crate::mm::{usermem, validation, VirtAddr, MAX_FILES};
use crate::process::Process;

fn is_valid_fd(fd: usize) -> bool {
    fd < MAX_FILES
}

/// Pull a validated, pinned string out of user memory.
fn read_name(process: &Process, esp: VirtAddr, ptr: VirtAddr) -> Result<String, super::SysExit> {
    let bytes = usermem::read_cstring(process, esp, ptr)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(super) fn sys_create(process: &Process, args: &mut ArgStream) -> SysResult {
    let name_ptr = args.next_ptr()?;
    validation::validate_string(process, args.esp(), name_ptr)?;
    let initial_size = args.next_u32()? as usize;

    let name = read_name(process, args.esp(), name_ptr)?;
    let created = {
        let _guard = process.kernel.file_lock.lock();
        process.kernel.fs.create(&name, initial_size)
    };
    validation::unpin_string(process, name_ptr);
    Ok(created as i32)
}

pub(super) fn sys_remove(process: &Process, args: &mut ArgStream) -> SysResult {
    let name_ptr = args.next_ptr()?;
    validation::validate_string(process, args.esp(), name_ptr)?;

    let name = read_name(process, args.esp(), name_ptr)?;
    let removed = {
        let _guard = process.kernel.file_lock.lock();
        process.kernel.fs.remove(&name)
    };
    validation::unpin_string(process, name_ptr);
    Ok(removed as i32)
}

pub(super) fn sys_open(process: &Process, args: &mut ArgStream) -> SysResult {
    let name_ptr = args.next_ptr()?;
    validation::validate_string(process, args.esp(), name_ptr)?;

    let name = read_name(process, args.esp(), name_ptr)?;
    let file = {
        let _guard = process.kernel.file_lock.lock();
        process.kernel.fs.open(&name)
    };

    let ret = match file {
        Some(file) => match process.install_fd(Arc::new(file)) {
            Some(fd) => fd as i32,
            None => -1,
        },
        None => -1,
    };
    validation::unpin_string(process, name_ptr);
    Ok(ret)
}

pub(super) fn sys_filesize(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;

    if is_valid_fd(fd) {
        if let Some(file) = process.fd(fd) {
            let _guard = process.kernel.file_lock.lock();
            return Ok(file.length() as i32);
        }
    }
    Ok(-1)
}

pub(super) fn sys_read(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;
    let buffer = args.next_ptr()?;
    let size = args.next_u32()? as usize;

    validation::validate_range(process, args.esp(), buffer, size)?;

    let mut ret = 0i32;
    if fd == STDIN_FILENO {
        let mut data = vec![0u8; size];
        {
            let _guard = process.kernel.file_lock.lock();
            for byte in data.iter_mut() {
                *byte = process.kernel.console.getc();
            }
        }
        usermem::write_bytes(process, args.esp(), buffer, &data)?;
        ret = size as i32;
    } else if is_valid_fd(fd) && fd >= 2 {
        if let Some(file) = process.fd(fd) {
            // Refuse to read into a read-only executable image.
            buffer_writable(process, buffer)?;

            let mut data = vec![0u8; size];
            let n = {
                let _guard = process.kernel.file_lock.lock();
                file.read(&mut data)
            };
            usermem::write_bytes(process, args.esp(), buffer, &data[..n])?;
            ret = n as i32;
        }
    }

    validation::unpin_range(process, buffer, size);
    Ok(ret)
}

pub(super) fn sys_write(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;
    let buffer = args.next_ptr()?;
    let size = args.next_u32()? as usize;

    validation::validate_range(process, args.esp(), buffer, size)?;

    let mut ret = 0i32;
    if fd == STDOUT_FILENO {
        let mut data = vec![0u8; size];
        usermem::read_bytes(process, args.esp(), buffer, &mut data)?;
        {
            let _guard = process.kernel.file_lock.lock();
            process.kernel.console.write_bytes(&data);
        }
        ret = size as i32;
    } else if is_valid_fd(fd) && fd >= 2 {
        if let Some(file) = process.fd(fd) {
            let mut data = vec![0u8; size];
            usermem::read_bytes(process, args.esp(), buffer, &mut data)?;
            let written = {
                let _guard = process.kernel.file_lock.lock();
                file.write(&data)
            };
            ret = written as i32;
        }
    }

    validation::unpin_range(process, buffer, size);
    Ok(ret)
}

pub(super) fn sys_seek(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;
    let position = args.next_u32()? as usize;

    if is_valid_fd(fd) {
        if let Some(file) = process.fd(fd) {
            let _guard = process.kernel.file_lock.lock();
            file.seek(position);
        }
    }
    // Return value unspecified; a word is stored regardless.
    Ok(0)
}

pub(super) fn sys_tell(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;

    if is_valid_fd(fd) {
        if let Some(file) = process.fd(fd) {
            let _guard = process.kernel.file_lock.lock();
            return Ok(file.tell() as i32);
        }
    }
    Ok(-1)
}

pub(super) fn sys_close(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;

    if is_valid_fd(fd) {
        process.close_fd(fd);
    }
    // Return value unspecified; a word is stored regardless.
    Ok(0)
}

/// Terminate unless the first buffer page may be written by user code.
fn buffer_writable(process: &Process, buffer: VirtAddr) -> Result<(), super::SysExit> {
    let entry = process.pages.lock().lookup(buffer);
    if let Some(entry) = entry {
        let st = entry.state();
        if matches!(st.backing, Backing::File(_)) && !st.writable {
            return Err(super::SysExit::Terminate(-1));
        }
    }
    Ok(())
}
