//! Memory-mapping system calls.

use alloc::sync::Arc;

use super::{ArgStream, SysResult};
use crate::mm::MAX_FILES;
use crate::process::{MmapRegion, Process};

pub(super) fn sys_mmap(process: &Process, args: &mut ArgStream) -> SysResult {
    let fd = args.next_u32()? as usize;
    if fd >= MAX_FILES {
        return Ok(-1);
    }

    let addr = args.next_ptr()?;
    if addr.as_u32() == 0 || !addr.is_page_aligned() {
        return Ok(-1);
    }

    let Some(open_file) = process.fd(fd) else {
        return Ok(-1);
    };

    // The mapping lives on its own handle so closing the fd does not tear
    // the mapping down.
    let file = Arc::new(open_file.reopen());
    let length = {
        let _guard = process.kernel.file_lock.lock();
        file.length()
    };

    let anchor = match process
        .pages
        .lock()
        .install_mmap(file.clone(), addr, length)
    {
        Ok(entry) => entry.upage(),
        Err(_) => return Ok(-1),
    };

    match process.install_mapping(MmapRegion {
        anchor,
        file: file.clone(),
    }) {
        Some(id) => Ok(id as i32),
        None => {
            // Mapping-id table full: undo the pages, report failure.
            process.unmap_region(anchor, &file);
            Ok(-1)
        }
    }
}

pub(super) fn sys_munmap(process: &Process, args: &mut ArgStream) -> SysResult {
    let id = args.next_u32()? as usize;

    if id < MAX_FILES {
        if let Some(region) = process.take_mapping(id) {
            process.unmap_region(region.anchor, &region.file);
        }
    }
    // Return value unspecified; a word is stored regardless.
    Ok(0)
}
