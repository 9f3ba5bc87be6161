//! End-to-end virtual memory scenarios: lazy loading, swap round trips,
//! writable-executable demotion, and the cross-subsystem accounting
//! invariants.

use std::sync::Arc;

use opal_kernel::kernel::{Kernel, KernelConfig};
use opal_kernel::mm::page::Backing;
use opal_kernel::mm::{fault, VirtAddr, PAGE_SIZE};
use opal_kernel::process::Process;

fn kernel(user_frames: usize, swap_slots: usize) -> Arc<Kernel> {
    Kernel::new(KernelConfig {
        user_frames,
        swap_slots,
    })
}

/// Check the cross-subsystem invariants: the frame table is in bijection
/// with resident pages, no frame appears twice, hardware mappings agree,
/// and swap accounting matches the entries parked in swap.
fn assert_invariants(kernel: &Kernel, processes: &[&Process]) {
    let resident = kernel.frames.resident();

    let mut frames: Vec<u32> = resident.iter().map(|(f, _)| f.as_u32()).collect();
    frames.sort_unstable();
    let before = frames.len();
    frames.dedup();
    assert_eq!(before, frames.len(), "a frame appears in two table entries");

    let mut resident_entries = 0;
    let mut swapped_entries = 0;
    for process in processes {
        for entry in process.pages.lock().entries() {
            match entry.frame() {
                Some(frame) => {
                    resident_entries += 1;
                    assert_eq!(
                        process.page_dir.lookup(entry.upage()),
                        Some(frame),
                        "hardware mapping disagrees for {}",
                        entry.upage()
                    );
                    assert_eq!(
                        resident
                            .iter()
                            .filter(|(f, u)| *f == frame && *u == entry.upage())
                            .count(),
                        1,
                        "resident page must own exactly one table entry"
                    );
                    assert!(!entry.in_swap(), "resident page cannot also be in swap");
                }
                None => {
                    assert_eq!(
                        process.page_dir.lookup(entry.upage()),
                        None,
                        "non-resident page still mapped"
                    );
                    if entry.in_swap() {
                        swapped_entries += 1;
                    }
                }
            }
        }
    }
    assert_eq!(
        resident.len(),
        resident_entries,
        "frame table and resident pages must be in bijection"
    );
    assert_eq!(
        kernel.swap.used_slots(),
        swapped_entries,
        "swap bitmap population must equal pages parked in swap"
    );
}

/// S1: a 12 KiB read-only text segment loads page by page, on demand.
#[test]
fn lazy_text_segment_loads_page_by_page() {
    let kernel = kernel(16, 16);
    let mut image = vec![0u8; 3 * PAGE_SIZE];
    for (i, byte) in image.iter_mut().enumerate() {
        *byte = (i / PAGE_SIZE) as u8 + 1;
    }
    kernel.fs.write_file("prog", &image);

    let process = Process::new(&kernel, "prog");
    let exe = Arc::new(kernel.fs.open("prog").expect("open executable"));
    exe.deny_write();
    let base = VirtAddr::new(0x0804_8000);
    process
        .map_segment(&exe, 0, base, 3 * PAGE_SIZE, 0, false)
        .expect("segment install");

    assert_eq!(kernel.frames.len(), 0, "nothing resident right after load");
    assert_eq!(process.pages.lock().len(), 3);

    let esp = VirtAddr::new(0xBFFF_FFFC);
    let mut byte = [0u8; 1];
    process
        .user_read(esp, base, &mut byte)
        .expect("first instruction fetch");
    assert_eq!(byte[0], 1);
    assert_eq!(kernel.frames.len(), 1, "one frame after entering page 0");

    for page in 0..3u32 {
        process
            .user_read(esp, base.offset(page * PAGE_SIZE as u32 + 7), &mut byte)
            .expect("touch");
        assert_eq!(byte[0], page as u8 + 1);
    }
    assert_eq!(kernel.frames.len(), 3, "all three pages resident");
    assert_invariants(&kernel, &[process.as_ref()]);
}

/// A short read while materializing a file page releases the frame and
/// reports the failure.
#[test]
fn truncated_backing_file_fails_the_load() {
    let kernel = kernel(8, 8);
    kernel.fs.write_file("prog", &[7u8; 100]);

    let process = Process::new(&kernel, "prog");
    let exe = Arc::new(kernel.fs.open("prog").expect("open"));
    // The segment claims a full page although the file holds 100 bytes.
    process
        .map_segment(&exe, 0, VirtAddr::new(0x0804_8000), PAGE_SIZE, 0, false)
        .expect("install");

    let mut byte = [0u8; 1];
    let esp = VirtAddr::new(0xBFFF_FFFC);
    assert!(process
        .user_read(esp, VirtAddr::new(0x0804_8000), &mut byte)
        .is_err());
    assert_eq!(kernel.frames.len(), 0, "failed load must release its frame");
    assert_eq!(
        kernel.pool.free_count(),
        kernel.pool.total_frames(),
        "no frame leaked"
    );
}

/// S3: 256 anonymous pages with distinct patterns survive a full trip
/// through swap under memory pressure.
#[test]
fn swap_round_trip_preserves_patterns() {
    let kernel = kernel(64, 512);
    let process = Process::new(&kernel, "swapper");

    let pages = 256u32;
    let lowest = 0xC000_0000u32 - pages * PAGE_SIZE as u32;

    // Fill P1..P256, stack pointer riding down with the writes.
    for i in 0..pages {
        let addr = VirtAddr::new(lowest + i * PAGE_SIZE as u32);
        let pattern = [(i % 251) as u8 + 1; 16];
        process
            .user_write(VirtAddr::new(lowest), addr, &pattern)
            .expect("fill");
    }
    // Only 64 frames exist, so most pages are in swap already; push the
    // rest out with fresh allocations below.
    for i in 1..=64u32 {
        let addr = VirtAddr::new(lowest - i * PAGE_SIZE as u32);
        process
            .user_write(addr, addr, &[0xEE; 4])
            .expect("pressure");
    }

    assert!(
        kernel.swap.used_slots() >= pages as usize - 64,
        "pressure must have pushed the patterned pages to swap"
    );
    assert_invariants(&kernel, &[process.as_ref()]);

    // Re-touch every patterned page and verify its bytes.
    for i in 0..pages {
        let addr = VirtAddr::new(lowest + i * PAGE_SIZE as u32);
        let mut buf = [0u8; 16];
        process
            .user_read(VirtAddr::new(lowest), addr, &mut buf)
            .expect("re-touch");
        assert_eq!(
            buf,
            [(i % 251) as u8 + 1; 16],
            "page {} lost its pattern in the swap round trip",
            i
        );
    }
    assert_invariants(&kernel, &[process.as_ref()]);
}

/// A clean anonymous page is discarded on eviction and zero-fills on the
/// next fault instead of wasting a swap slot.
#[test]
fn clean_anonymous_pages_skip_swap() {
    let kernel = kernel(2, 8);
    let process = Process::new(&kernel, "p");

    let a = VirtAddr::new(0xBFFF_F000);
    fault::grow_stack(&process, a, false).expect("page a");
    // Touch nothing in `a`: it stays clean. Evict it with two more pages.
    for addr in [0xBFFF_E000u32, 0xBFFF_D000] {
        let addr = VirtAddr::new(addr);
        process.user_write(addr, addr, &[1; 4]).expect("pressure");
    }

    let entry = process.pages.lock().lookup(a).expect("entry");
    assert!(entry.frame().is_none(), "page a was evicted");
    assert!(!entry.in_swap(), "clean page must not consume a swap slot");

    let mut buf = [0xFFu8; 8];
    process
        .user_read(VirtAddr::new(0xBFFF_D000), a, &mut buf)
        .expect("re-fault");
    assert_eq!(buf, [0u8; 8], "discarded page zero-fills on return");
}

/// S5: a writable executable page, once dirtied and evicted, is served
/// from swap from then on; the executable file never changes.
#[test]
fn writable_file_page_demotes_to_swap() {
    let kernel = kernel(4, 16);
    let image = [0x11u8; PAGE_SIZE];
    kernel.fs.write_file("prog", &image);

    let process = Process::new(&kernel, "prog");
    let exe = Arc::new(kernel.fs.open("prog").expect("open"));
    exe.deny_write();
    let data_page = VirtAddr::new(0x0804_9000);
    process
        .map_segment(&exe, 0, data_page, PAGE_SIZE, 0, true)
        .expect("writable data segment");

    let esp = VirtAddr::new(0xBFFF_FFFC);
    process
        .user_write(esp, data_page, b"user!")
        .expect("dirty the data page");

    // Memory pressure: the dirty file page cannot be cleaned (the image is
    // open deny-write), so eviction promotes it and parks it in swap.
    for i in 1..=8u32 {
        let addr = VirtAddr::new(0xC000_0000 - i * PAGE_SIZE as u32);
        process.user_write(addr, addr, &[0xEE; 4]).expect("pressure");
    }

    let entry = process.pages.lock().lookup(data_page).expect("entry");
    assert!(entry.frame().is_none(), "data page must have been evicted");
    assert!(entry.in_swap(), "dirty executable page must live in swap now");
    assert!(
        matches!(entry.state().backing, Backing::Code { .. }),
        "backing must have been promoted to anonymous"
    );

    // Re-fault: the user's bytes come back from swap, not from the file.
    let mut buf = [0u8; 5];
    process
        .user_read(esp, data_page, &mut buf)
        .expect("re-fault from swap");
    assert_eq!(&buf, b"user!");

    // The executable on disk is bit-identical.
    let check = kernel.fs.open("prog").expect("reopen");
    let mut on_disk = vec![0u8; PAGE_SIZE];
    assert_eq!(check.read_at(&mut on_disk, 0), PAGE_SIZE);
    assert_eq!(on_disk.as_slice(), image.as_slice(), "executable modified");

    assert_invariants(&kernel, &[process.as_ref()]);
}

/// A read-only text page is dropped on eviction and reloaded from the
/// file, never touching swap.
#[test]
fn read_only_text_reloads_from_file() {
    let kernel = kernel(2, 8);
    let mut image = vec![0u8; PAGE_SIZE];
    image[123] = 0x5C;
    kernel.fs.write_file("prog", &image);

    let process = Process::new(&kernel, "prog");
    let exe = Arc::new(kernel.fs.open("prog").expect("open"));
    exe.deny_write();
    let text = VirtAddr::new(0x0804_8000);
    process
        .map_segment(&exe, 0, text, PAGE_SIZE, 0, false)
        .expect("text segment");

    let esp = VirtAddr::new(0xBFFF_FFFC);
    let mut byte = [0u8; 1];
    process
        .user_read(esp, text.offset(123), &mut byte)
        .expect("first load");
    assert_eq!(byte[0], 0x5C);

    for addr in [0xBFFF_F000u32, 0xBFFF_E000] {
        let addr = VirtAddr::new(addr);
        process.user_write(addr, addr, &[1; 4]).expect("pressure");
    }

    let entry = process.pages.lock().lookup(text).expect("entry");
    assert!(entry.frame().is_none());
    assert!(!entry.in_swap(), "clean text page must not reach swap");
    assert!(
        matches!(entry.state().backing, Backing::File(_)),
        "text page keeps its file backing"
    );

    process
        .user_read(esp, text.offset(123), &mut byte)
        .expect("reload from file");
    assert_eq!(byte[0], 0x5C);
}

/// User writes through a read-only mapping are refused.
#[test]
fn write_to_read_only_text_is_refused() {
    let kernel = kernel(4, 8);
    kernel.fs.write_file("prog", &[0u8; PAGE_SIZE]);

    let process = Process::new(&kernel, "prog");
    let exe = Arc::new(kernel.fs.open("prog").expect("open"));
    exe.deny_write();
    let text = VirtAddr::new(0x0804_8000);
    process
        .map_segment(&exe, 0, text, PAGE_SIZE, 0, false)
        .expect("text segment");

    let esp = VirtAddr::new(0xBFFF_FFFC);
    assert!(process.user_write(esp, text, &[1]).is_err());
}

/// Mixed workload sweep: file pages, mmap pages, and stack pages under
/// pressure keep every invariant intact.
#[test]
fn mixed_pressure_keeps_invariants() {
    let kernel = kernel(8, 64);
    kernel.fs.write_file("prog", &vec![3u8; 2 * PAGE_SIZE]);
    kernel.fs.write_file("data", &vec![9u8; 3 * PAGE_SIZE]);

    let process = Process::new(&kernel, "mixed");
    let exe = Arc::new(kernel.fs.open("prog").expect("open prog"));
    exe.deny_write();
    process
        .map_segment(&exe, 0, VirtAddr::new(0x0804_8000), 2 * PAGE_SIZE, 0, false)
        .expect("text");

    let mapped = Arc::new(kernel.fs.open("data").expect("open data").reopen());
    process
        .pages
        .lock()
        .install_mmap(mapped, VirtAddr::new(0x1000_0000), 3 * PAGE_SIZE)
        .expect("mmap pages");

    let esp = VirtAddr::new(0xBFFF_FFFC);
    let mut buf = [0u8; 4];
    for round in 0..3 {
        for page in 0..2u32 {
            process
                .user_read(
                    esp,
                    VirtAddr::new(0x0804_8000 + page * PAGE_SIZE as u32),
                    &mut buf,
                )
                .expect("text touch");
        }
        for page in 0..3u32 {
            let addr = VirtAddr::new(0x1000_0000 + page * PAGE_SIZE as u32);
            process
                .user_write(esp, addr, &[round as u8; 4])
                .expect("mmap write");
        }
        for page in 0..12u32 {
            let addr = VirtAddr::new(0xC000_0000u32 - (page + 1) * PAGE_SIZE as u32);
            process
                .user_write(addr, addr, &[round as u8; 4])
                .expect("stack write");
        }
        assert_invariants(&kernel, &[process.as_ref()]);
    }

    process.exit(0);
    assert_eq!(kernel.frames.len(), 0);
    assert_eq!(kernel.swap.used_slots(), 0);
    assert_eq!(kernel.pool.free_count(), kernel.pool.total_frames());
}
