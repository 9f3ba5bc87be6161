//! Raw physical user-frame pool.
//!
//! Bitmap allocator over an arena of page-sized frames. This is the narrow
//! raw-allocator interface the rest of the subsystem consumes; the frame
//! table layers residency tracking and eviction on top of it.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{AllocFlags, FrameNumber, PAGE_SIZE};

/// Fixed-size pool of user frames.
pub struct UserPool {
    /// Bitmap tracking free frames (1 = free, 0 = allocated)
    bitmap: Mutex<Vec<u64>>,
    /// Frame contents, one page-sized buffer per frame
    frames: Vec<Mutex<Box<[u8]>>>,
    /// Total frames managed
    total_frames: usize,
    /// Free frame count
    free_frames: AtomicUsize,
}

impl UserPool {
    pub fn new(frame_count: usize) -> Self {
        let words = frame_count.div_ceil(64);
        let mut bitmap = vec![u64::MAX; words];
        // Clear the tail bits beyond frame_count so they are never handed out.
        let tail = frame_count % 64;
        if tail != 0 {
            bitmap[words - 1] = (1u64 << tail) - 1;
        }

        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            frames.push(Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()));
        }

        Self {
            bitmap: Mutex::new(bitmap),
            frames,
            total_frames: frame_count,
            free_frames: AtomicUsize::new(frame_count),
        }
    }

    /// Allocate a single frame.
    ///
    /// `AllocFlags::ZERO` scrubs the frame before it is handed out; frames
    /// returned by [`free`](Self::free) keep their stale contents otherwise.
    pub fn alloc(&self, flags: AllocFlags) -> KernelResult<FrameNumber> {
        let frame = {
            let mut bitmap = self.bitmap.lock();
            let mut found = None;
            for (word_idx, word) in bitmap.iter_mut().enumerate() {
                if *word == 0 {
                    continue;
                }
                let bit = word.trailing_zeros() as usize;
                *word &= !(1 << bit);
                found = Some(word_idx * 64 + bit);
                break;
            }
            match found {
                Some(idx) => FrameNumber::new(idx as u32),
                None => {
                    return Err(KernelError::OutOfMemory {
                        requested: 1,
                        available: 0,
                    })
                }
            }
        };
        self.free_frames.fetch_sub(1, Ordering::Release);

        if flags.contains(AllocFlags::ZERO) {
            self.zero(frame)?;
        }
        Ok(frame)
    }

    /// Free a previously allocated frame. Freeing a free frame is detected
    /// and reported.
    pub fn free(&self, frame: FrameNumber) -> KernelResult<()> {
        if frame.index() >= self.total_frames {
            return Err(KernelError::InvalidFrame {
                frame: frame.as_u32(),
            });
        }
        let word_idx = frame.index() / 64;
        let bit_idx = frame.index() % 64;

        let mut bitmap = self.bitmap.lock();
        if bitmap[word_idx] & (1 << bit_idx) != 0 {
            // Double free detection
            return Err(KernelError::InvalidFrame {
                frame: frame.as_u32(),
            });
        }
        bitmap[word_idx] |= 1 << bit_idx;
        drop(bitmap);

        self.free_frames.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Copy bytes out of a frame.
    pub fn read(&self, frame: FrameNumber, offset: usize, dst: &mut [u8]) -> KernelResult<()> {
        let page = self.page(frame)?.lock();
        let end = offset + dst.len();
        debug_assert!(end <= PAGE_SIZE, "frame read past page end");
        dst.copy_from_slice(&page[offset..end]);
        Ok(())
    }

    /// Copy bytes into a frame.
    pub fn write(&self, frame: FrameNumber, offset: usize, src: &[u8]) -> KernelResult<()> {
        let mut page = self.page(frame)?.lock();
        let end = offset + src.len();
        debug_assert!(end <= PAGE_SIZE, "frame write past page end");
        page[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Fill a frame with zero bytes.
    pub fn zero(&self, frame: FrameNumber) -> KernelResult<()> {
        let mut page = self.page(frame)?.lock();
        page.fill(0);
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free_frames.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    fn page(&self, frame: FrameNumber) -> KernelResult<&Mutex<Box<[u8]>>> {
        self.frames
            .get(frame.index())
            .ok_or(KernelError::InvalidFrame {
                frame: frame.as_u32(),
            })
    }
}
