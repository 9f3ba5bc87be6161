//! Console device backing fd 0 and fd 1.
//!
//! Input is a byte queue the embedder fills; output is captured so test
//! harnesses can assert on it.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

pub struct Console {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(VecDeque::new()),
            output: Mutex::new(Vec::new()),
        }
    }

    /// Next input byte; 0 when the queue is drained.
    pub fn getc(&self) -> u8 {
        self.input.lock().pop_front().unwrap_or(0)
    }

    pub fn putc(&self, byte: u8) {
        self.output.lock().push(byte);
    }

    pub fn write_bytes(&self, bytes: &[u8]) {
        self.output.lock().extend_from_slice(bytes);
    }

    /// Queue bytes for subsequent stdin reads.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Drain everything written so far.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }
}
