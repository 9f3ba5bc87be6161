//! Flat in-memory file store and file handles.
//!
//! The store maps names to nodes; a node is a growable byte vector plus a
//! deny-write count. A [`File`] is an open handle with its own seek
//! position; `reopen` yields an independent handle on the same node, which
//! is what backs memory mappings of already-open files.
//!
//! Executables are opened deny-write for the lifetime of the handle: every
//! `write_at` against such a node reports a short write, which is how the
//! on-disk image stays bit-identical no matter what user code does to the
//! mapped pages.
//!
//! Callers serialize access with the kernel's global file lock; the locks
//! in here only keep the data structures sound.

pub mod blockdev;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

/// Standard file descriptors
pub const STDIN_FILENO: usize = 0;
pub const STDOUT_FILENO: usize = 1;

/// A named byte store.
pub struct FileNode {
    data: RwLock<Vec<u8>>,
    /// Open handles that currently deny writes (executables).
    deny_writes: AtomicU32,
}

impl FileNode {
    fn new(initial_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; initial_size]),
            deny_writes: AtomicU32::new(0),
        }
    }

    fn writes_denied(&self) -> bool {
        self.deny_writes.load(Ordering::Acquire) != 0
    }
}

/// An open file: a node plus an independent seek position.
pub struct File {
    node: Arc<FileNode>,
    pos: Mutex<usize>,
    denies: AtomicBool,
}

impl File {
    fn new(node: Arc<FileNode>) -> Self {
        Self {
            node,
            pos: Mutex::new(0),
            denies: AtomicBool::new(false),
        }
    }

    /// Independent handle on the same node, positioned at the start.
    pub fn reopen(&self) -> File {
        File::new(self.node.clone())
    }

    /// Two handles name the same underlying node.
    pub fn same_node(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn length(&self) -> usize {
        self.node.data.read().len()
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    /// Read from the current position, advancing it. Returns the byte count,
    /// 0 at end of file.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.read_at(buf, *pos);
        *pos += n;
        n
    }

    /// Read at an explicit offset without touching the position.
    pub fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        let data = self.node.data.read();
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        n
    }

    /// Write at the current position, advancing it and growing the node if
    /// needed. A deny-write node reports 0 bytes written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.write_at(buf, *pos);
        *pos += n;
        n
    }

    /// Write at an explicit offset without touching the position.
    pub fn write_at(&self, buf: &[u8], ofs: usize) -> usize {
        if self.node.writes_denied() {
            return 0;
        }
        let mut data = self.node.data.write();
        let end = ofs + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[ofs..end].copy_from_slice(buf);
        buf.len()
    }

    /// Deny writes to the underlying node while this handle is open.
    pub fn deny_write(&self) {
        if !self.denies.swap(true, Ordering::AcqRel) {
            self.node.deny_writes.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Re-allow writes denied through this handle.
    pub fn allow_write(&self) {
        if self.denies.swap(false, Ordering::AcqRel) {
            self.node.deny_writes.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}

/// Name -> node store.
pub struct FileStore {
    nodes: RwLock<BTreeMap<String, Arc<FileNode>>>,
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a file of `initial_size` zero bytes. False if the name exists.
    pub fn create(&self, name: &str, initial_size: usize) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(name) {
            return false;
        }
        nodes.insert(String::from(name), Arc::new(FileNode::new(initial_size)));
        true
    }

    /// Remove a file. Open handles keep their node alive; the name is gone
    /// immediately.
    pub fn remove(&self, name: &str) -> bool {
        self.nodes.write().remove(name).is_some()
    }

    pub fn open(&self, name: &str) -> Option<File> {
        let node = self.nodes.read().get(name).cloned()?;
        Some(File::new(node))
    }

    /// Replace a file's contents wholesale (test setup and program loading).
    pub fn write_file(&self, name: &str, contents: &[u8]) {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry(String::from(name))
            .or_insert_with(|| Arc::new(FileNode::new(0)));
        *node.data.write() = contents.to_vec();
    }
}
