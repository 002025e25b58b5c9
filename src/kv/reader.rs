//! # Reader Snapshots
//!
//! A [`KvReader`] freezes `(root, chunk list, version)` at `begin_read` and
//! resolves every page against that copy, so it observes exactly the tree
//! of the commit it started at; later commits are invisible. Because the
//! chunk list is append-only and chunks are never unmapped before close,
//! the snapshot stays valid no matter how much the writer grows the file.
//!
//! Readers register themselves in a version-ordered min-heap so the writer
//! can ask for the oldest live snapshot. The current reclamation policy
//! (freed pages re-enter circulation only through the persistent free list
//! on a later commit) does not consult it, but the hook is what a
//! version-aware page reclaimer would build on.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::btree::{tree_get, Cmp, TreeIter};
use crate::storage::{page_bytes, Chunk, PagePtr, PageReader};

use super::store::Kv;
use super::TreeRead;

/// Live reader versions, ordered so the writer can find the oldest.
/// Removal is lazy: a version stays in the heap until it surfaces with a
/// zero live-count.
#[derive(Debug)]
pub(crate) struct ReaderSet {
    heap: BinaryHeap<Reverse<u64>>,
    live: HashMap<u64, usize>,
}

impl ReaderSet {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    pub fn add(&mut self, version: u64) {
        *self.live.entry(version).or_insert(0) += 1;
        self.heap.push(Reverse(version));
    }

    pub fn remove(&mut self, version: u64) {
        if let Some(count) = self.live.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.live.remove(&version);
            }
        }
    }

    pub fn oldest(&mut self) -> Option<u64> {
        while let Some(Reverse(version)) = self.heap.peek().copied() {
            if self.live.contains_key(&version) {
                return Some(version);
            }
            self.heap.pop();
        }
        None
    }
}

/// A read transaction: a frozen snapshot of one committed tree.
pub struct KvReader<'a> {
    kv: &'a Kv,
    root: PagePtr,
    pages: u64,
    version: u64,
    chunks: Vec<Arc<Chunk>>,
}

impl Kv {
    /// Takes a snapshot of the current committed state and registers the
    /// reader. Dropping the reader deregisters it.
    pub fn begin_read(&self) -> KvReader<'_> {
        let mut state = self.state.lock();
        let version = state.version;
        state.readers.add(version);
        KvReader {
            kv: self,
            root: state.root,
            pages: state.flushed,
            version,
            chunks: state.chunks.clone(),
        }
    }

    /// Ends a read transaction. Equivalent to dropping the reader.
    pub fn end_read(&self, reader: KvReader<'_>) {
        drop(reader);
    }
}

impl KvReader<'_> {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Point lookup against the snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree_get(self, self.root, key)
    }

    /// Seeks to the first key satisfying `cmp` relative to `key`.
    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Self>> {
        TreeIter::seek(self, self.root, key, cmp)
    }
}

impl PageReader for KvReader<'_> {
    fn page(&self, ptr: PagePtr) -> Result<Vec<u8>> {
        ensure!(
            ptr < self.pages,
            "bad page pointer: {} >= {} pages in snapshot",
            ptr,
            self.pages
        );
        page_bytes(&self.chunks, ptr)
    }
}

impl TreeRead for KvReader<'_> {
    fn tree_root(&self) -> PagePtr {
        self.root
    }
}

impl Drop for KvReader<'_> {
    fn drop(&mut self) {
        self.kv.state.lock().readers.remove(self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_set_tracks_oldest_live_version() {
        let mut set = ReaderSet::new();
        set.add(3);
        set.add(1);
        set.add(1);
        set.add(7);

        assert_eq!(set.oldest(), Some(1));

        set.remove(1);
        assert_eq!(set.oldest(), Some(1));

        set.remove(1);
        assert_eq!(set.oldest(), Some(3));

        set.remove(3);
        set.remove(7);
        assert_eq!(set.oldest(), None);
    }

    #[test]
    fn reader_registers_and_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Kv::open(dir.path().join("readers.db")).unwrap();

        {
            let _r1 = kv.begin_read();
            let _r2 = kv.begin_read();
            assert_eq!(kv.oldest_reader_version(), Some(0));
        }

        assert_eq!(kv.oldest_reader_version(), None);
    }
}
