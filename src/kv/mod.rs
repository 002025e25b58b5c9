//! # Transactional Key-Value Store
//!
//! The transaction engine over the paged storage substrate: a single-writer
//! / many-reader MVCC scheme. One write transaction at a time mutates a
//! private copy-on-write view of the tree; any number of readers hold
//! frozen snapshots of previously committed versions.
//!
//! Durability is a two-fsync protocol: data pages are flushed and synced
//! before the 32-byte master page is rewritten and synced, so the master
//! page always points at a complete tree no matter where a crash lands.
//!
//! - `store`: the `Kv` handle, shared state, file and mmap growth
//! - `tx`: the write transaction, page overlay, commit/abort
//! - `reader`: reader snapshots and the version-ordered reader set

mod reader;
mod store;
mod tx;

pub use reader::KvReader;
pub use store::Kv;
pub use tx::{KvTx, WriteMode, WriteResult};

use eyre::Result;

use crate::btree::{tree_get, Cmp, TreeIter};
use crate::storage::{PagePtr, PageReader};

/// A handle that can read one consistent tree: either a reader snapshot or
/// the write transaction itself (which sees its own uncommitted changes).
/// Record-layer reads are generic over this, so the same code serves both.
pub trait TreeRead: PageReader + Sized {
    /// Root of the tree this handle observes.
    fn tree_root(&self) -> PagePtr;

    /// Point lookup.
    fn tree_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree_get(self, self.tree_root(), key)
    }

    /// Seek to the first key satisfying `cmp` relative to `key`.
    fn tree_seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Self>> {
        TreeIter::seek(self, self.tree_root(), key, cmp)
    }
}
