//! # Write Transactions
//!
//! A [`KvTx`] is the one live writer. It snapshots `(root, free head, page
//! count)` at begin, buffers every page it touches in a private overlay,
//! and makes nothing visible until the commit publication step. Aborting
//! (or dropping) a transaction simply discards the overlay; the shared
//! state was never touched.
//!
//! ## The Overlay
//!
//! `updates` maps a page pointer to `Some(bytes)` for a pending write or
//! `None` for a pending free. Page resolution consults the overlay first
//! and falls through to the mmap, so the writer reads its own uncommitted
//! tree while concurrent readers keep reading the committed one.
//!
//! ## Allocation
//!
//! `new_page` reuses pointers from the persistent free list (counting how
//! many it popped in `nfree`) before appending past the committed page
//! count. The free list itself is only rewritten at commit, when the
//! popped count and the overlay's freed pointers are folded into it in one
//! `update` call.
//!
//! Reuse is gated on the reader set: a free page belonged to some tree
//! older than the current version, so while a reader snapshot from before
//! this version is live, the transaction appends instead of reusing and
//! the free list grows without touching its existing nodes. The pages stay
//! listed and are handed out once the old readers are gone.
//!
//! ## Commit Protocol
//!
//! 1. Fold freed pages into the free list, grow file and mmap, copy every
//!    overlay page into the mapping.
//! 2. `fsync`, the barrier: page data must be durable before the master
//!    page points at it.
//! 3. Write the master page (root, page count, free head).
//! 4. `fsync` again.
//! 5. Publish root / free head / page count under the state lock and bump
//!    the version.
//!
//! A failure in steps 1–2 rolls the transaction back; a crash between the
//! two fsyncs leaves the old master page pointing at the old tree, so
//! reopening recovers the pre-commit state.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::btree::{tree_delete, tree_get, tree_insert, Cmp, TreeIter};
use crate::storage::{
    page_bytes, write_page, Chunk, FreeList, FreePager, PagePtr, PageReader, PageStore, PAGE_SIZE,
};

use super::store::{Kv, WriterState};
use super::TreeRead;

/// Conflict behavior of [`KvTx::set_with_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or replace.
    Upsert,
    /// Fail with "key does not exist" unless the key is present.
    UpdateOnly,
    /// Fail with "key already exists" when the key is present.
    InsertOnly,
}

/// Outcome of a keyed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// A new key was added.
    pub added: bool,
    /// The tree changed (always true for a successful write).
    pub updated: bool,
    /// Value the key held before the write, if any.
    pub old: Option<Vec<u8>>,
}

pub struct KvTx<'a> {
    kv: &'a Kv,
    writer_state: MutexGuard<'a, WriterState>,
    chunks: Vec<Arc<Chunk>>,
    root: PagePtr,
    free_head: PagePtr,
    flushed: u64,
    nfree: usize,
    nappend: u64,
    updates: HashMap<PagePtr, Option<Vec<u8>>>,
    reuse_ok: bool,
}

impl Kv {
    /// Starts a write transaction, blocking until any previous writer
    /// finishes. The returned handle holds the writer lock until commit,
    /// abort, or drop.
    pub fn begin_write(&self) -> KvTx<'_> {
        let writer_state = self.writer.lock();
        let mut state = self.state.lock();
        // A page in the free list was part of some tree older than the
        // current version, so a reader pinned before this version may still
        // traverse it. Reissue free pages only when no such reader exists.
        let version = state.version;
        let reuse_ok = state.readers.oldest().map_or(true, |v| v >= version);
        KvTx {
            kv: self,
            chunks: state.chunks.clone(),
            root: state.root,
            free_head: state.free_head,
            flushed: state.flushed,
            nfree: 0,
            nappend: 0,
            updates: HashMap::new(),
            reuse_ok,
            writer_state,
        }
    }
}

impl KvTx<'_> {
    /// Point lookup, seeing this transaction's own uncommitted writes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree_get(self, self.root, key)
    }

    /// Seeks over the transaction's view of the tree.
    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Self>> {
        TreeIter::seek(self, self.root, key, cmp)
    }

    /// Unconditional upsert.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let root = self.root;
        self.root = tree_insert(self, root, key, val)?;
        Ok(())
    }

    /// Keyed write with conflict semantics; reports what changed and the
    /// prior value so callers can maintain secondary indexes.
    pub fn set_with_mode(&mut self, key: &[u8], val: &[u8], mode: WriteMode) -> Result<WriteResult> {
        let old = self.get(key)?;
        match mode {
            WriteMode::InsertOnly if old.is_some() => bail!("key already exists"),
            WriteMode::UpdateOnly if old.is_none() => bail!("key does not exist"),
            _ => {}
        }
        self.set(key, val)?;
        Ok(WriteResult {
            added: old.is_none(),
            updated: true,
            old,
        })
    }

    /// Deletes a key, returning its prior value when it existed.
    pub fn del(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let old = self.get(key)?;
        if old.is_none() {
            return Ok(None);
        }
        let root = self.root;
        if let Some(new_root) = tree_delete(self, root, key)? {
            self.root = new_root;
        }
        Ok(old)
    }

    /// Commits: flushes the overlay, fsyncs, writes the master page,
    /// fsyncs again, then publishes the new state. An I/O failure before
    /// the first fsync completes rolls the transaction back and leaves the
    /// shared state untouched.
    pub fn commit(mut self) -> Result<()> {
        if self.updates.is_empty() {
            return Ok(());
        }

        // Phase 1: data pages.
        if let Err(err) = self.write_pages().and_then(|()| self.kv.sync()) {
            self.updates.clear();
            return Err(err);
        }

        // Phase 2: master page.
        self.flushed += self.nappend;
        self.nappend = 0;
        self.kv.store_master(self.root, self.flushed, self.free_head)?;
        self.kv.sync()?;

        // Publication: the one moment new state becomes visible.
        let mut state = self.kv.state.lock();
        state.root = self.root;
        state.free_head = self.free_head;
        state.flushed = self.flushed;
        state.version += 1;
        drop(state);

        self.updates.clear();
        Ok(())
    }

    /// Discards the transaction. Nothing was published, so there is
    /// nothing to undo; dropping the handle has the same effect.
    pub fn abort(self) {}

    /// Folds freed pointers into the free list, grows the file and the
    /// mapping, and copies every pending page into the mmap.
    fn write_pages(&mut self) -> Result<()> {
        let freed: Vec<PagePtr> = self
            .updates
            .iter()
            .filter(|(_, page)| page.is_none())
            .map(|(ptr, _)| *ptr)
            .collect();

        let mut free_list = FreeList::new(self.free_head);
        let popped = self.nfree;
        let recycle = self.reuse_ok;
        free_list.update(self, popped, freed, recycle)?;
        self.free_head = free_list.head;
        self.nfree = 0;

        let npages = self.flushed + self.nappend;
        self.kv.extend_file(&mut self.writer_state, npages)?;
        self.kv.extend_mmap(&mut self.chunks, npages)?;

        for (ptr, page) in &self.updates {
            if let Some(data) = page {
                ensure!(
                    *ptr < npages,
                    "bad page pointer: {} >= {} allocated",
                    ptr,
                    npages
                );
                write_page(&self.chunks, *ptr, data)?;
            }
        }
        Ok(())
    }
}

impl PageReader for KvTx<'_> {
    fn page(&self, ptr: PagePtr) -> Result<Vec<u8>> {
        if let Some(entry) = self.updates.get(&ptr) {
            return entry
                .clone()
                .ok_or_else(|| eyre::eyre!("bad page pointer: {} was deallocated", ptr));
        }
        ensure!(
            ptr < self.flushed,
            "bad page pointer: {} >= {} flushed",
            ptr,
            self.flushed
        );
        page_bytes(&self.chunks, ptr)
    }
}

impl PageStore for KvTx<'_> {
    fn new_page(&mut self, page: Vec<u8>) -> Result<PagePtr> {
        ensure!(
            page.len() <= PAGE_SIZE,
            "page data too large: {} > {}",
            page.len(),
            PAGE_SIZE
        );
        let free_list = FreeList::new(self.free_head);
        let ptr = if self.reuse_ok && self.nfree < free_list.total(self)? {
            let ptr = free_list.get(self, self.nfree)?;
            self.nfree += 1;
            ptr
        } else {
            let ptr = self.flushed + self.nappend;
            self.nappend += 1;
            ptr
        };
        self.updates.insert(ptr, Some(page));
        Ok(ptr)
    }

    fn free_page(&mut self, ptr: PagePtr) {
        self.updates.insert(ptr, None);
    }
}

impl FreePager for KvTx<'_> {
    fn page(&self, ptr: PagePtr) -> Result<Vec<u8>> {
        PageReader::page(self, ptr)
    }

    fn append(&mut self, page: Vec<u8>) -> Result<PagePtr> {
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        self.updates.insert(ptr, Some(page));
        Ok(ptr)
    }

    fn reuse(&mut self, ptr: PagePtr, page: Vec<u8>) {
        self.updates.insert(ptr, Some(page));
    }
}

impl TreeRead for KvTx<'_> {
    fn tree_root(&self) -> PagePtr {
        self.root
    }
}
