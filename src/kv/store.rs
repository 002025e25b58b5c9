//! # Key-Value Store
//!
//! `Kv` owns the backing file, the mmap chunk list and the shared durable
//! state (tree root, free-list head, page count, version). It hands out
//! write transactions ([`super::KvTx`]) and reader snapshots
//! ([`super::KvReader`]); all tree traffic flows through those.
//!
//! ## Locking
//!
//! - `writer`: held for the entire life of a write transaction. Acquiring
//!   it blocks until the previous writer commits or aborts. It also guards
//!   the file-growth bookkeeping, which only the writer touches.
//! - `state`: a short-critical-section mutex over everything a reader
//!   snapshot copies (root, free head, page count, version, chunk list,
//!   reader set). It is held only in `begin_read`, reader drop, and the
//!   commit publication step, so readers never wait on writer I/O.
//!
//! ## Growth
//!
//! `extend_file` grows the logical file in 1/8 increments (at least one
//! page) with `fallocate`, falling back to `ftruncate` where unsupported.
//! `extend_mmap` appends a chunk sized to the current mapped total, so the
//! mapped region doubles each time and existing chunks stay put.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::storage::{
    map_chunk, Chunk, MasterPage, PagePtr, MASTER_PAGE_SIZE, MIN_MMAP_SIZE, PAGE_SIZE,
};

use super::reader::ReaderSet;

/// Writer-only bookkeeping, protected by the writer mutex.
#[derive(Debug)]
pub(crate) struct WriterState {
    pub file_size: u64,
}

/// State shared between the writer and reader snapshots.
#[derive(Debug)]
pub(crate) struct Shared {
    pub root: PagePtr,
    pub free_head: PagePtr,
    pub flushed: u64,
    pub version: u64,
    pub chunks: Vec<Arc<Chunk>>,
    pub readers: ReaderSet,
}

#[derive(Debug)]
pub struct Kv {
    #[allow(dead_code)]
    path: PathBuf,
    pub(crate) file: File,
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) state: Mutex<Shared>,
}

impl Kv {
    /// Opens the backing file, creating it when absent, and loads the
    /// master page. A fresh file starts with one reserved page (the master
    /// page itself) and an empty tree.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let mut map_len = MIN_MMAP_SIZE;
        while map_len < file_size {
            map_len *= 2;
        }
        let chunk = Arc::new(map_chunk(&file, 0, map_len)?);

        let (root, flushed, free_head) = if file_size == 0 {
            (0, 1, 0)
        } else {
            let page0 = chunk.page_slice(0)?;
            let master = MasterPage::load(&page0[..MASTER_PAGE_SIZE], file_size)?;
            (
                master.tree_root(),
                master.pages_allocated(),
                master.free_head(),
            )
        };

        Ok(Self {
            path,
            file,
            writer: Mutex::new(WriterState { file_size }),
            state: Mutex::new(Shared {
                root,
                free_head,
                flushed,
                version: 0,
                chunks: vec![chunk],
                readers: ReaderSet::new(),
            }),
        })
    }

    /// Closes the store: every chunk is unmapped and the file handle is
    /// released when `self` drops. Outstanding readers or writers keep it
    /// alive through the borrow checker, so a close can never race them.
    pub fn close(self) {}

    /// Grows the logical file to cover at least `npages` pages, in 1/8
    /// increments. Never truncates.
    pub(crate) fn extend_file(&self, ws: &mut WriterState, npages: u64) -> Result<()> {
        let mut file_pages = ws.file_size / PAGE_SIZE as u64;
        if file_pages >= npages {
            return Ok(());
        }
        while file_pages < npages {
            let inc = (file_pages / 8).max(1);
            file_pages += inc;
        }

        let file_size = file_pages * PAGE_SIZE as u64;
        // SAFETY: plain fallocate on a file descriptor this struct owns.
        let ret = unsafe { libc::fallocate(self.file.as_raw_fd(), 0, 0, file_size as libc::off_t) };
        if ret != 0 {
            self.file
                .set_len(file_size)
                .wrap_err("fallocate database file")?;
        }
        ws.file_size = file_size;
        Ok(())
    }

    /// Appends mmap chunks until at least `npages` pages are mapped. Each
    /// new chunk is as large as everything mapped so far. The shared chunk
    /// list and the transaction's own list both receive the new chunk.
    pub(crate) fn extend_mmap(&self, tx_chunks: &mut Vec<Arc<Chunk>>, npages: u64) -> Result<()> {
        let mut total: u64 = tx_chunks.iter().map(|c| c.len()).sum();
        while total < npages * PAGE_SIZE as u64 {
            let chunk = Arc::new(map_chunk(&self.file, total / PAGE_SIZE as u64, total)?);
            self.state.lock().chunks.push(chunk.clone());
            tx_chunks.push(chunk);
            total *= 2;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("fsync")
    }

    pub(crate) fn store_master(&self, root: PagePtr, flushed: u64, free_head: PagePtr) -> Result<()> {
        MasterPage::new(root, flushed, free_head).store(&self.file)
    }

    /// Version published by the most recent commit.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Pages allocated as of the last commit (the master page included).
    pub fn pages_allocated(&self) -> u64 {
        self.state.lock().flushed
    }

    /// Version of the oldest live reader, if any. Pages freed at or after
    /// this version may still be observed through that reader's snapshot.
    pub fn oldest_reader_version(&self) -> Option<u64> {
        self.state.lock().readers.oldest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let kv = Kv::open(&path).unwrap();

        assert_eq!(kv.pages_allocated(), 1);
        assert_eq!(kv.version(), 0);
        assert!(path.exists());
    }

    #[test]
    fn open_rejects_unaligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.db");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        let err = Kv::open(&path).unwrap_err();

        assert!(err.to_string().contains("not a multiple of page size"));
    }

    #[test]
    fn open_rejects_garbage_master_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xFFu8; PAGE_SIZE]).unwrap();

        let err = Kv::open(&path).unwrap_err();

        assert!(err.to_string().contains("bad signature"));
    }
}
