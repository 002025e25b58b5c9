//! # Mmap Chunk List
//!
//! This module implements the memory-mapping strategy behind the pager: the
//! backing file is mapped as a list of contiguous chunks, each covering a
//! range of pages. The first chunk is at least 64 MiB; every further chunk
//! doubles the mapped total by mapping `[total, 2 * total)`.
//!
//! ## Why a chunk list instead of remapping
//!
//! Remapping on growth (the usual `mremap`/unmap-and-map-again dance) moves
//! the region, invalidating every outstanding pointer into it. AtomixDB's
//! readers hold snapshots of the chunk list for the lifetime of a read
//! transaction, possibly across many writer commits, so the mapping must be
//! stable: chunks are only ever appended, and nothing is unmapped before the
//! store is closed. A chunk may extend past the end of the file; the file is
//! grown before any page in the tail is written or read.
//!
//! ## Safety Model
//!
//! Pages are accessed through raw pointers rather than `&mut` borrows of an
//! `MmapMut`, because the writer copies committed pages into the mapping
//! while concurrent readers hold live references into other pages of the
//! same chunk. The aliasing discipline comes from copy-on-write: a live page
//! is never modified in place. Every logical update writes a new page; the
//! old pointer is only recycled through the free list after the commit that
//! replaced it, and the free list only reissues it in a later transaction.
//! Bounds are checked on every access.

use std::fs::File;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

use super::{PagePtr, PAGE_SIZE};

/// One contiguous memory-mapped range of the backing file.
#[derive(Debug)]
pub struct Chunk {
    raw: MmapRaw,
    start_page: u64,
    pages: u64,
}

impl Chunk {
    /// First page covered by this chunk.
    pub fn start_page(&self) -> u64 {
        self.start_page
    }

    /// Number of pages covered by this chunk.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Size of the mapped range in bytes.
    pub fn len(&self) -> u64 {
        self.pages * PAGE_SIZE as u64
    }

    /// Returns the bytes of the page at `index` (chunk-relative).
    ///
    /// The returned slice stays valid for the lifetime of the chunk: chunks
    /// are never unmapped or moved before the store closes.
    pub fn page_slice(&self, index: u64) -> Result<&[u8]> {
        ensure!(
            index < self.pages,
            "bad page pointer: chunk page {} out of bounds ({} pages)",
            index,
            self.pages
        );
        let offset = index as usize * PAGE_SIZE;
        // SAFETY: the range [offset, offset + PAGE_SIZE) is inside the
        // mapping (bounds checked above), and copy-on-write guarantees no
        // concurrent in-place mutation of a reachable page.
        Ok(unsafe { std::slice::from_raw_parts(self.raw.as_ptr().add(offset), PAGE_SIZE) })
    }

    /// Copies `data` into the page at `index` (chunk-relative).
    ///
    /// Only the committing writer calls this, and only for pages that no
    /// reader snapshot can reach (freshly appended pages or free-list
    /// reissues from an earlier commit).
    pub fn write_page(&self, index: u64, data: &[u8]) -> Result<()> {
        ensure!(
            index < self.pages,
            "bad page pointer: chunk page {} out of bounds ({} pages)",
            index,
            self.pages
        );
        ensure!(
            data.len() <= PAGE_SIZE,
            "page data too large: {} > {}",
            data.len(),
            PAGE_SIZE
        );
        let offset = index as usize * PAGE_SIZE;
        // SAFETY: destination range is inside the mapping (bounds checked
        // above). The single-writer lock serialises all calls, and the COW
        // discipline keeps this page invisible to every reader snapshot.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.raw.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

/// Maps `len` bytes of `file` starting at byte offset `start_page * PAGE_SIZE`.
///
/// The mapping may extend past the current end of the file; pages in the
/// tail must not be touched until the file has been grown to cover them.
pub fn map_chunk(file: &File, start_page: u64, len: u64) -> Result<Chunk> {
    ensure!(
        len > 0 && len % PAGE_SIZE as u64 == 0,
        "chunk length {} is not a multiple of page size",
        len
    );
    // SAFETY: the file is opened read-write by this process only; the chunk
    // owns the mapping and all access is bounds checked.
    let raw = MmapOptions::new()
        .offset(start_page * PAGE_SIZE as u64)
        .len(len as usize)
        .map_raw(file)
        .wrap_err("mmap failed")?;
    Ok(Chunk {
        raw,
        start_page,
        pages: len / PAGE_SIZE as u64,
    })
}

/// Resolves a page pointer against a chunk list.
fn resolve(chunks: &[Arc<Chunk>], ptr: PagePtr) -> Result<(&Arc<Chunk>, u64)> {
    for chunk in chunks {
        let end = chunk.start_page + chunk.pages;
        if ptr >= chunk.start_page && ptr < end {
            return Ok((chunk, ptr - chunk.start_page));
        }
    }
    eyre::bail!("bad page pointer: {} not covered by any mmap chunk", ptr)
}

/// Reads the page at `ptr` into an owned buffer.
pub fn page_bytes(chunks: &[Arc<Chunk>], ptr: PagePtr) -> Result<Vec<u8>> {
    let (chunk, index) = resolve(chunks, ptr)?;
    Ok(chunk.page_slice(index)?.to_vec())
}

/// Writes `data` into the page at `ptr`.
pub fn write_page(chunks: &[Arc<Chunk>], ptr: PagePtr, data: &[u8]) -> Result<()> {
    let (chunk, index) = resolve(chunks, ptr)?;
    chunk.write_page(index, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_file(pages: u64) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("chunks.db"))
            .unwrap();
        file.set_len(pages * PAGE_SIZE as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn chunk_round_trips_page_data() {
        let (_dir, file) = test_file(4);
        let chunk = map_chunk(&file, 0, 4 * PAGE_SIZE as u64).unwrap();

        let mut data = vec![0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        chunk.write_page(2, &data).unwrap();

        let read = chunk.page_slice(2).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn chunk_rejects_out_of_bounds_page() {
        let (_dir, file) = test_file(2);
        let chunk = map_chunk(&file, 0, 2 * PAGE_SIZE as u64).unwrap();

        assert!(chunk.page_slice(2).is_err());
        assert!(chunk.write_page(5, &[0u8; 16]).is_err());
    }

    #[test]
    fn resolve_walks_multiple_chunks() {
        let (_dir, file) = test_file(6);
        let chunks = vec![
            Arc::new(map_chunk(&file, 0, 2 * PAGE_SIZE as u64).unwrap()),
            Arc::new(map_chunk(&file, 2, 4 * PAGE_SIZE as u64).unwrap()),
        ];

        write_page(&chunks, 3, &[7u8; PAGE_SIZE]).unwrap();

        let page = page_bytes(&chunks, 3).unwrap();
        assert_eq!(page, vec![7u8; PAGE_SIZE]);
        assert!(page_bytes(&chunks, 6).is_err());
    }

    #[test]
    fn mapping_may_extend_past_end_of_file() {
        let (_dir, file) = test_file(1);
        // Map four pages over a one-page file; only page 0 is touched.
        let chunk = map_chunk(&file, 0, 4 * PAGE_SIZE as u64).unwrap();

        chunk.write_page(0, &[1u8; PAGE_SIZE]).unwrap();
        assert_eq!(chunk.page_slice(0).unwrap()[0], 1);
    }
}
