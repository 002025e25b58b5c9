//! # Master Page
//!
//! Page 0 of the backing file holds the 32-byte master header that anchors
//! every durable structure:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  -------------------------------------------
//! 0       8     signature "AtmoixDB"
//! 8       8     tree_root: page pointer of the B+tree root (0 = empty tree)
//! 16      8     pages_allocated: logical file size in pages
//! 24      8     free_head: page pointer of the free-list head (0 = empty)
//! ```
//!
//! All fields little-endian. The header is written with a single positional
//! write of 32 bytes so the update is atomic at the sector level; together
//! with the fsync barrier before it, this makes commit all-or-nothing: a
//! crash either leaves the old header (old tree) or the new one, never a
//! torn mix.
//!
//! ## Validation
//!
//! `MasterPage::load` rejects files whose signature does not match or whose
//! pointers are out of range for the actual file size. Such a file is
//! corrupt and must not be opened.

use std::fs::File;
use std::os::unix::fs::FileExt;

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::PAGE_SIZE;

pub const DB_SIG: &[u8; 8] = b"AtmoixDB";
pub const MASTER_PAGE_SIZE: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    sig: [u8; 8],
    tree_root: U64,
    pages_allocated: U64,
    free_head: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_PAGE_SIZE);

impl MasterPage {
    pub fn new(tree_root: u64, pages_allocated: u64, free_head: u64) -> Self {
        Self {
            sig: *DB_SIG,
            tree_root: U64::new(tree_root),
            pages_allocated: U64::new(pages_allocated),
            free_head: U64::new(free_head),
        }
    }

    pub fn tree_root(&self) -> u64 {
        self.tree_root.get()
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated.get()
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }

    /// Parses and validates the master header against the file size.
    pub fn load(bytes: &[u8], file_size: u64) -> Result<Self> {
        ensure!(
            bytes.len() >= MASTER_PAGE_SIZE,
            "buffer too small for master page: {} < {}",
            bytes.len(),
            MASTER_PAGE_SIZE
        );

        let master = Self::read_from_bytes(&bytes[..MASTER_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse master page: {:?}", e))?;

        ensure!(&master.sig == DB_SIG, "bad signature");

        let file_pages = file_size / PAGE_SIZE as u64;
        let pages = master.pages_allocated();
        ensure!(
            pages >= 1 && pages <= file_pages,
            "bad master page: pages_allocated {} out of range (file holds {})",
            pages,
            file_pages
        );
        ensure!(
            master.tree_root() < pages,
            "bad master page: root {} >= pages_allocated {}",
            master.tree_root(),
            pages
        );
        ensure!(
            master.free_head() < pages,
            "bad master page: free list head {} >= pages_allocated {}",
            master.free_head(),
            pages
        );

        Ok(master)
    }

    /// Writes the header with one positional write at offset 0.
    pub fn store(&self, file: &File) -> Result<()> {
        file.write_at(self.as_bytes(), 0)
            .wrap_err("write master page")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_page_is_32_bytes() {
        assert_eq!(std::mem::size_of::<MasterPage>(), 32);
    }

    #[test]
    fn load_round_trips_stored_fields() {
        let master = MasterPage::new(7, 12, 3);

        let loaded = MasterPage::load(master.as_bytes(), 12 * PAGE_SIZE as u64).unwrap();

        assert_eq!(loaded.tree_root(), 7);
        assert_eq!(loaded.pages_allocated(), 12);
        assert_eq!(loaded.free_head(), 3);
    }

    #[test]
    fn load_rejects_bad_signature() {
        let mut bytes = MasterPage::new(1, 2, 0).as_bytes().to_vec();
        bytes[0] = b'X';

        let err = MasterPage::load(&bytes, 2 * PAGE_SIZE as u64).unwrap_err();

        assert!(err.to_string().contains("bad signature"));
    }

    #[test]
    fn load_rejects_root_beyond_allocation() {
        let master = MasterPage::new(5, 4, 0);

        let err = MasterPage::load(master.as_bytes(), 4 * PAGE_SIZE as u64).unwrap_err();

        assert!(err.to_string().contains("bad master page"));
    }

    #[test]
    fn load_rejects_allocation_beyond_file() {
        let master = MasterPage::new(0, 10, 0);

        let err = MasterPage::load(master.as_bytes(), 4 * PAGE_SIZE as u64).unwrap_err();

        assert!(err.to_string().contains("bad master page"));
    }

    #[test]
    fn store_writes_header_at_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("master.db"))
            .unwrap();
        file.set_len(PAGE_SIZE as u64).unwrap();

        MasterPage::new(3, 9, 1).store(&file).unwrap();

        let mut buf = [0u8; MASTER_PAGE_SIZE];
        file.read_exact_at(&mut buf, 0).unwrap();
        let loaded = MasterPage::load(&buf, 9 * PAGE_SIZE as u64).unwrap();
        assert_eq!(loaded.tree_root(), 3);
        assert_eq!(loaded.pages_allocated(), 9);
        assert_eq!(loaded.free_head(), 1);
    }
}
