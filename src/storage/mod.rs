//! # Storage Module
//!
//! The foundational storage layer for AtomixDB: a single backing file
//! partitioned into fixed-size pages, memory-mapped in growable chunks, with
//! a master page describing the durable root and a persistent free list of
//! reusable pages.
//!
//! ## Architecture Overview
//!
//! The entire database lives in one file. Page 0 is the master page; every
//! other page is either a B+tree node or a free-list node, identified by its
//! 2-byte type header. All access goes through memory mapping: instead of
//! copying page data between kernel and user space, the file is mapped
//! directly into the process address space and the OS page cache does the
//! caching.
//!
//! ## Growth Model
//!
//! The file only grows, never shrinks. Space from deleted pages is recycled
//! through the free list rather than returned to the filesystem. The mapped
//! region grows by appending new mmap chunks; an existing chunk is never
//! remapped or unmapped before close, so a page pointer handed to a reader
//! stays valid for the reader's entire lifetime.
//!
//! ## Pager Traits
//!
//! The B+tree and the free list do not talk to the mmap directly. They are
//! parameterised over two traits:
//!
//! - [`PageReader`]: resolve a page pointer to page bytes. Implemented by
//!   reader snapshots and by write transactions (which consult their private
//!   overlay first).
//! - [`PageStore`]: additionally allocate and free pages. Implemented only
//!   by the write transaction, so the single-writer contract is visible in
//!   the type system.
//!
//! ## Module Organization
//!
//! - `chunk`: mmap chunk list and pointer resolution
//! - `master`: master-page codec, validated load / atomic store
//! - `freelist`: persistent linked list of reusable page pointers

mod chunk;
mod freelist;
mod master;

pub use chunk::{map_chunk, page_bytes, write_page, Chunk};
pub use freelist::{FreeList, FreePager, FREE_LIST_CAP, FREE_LIST_HEADER};
pub use master::{MasterPage, DB_SIG, MASTER_PAGE_SIZE};

use eyre::Result;

/// Size of every page in the backing file.
pub const PAGE_SIZE: usize = 4096;

/// Node header: 2-byte type plus 2-byte key count.
pub const NODE_HEADER_SIZE: usize = 4;

/// Upper bound on a single key stored in a leaf.
pub const BTREE_MAX_KEY_SIZE: usize = 1000;

/// Upper bound on a single value stored in a leaf.
pub const BTREE_MAX_VAL_SIZE: usize = 3000;

/// Initial size of the first mmap chunk.
pub const MIN_MMAP_SIZE: u64 = 64 << 20;

// A node holding one maximum-size entry must still fit in a page.
const _: () = assert!(
    NODE_HEADER_SIZE + 8 + 2 + 4 + BTREE_MAX_KEY_SIZE + BTREE_MAX_VAL_SIZE <= PAGE_SIZE
);

/// A page pointer: an index into the logical page array of the file.
/// Pointer 0 is reserved for the master page and doubles as "null".
pub type PagePtr = u64;

/// Discriminates the on-page layout of every non-master page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeType {
    Internal = 1,
    Leaf = 2,
    FreeList = 3,
}

impl NodeType {
    pub fn from_u16(raw: u16) -> Result<Self> {
        match raw {
            1 => Ok(NodeType::Internal),
            2 => Ok(NodeType::Leaf),
            3 => Ok(NodeType::FreeList),
            _ => eyre::bail!("unknown node type {}", raw),
        }
    }
}

/// Read-only page access, implemented by reader snapshots and write
/// transactions alike.
pub trait PageReader {
    /// Resolves a page pointer to a copy of the page bytes.
    fn page(&self, ptr: PagePtr) -> Result<Vec<u8>>;
}

/// Read-write page access, implemented only by the write transaction.
///
/// Allocation and deallocation never touch durable state directly: new pages
/// land in the transaction's overlay and freed pointers are queued for the
/// free list at commit.
pub trait PageStore: PageReader {
    /// Allocates a page for the given bytes, reusing a free page when one is
    /// available, and returns its pointer.
    fn new_page(&mut self, page: Vec<u8>) -> Result<PagePtr>;

    /// Queues a page for deallocation.
    fn free_page(&mut self, ptr: PagePtr);
}
