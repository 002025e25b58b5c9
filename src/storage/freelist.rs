//! # Persistent Free List
//!
//! Deleted pages are not returned to the filesystem; they are threaded onto
//! a singly-linked list of free-list nodes stored inside the paged file, and
//! handed back out by later write transactions. The list head lives in the
//! master page.
//!
//! ## Node Layout
//!
//! ```text
//! Offset  Size      Description
//! ------  --------  ----------------------------------------
//! 0       2         node type (= 3, FreeList)
//! 2       2         size: number of pointers in this node
//! 4       8         total: live pointer count across the chain (head only)
//! 12      8         next: pointer of the next node (0 = end)
//! 20      8*size    page pointers
//! ```
//!
//! With 4096-byte pages each node holds (4096 - 20) / 8 = 509 pointers.
//!
//! ## Update Model
//!
//! The free list is itself copy-on-write: `update` runs inside a write
//! transaction and rebuilds the head of the chain rather than mutating
//! durable nodes. Consumed pointers are dropped, freshly freed pointers are
//! prepended, and the pages of consumed free-list nodes are recycled into
//! the freed set themselves. Surviving pointers from a partially consumed
//! node are carried forward into the rebuilt head chain.
//!
//! All page traffic goes through the [`FreePager`] trait, which the write
//! transaction implements on top of its page overlay; nothing here touches
//! the file directly.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{NodeType, PagePtr, PAGE_SIZE};

pub const FREE_LIST_HEADER: usize = 20;
pub const FREE_LIST_CAP: usize = (PAGE_SIZE - FREE_LIST_HEADER) / 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FreeListHeader {
    node_type: U16,
    size: U16,
    total: U64,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<FreeListHeader>() == FREE_LIST_HEADER);

impl FreeListHeader {
    fn new(size: u16, next: u64) -> Self {
        Self {
            node_type: U16::new(NodeType::FreeList as u16),
            size: U16::new(size),
            total: U64::new(0),
            next: U64::new(next),
        }
    }

    fn size(&self) -> u16 {
        self.size.get()
    }

    fn next(&self) -> u64 {
        self.next.get()
    }

    fn total(&self) -> u64 {
        self.total.get()
    }

    fn set_total(&mut self, total: u64) {
        self.total = U64::new(total);
    }

    fn from_page(page: &[u8]) -> Result<Self> {
        ensure!(
            page.len() >= FREE_LIST_HEADER,
            "buffer too small for free list node: {} < {}",
            page.len(),
            FREE_LIST_HEADER
        );
        let header = Self::read_from_bytes(&page[..FREE_LIST_HEADER])
            .map_err(|e| eyre::eyre!("failed to parse free list node: {:?}", e))?;
        ensure!(
            header.node_type.get() == NodeType::FreeList as u16,
            "bad free list node type: {}",
            header.node_type.get()
        );
        Ok(header)
    }

    fn write_to(&self, page: &mut [u8]) {
        page[..FREE_LIST_HEADER].copy_from_slice(self.as_bytes());
    }
}

fn ptr_at(page: &[u8], idx: usize) -> PagePtr {
    let off = FREE_LIST_HEADER + idx * 8;
    u64::from_le_bytes(page[off..off + 8].try_into().unwrap())
}

fn set_ptr_at(page: &mut [u8], idx: usize, ptr: PagePtr) {
    let off = FREE_LIST_HEADER + idx * 8;
    page[off..off + 8].copy_from_slice(&ptr.to_le_bytes());
}

/// Page access for free-list maintenance, implemented by the write
/// transaction. `append` always claims a brand-new pointer past the current
/// allocation; `reuse` rewrites a page whose pointer the caller already
/// owns. Both land in the transaction overlay, never on disk.
pub trait FreePager {
    fn page(&self, ptr: PagePtr) -> Result<Vec<u8>>;
    fn append(&mut self, page: Vec<u8>) -> Result<PagePtr>;
    fn reuse(&mut self, ptr: PagePtr, page: Vec<u8>);
}

/// The in-memory handle on the persistent free list: just the head pointer.
/// All node contents are read through the pager on demand.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    pub head: PagePtr,
}

impl FreeList {
    pub fn new(head: PagePtr) -> Self {
        Self { head }
    }

    /// Returns the n-th reusable pointer, 0-indexed from the head's top.
    pub fn get<P: FreePager>(&self, pager: &P, mut n: usize) -> Result<PagePtr> {
        ensure!(self.head != 0, "free list accounting: get from empty list");
        let mut page = pager.page(self.head)?;
        let mut header = FreeListHeader::from_page(&page)?;
        while (header.size() as usize) <= n {
            n -= header.size() as usize;
            ensure!(
                header.next() != 0,
                "free list accounting: index past end of chain"
            );
            page = pager.page(header.next())?;
            header = FreeListHeader::from_page(&page)?;
        }
        Ok(ptr_at(&page, header.size() as usize - n - 1))
    }

    /// Counts the pointers reachable from the head.
    pub fn total<P: FreePager>(&self, pager: &P) -> Result<usize> {
        let mut total = 0;
        let mut ptr = self.head;
        while ptr != 0 {
            let page = pager.page(ptr)?;
            let header = FreeListHeader::from_page(&page)?;
            total += header.size() as usize;
            ptr = header.next();
        }
        Ok(total)
    }

    /// Consumes the top `pop_n` pointers and adds everything in `freed`.
    ///
    /// Nodes fully covered by `pop_n` are unlinked; a partially covered node
    /// has its surviving pointers carried forward. Pages of unlinked nodes
    /// join `freed`. The rebuilt head chain is written through the pager and
    /// the head node's `total` field is refreshed.
    ///
    /// With `recycle_nodes` false the chain is left untouched and `freed`
    /// is prepended on freshly appended node pages only; callers pass false
    /// while a reader snapshot older than the current version is live,
    /// since unlinked node pages and carried-forward pointers may still be
    /// reachable through such a snapshot. `pop_n` must then be 0.
    pub fn update<P: FreePager>(
        &mut self,
        pager: &mut P,
        mut pop_n: usize,
        mut freed: Vec<PagePtr>,
        recycle_nodes: bool,
    ) -> Result<()> {
        if pop_n == 0 && freed.is_empty() {
            return Ok(());
        }

        let mut total = self.total(pager)?;
        ensure!(
            pop_n <= total,
            "free list accounting: popping {} of {} pointers",
            pop_n,
            total
        );
        ensure!(
            recycle_nodes || pop_n == 0,
            "free list accounting: pop without node recycling"
        );

        // Pop head nodes until the popped pointers are consumed and the
        // carried-forward set has room for everything that must be rewritten.
        let mut reuse: Vec<PagePtr> = Vec::new();
        while recycle_nodes
            && self.head != 0
            && (pop_n > 0 || reuse.len() * FREE_LIST_CAP < freed.len())
        {
            let page = pager.page(self.head)?;
            let header = FreeListHeader::from_page(&page)?;
            let size = header.size() as usize;
            freed.push(self.head);

            if pop_n >= size {
                pop_n -= size;
            } else {
                // Partial node: survivors either become head pages of the
                // rebuilt chain or go back into the freed set.
                let mut remain = size - pop_n;
                pop_n = 0;
                while remain > 0 && reuse.len() * FREE_LIST_CAP < freed.len() + remain {
                    remain -= 1;
                    reuse.push(ptr_at(&page, remain));
                }
                for i in 0..remain {
                    freed.push(ptr_at(&page, i));
                }
            }
            total -= size;
            self.head = header.next();
        }
        ensure!(
            !recycle_nodes || reuse.len() * FREE_LIST_CAP >= freed.len() || self.head == 0,
            "free list accounting: carry-forward cannot cover rewrite"
        );

        let new_total = total + freed.len();
        self.push(pager, freed, reuse)?;

        if self.head != 0 {
            let mut page = pager.page(self.head)?;
            let mut header = FreeListHeader::from_page(&page)?;
            header.set_total(new_total as u64);
            header.write_to(&mut page);
            pager.reuse(self.head, page);
        }
        Ok(())
    }

    /// Prepends `freed` to the chain in nodes of up to `FREE_LIST_CAP`
    /// pointers, taking node pages from `reuse` first and appending fresh
    /// pages after that runs out.
    fn push<P: FreePager>(
        &mut self,
        pager: &mut P,
        mut freed: Vec<PagePtr>,
        mut reuse: Vec<PagePtr>,
    ) -> Result<()> {
        while !freed.is_empty() {
            let size = freed.len().min(FREE_LIST_CAP);
            let mut page = vec![0u8; PAGE_SIZE];
            FreeListHeader::new(size as u16, self.head).write_to(&mut page);
            for (i, ptr) in freed[..size].iter().enumerate() {
                set_ptr_at(&mut page, i, *ptr);
            }
            freed.drain(..size);

            if let Some(ptr) = reuse.first().copied() {
                reuse.remove(0);
                self.head = ptr;
                pager.reuse(ptr, page);
            } else {
                self.head = pager.append(page)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    struct MemPager {
        pages: HashMap<PagePtr, Vec<u8>>,
        next: PagePtr,
    }

    impl MemPager {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                next: 1,
            }
        }
    }

    impl FreePager for MemPager {
        fn page(&self, ptr: PagePtr) -> Result<Vec<u8>> {
            self.pages
                .get(&ptr)
                .cloned()
                .ok_or_else(|| eyre::eyre!("bad page pointer: {}", ptr))
        }

        fn append(&mut self, page: Vec<u8>) -> Result<PagePtr> {
            let ptr = self.next;
            self.next += 1;
            self.pages.insert(ptr, page);
            Ok(ptr)
        }

        fn reuse(&mut self, ptr: PagePtr, page: Vec<u8>) {
            self.pages.insert(ptr, page);
        }
    }

    fn collect(fl: &FreeList, pager: &MemPager) -> Vec<PagePtr> {
        let total = fl.total(pager).unwrap();
        (0..total).map(|n| fl.get(pager, n).unwrap()).collect()
    }

    #[test]
    fn empty_list_has_zero_total() {
        let fl = FreeList::new(0);
        let pager = MemPager::new();

        assert_eq!(fl.total(&pager).unwrap(), 0);
    }

    #[test]
    fn update_adds_freed_pointers() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();

        fl.update(&mut pager, 0, vec![100, 101, 102], true).unwrap();

        assert_eq!(fl.total(&pager).unwrap(), 3);
        assert_eq!(collect(&fl, &pager), vec![102, 101, 100]);
    }

    #[test]
    fn get_walks_across_nodes() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        let freed: Vec<PagePtr> = (1000..1000 + FREE_LIST_CAP as u64 + 10).collect();

        fl.update(&mut pager, 0, freed.clone(), true).unwrap();

        assert_eq!(fl.total(&pager).unwrap(), freed.len());
        let listed = collect(&fl, &pager);
        let mut sorted = listed.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), freed.len());
    }

    #[test]
    fn pop_consumes_from_the_top() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100, 101, 102, 103], true).unwrap();
        let top: Vec<PagePtr> = (0..2).map(|n| fl.get(&pager, n).unwrap()).collect();

        fl.update(&mut pager, 2, vec![200], true).unwrap();

        let remaining = collect(&fl, &pager);
        for ptr in top {
            assert!(!remaining.contains(&ptr), "popped {} still listed", ptr);
        }
        assert!(remaining.contains(&200));
    }

    #[test]
    fn consumed_node_pages_are_recycled() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100, 101], true).unwrap();
        let first_head = fl.head;

        // Pop everything; the old head node's page must come back as free.
        fl.update(&mut pager, 2, vec![300], true).unwrap();

        let remaining = collect(&fl, &pager);
        assert!(
            remaining.contains(&first_head),
            "node page {} was not recycled",
            first_head
        );
        assert!(remaining.contains(&300));
    }

    #[test]
    fn pop_without_new_frees_shrinks_the_list() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100, 101, 102], true).unwrap();

        fl.update(&mut pager, 3, vec![], true).unwrap();

        // The three pointers are gone; only recycled node pages remain.
        let remaining = collect(&fl, &pager);
        for ptr in [100, 101, 102] {
            assert!(!remaining.contains(&ptr), "popped {} still listed", ptr);
        }
    }

    #[test]
    fn popping_more_than_total_is_an_accounting_error() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100], true).unwrap();

        let err = fl.update(&mut pager, 5, vec![], true).unwrap_err();

        assert!(err.to_string().contains("free list accounting"));
    }

    #[test]
    fn head_total_field_mirrors_live_count() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();

        fl.update(&mut pager, 0, (500..900).collect(), true).unwrap();
        fl.update(&mut pager, 123, vec![10, 11], true).unwrap();

        let head = pager.page(fl.head).unwrap();
        let header = FreeListHeader::from_page(&head).unwrap();
        assert_eq!(header.total() as usize, fl.total(&pager).unwrap());
    }

    #[test]
    fn update_without_recycling_leaves_old_nodes_untouched() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100, 101], true).unwrap();
        let old_head = fl.head;
        let old_page = pager.page(old_head).unwrap();

        fl.update(&mut pager, 0, vec![200, 201], false).unwrap();

        // The previous head is still intact behind the new one.
        assert_ne!(fl.head, old_head);
        assert_eq!(pager.page(old_head).unwrap(), old_page);
        assert_eq!(fl.total(&pager).unwrap(), 4);
        let listed = collect(&fl, &pager);
        for ptr in [100, 101, 200, 201] {
            assert!(listed.contains(&ptr));
        }
    }

    #[test]
    fn pop_requires_node_recycling() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, vec![100, 101], true).unwrap();

        let err = fl.update(&mut pager, 1, vec![], false).unwrap_err();

        assert!(err.to_string().contains("free list accounting"));
    }

    #[test]
    fn no_pointer_is_listed_twice() {
        let mut fl = FreeList::new(0);
        let mut pager = MemPager::new();
        fl.update(&mut pager, 0, (2000..2600).collect(), true).unwrap();
        fl.update(&mut pager, 300, (3000..3100).collect(), true).unwrap();
        fl.update(&mut pager, 50, vec![], true).unwrap();

        let listed = collect(&fl, &pager);
        let mut deduped = listed.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), listed.len());
    }
}
