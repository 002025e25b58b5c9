//! # Tree Iterator
//!
//! Ordered traversal over the B+tree with seek-by-comparator. The iterator
//! owns a path stack of `(node, index)` pairs from the root down to the
//! current leaf slot; moving to a sibling backtracks up the stack until an
//! index can advance, then descends the appropriate extreme of the new
//! subtree (slot 0 going forward, the last slot going backward), refilling
//! the lower path levels from the just-advanced child.
//!
//! Iterators are snapshot-bound: they borrow the page reader they were
//! seeded from and stay consistent for that snapshot's lifetime no matter
//! what the writer commits in the meantime.

use eyre::Result;
use smallvec::SmallVec;

use crate::storage::{NodeType, PagePtr, PageReader};

use super::node::Node;

/// Seek comparators, matching the scan direction conventions of the record
/// layer: positive comparators move forward, negative ones backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Cmp {
    Gt = 2,
    Ge = 3,
    Lt = -2,
    Le = -3,
}

impl Cmp {
    pub fn is_forward(self) -> bool {
        matches!(self, Cmp::Ge | Cmp::Gt)
    }
}

/// Whether `key` satisfies `cmp` relative to `reference`.
pub fn cmp_ok(key: &[u8], cmp: Cmp, reference: &[u8]) -> bool {
    match cmp {
        Cmp::Ge => key >= reference,
        Cmp::Gt => key > reference,
        Cmp::Lt => key < reference,
        Cmp::Le => key <= reference,
    }
}

/// Stateful cursor over one tree snapshot.
pub struct TreeIter<'a, R: PageReader> {
    reader: &'a R,
    path: SmallVec<[(Node, u16); 8]>,
}

impl<'a, R: PageReader> std::fmt::Debug for TreeIter<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIter")
            .field("depth", &self.path.len())
            .finish()
    }
}

impl<'a, R: PageReader> TreeIter<'a, R> {
    /// Positions at the largest key `<=` `key` (the floor sentinel when
    /// nothing else qualifies). An empty tree yields an invalid iterator.
    pub fn seek_le(reader: &'a R, root: PagePtr, key: &[u8]) -> Result<Self> {
        let mut iter = Self {
            reader,
            path: SmallVec::new(),
        };
        let mut ptr = root;
        while ptr != 0 {
            let node = Node::from_bytes(reader.page(ptr)?)?;
            let idx = node.lookup_le(key);
            ptr = match node.btype() {
                NodeType::Internal => node.get_ptr(idx),
                _ => 0,
            };
            iter.path.push((node, idx));
        }
        Ok(iter)
    }

    /// Positions at the first key satisfying `cmp` relative to `key`.
    pub fn seek(reader: &'a R, root: PagePtr, key: &[u8], cmp: Cmp) -> Result<Self> {
        let mut iter = Self::seek_le(reader, root, key)?;
        if cmp != Cmp::Le && iter.valid() {
            let ok = {
                let (current, _) = iter.deref();
                cmp_ok(current, cmp, key)
            };
            if !ok {
                // seek_le lands at most one step away from the target.
                if cmp.is_forward() {
                    iter.next()?;
                } else {
                    iter.prev()?;
                }
            }
        }
        Ok(iter)
    }

    /// Whether the cursor points at a key-value pair.
    pub fn valid(&self) -> bool {
        match self.path.last() {
            Some((node, idx)) => *idx < node.nkeys(),
            None => false,
        }
    }

    /// Current key-value pair. The iterator must be valid.
    pub fn deref(&self) -> (&[u8], &[u8]) {
        let (node, idx) = self.path.last().expect("deref on invalid iterator");
        assert!(*idx < node.nkeys(), "deref on invalid iterator");
        (node.key(*idx), node.val(*idx))
    }

    /// Advances to the next key; an iterator stepped past the last key
    /// becomes invalid.
    pub fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let top = self.path.len() - 1;
        if !self.step(top, true)? {
            self.invalidate();
        }
        Ok(())
    }

    /// Moves to the previous key; an iterator stepped before the first key
    /// becomes invalid.
    pub fn prev(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let top = self.path.len() - 1;
        if !self.step(top, false)? {
            self.invalidate();
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        if let Some(last) = self.path.last_mut() {
            last.1 = last.0.nkeys();
        }
    }

    /// Moves `path[level]` one slot in the given direction, backtracking to
    /// the parent when the node is exhausted, then refills every deeper
    /// level from the newly selected child. Returns false when the whole
    /// tree is exhausted in that direction, leaving the path untouched.
    fn step(&mut self, level: usize, forward: bool) -> Result<bool> {
        let (node, idx) = &self.path[level];
        let can_move = if forward {
            *idx + 1 < node.nkeys()
        } else {
            *idx > 0
        };

        if can_move {
            if forward {
                self.path[level].1 += 1;
            } else {
                self.path[level].1 -= 1;
            }
        } else if level > 0 {
            if !self.step(level - 1, forward)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        if level + 1 < self.path.len() {
            let ptr = {
                let (node, idx) = &self.path[level];
                node.get_ptr(*idx)
            };
            let kid = Node::from_bytes(self.reader.page(ptr)?)?;
            let pos = if forward { 0 } else { kid.nkeys() - 1 };
            self.path[level + 1] = (kid, pos);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tree::tests::MemStore;
    use crate::btree::tree::tree_insert;

    fn populated(n: u32) -> (MemStore, PagePtr) {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in 0..n {
            let key = format!("key-{:05}", i);
            let val = format!("val-{}", i);
            root = tree_insert(&mut store, root, key.as_bytes(), val.as_bytes()).unwrap();
        }
        (store, root)
    }

    #[test]
    fn seek_ge_lands_on_first_satisfying_key() {
        let (store, root) = populated(50);

        let iter = TreeIter::seek(&store, root, b"key-00010x", Cmp::Ge).unwrap();

        assert!(iter.valid());
        assert_eq!(iter.deref().0, b"key-00011");
    }

    #[test]
    fn seek_ge_on_exact_key_stays_put() {
        let (store, root) = populated(50);

        let iter = TreeIter::seek(&store, root, b"key-00010", Cmp::Ge).unwrap();

        assert_eq!(iter.deref().0, b"key-00010");
    }

    #[test]
    fn seek_gt_skips_exact_match() {
        let (store, root) = populated(50);

        let iter = TreeIter::seek(&store, root, b"key-00010", Cmp::Gt).unwrap();

        assert_eq!(iter.deref().0, b"key-00011");
    }

    #[test]
    fn seek_lt_stops_before_exact_match() {
        let (store, root) = populated(50);

        let iter = TreeIter::seek(&store, root, b"key-00010", Cmp::Lt).unwrap();

        assert_eq!(iter.deref().0, b"key-00009");
    }

    #[test]
    fn seek_le_on_missing_key_takes_floor() {
        let (store, root) = populated(50);

        let iter = TreeIter::seek(&store, root, b"key-00010x", Cmp::Le).unwrap();

        assert_eq!(iter.deref().0, b"key-00010");
    }

    #[test]
    fn forward_iteration_yields_strictly_ascending_keys() {
        let (store, root) = populated(300);
        let mut iter = TreeIter::seek(&store, root, b"key-", Cmp::Ge).unwrap();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.deref().0.to_vec());
            iter.next().unwrap();
        }

        assert_eq!(seen.len(), 300);
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn backward_iteration_yields_strictly_descending_keys() {
        let (store, root) = populated(300);
        let mut iter = TreeIter::seek(&store, root, b"key-99999", Cmp::Le).unwrap();

        let mut seen = Vec::new();
        while iter.valid() && iter.deref().0 > b"".as_slice() {
            seen.push(iter.deref().0.to_vec());
            iter.prev().unwrap();
        }

        assert_eq!(seen.len(), 300);
        for pair in seen.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn iterator_past_the_end_is_invalid() {
        let (store, root) = populated(3);
        let mut iter = TreeIter::seek(&store, root, b"key-00002", Cmp::Ge).unwrap();
        assert!(iter.valid());

        iter.next().unwrap();

        assert!(!iter.valid());
    }

    #[test]
    fn iterator_before_the_start_is_invalid() {
        let (store, root) = populated(3);
        // Land on the floor sentinel.
        let mut iter = TreeIter::seek(&store, root, b"a", Cmp::Lt).unwrap();
        assert!(iter.valid());
        assert_eq!(iter.deref().0, b"");

        iter.prev().unwrap();

        assert!(!iter.valid());
    }

    #[test]
    fn empty_tree_yields_invalid_iterator() {
        let store = MemStore::new();

        let iter = TreeIter::seek(&store, 0, b"anything", Cmp::Ge).unwrap();

        assert!(!iter.valid());
    }
}
