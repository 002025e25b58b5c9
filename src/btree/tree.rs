//! # Copy-on-Write Tree Operations
//!
//! Point lookup, insertion and deletion over the B+tree. Nothing here
//! mutates a page in place: every modified node is rebuilt into a fresh
//! buffer, allocated through [`PageStore::new_page`], and the replaced
//! page is queued with [`PageStore::free_page`]. The caller receives the
//! pointer of the new root and installs it wherever its transaction keeps
//! the root (the shared tree is untouched until commit).
//!
//! ## Insert
//!
//! Descend to the leaf via `lookup_le`, rebuild the leaf with the key
//! inserted or replaced, then bubble the replacement pointer up. A node
//! that outgrew its page is split into up to three siblings whose pointers
//! and first keys replace the original entry in the parent; a root split
//! creates a new internal root one level taller.
//!
//! ## Delete
//!
//! Symmetric descent. A node that shrinks below a quarter page is merged
//! into whichever adjacent sibling yields the smaller merged node, provided
//! the result fits in a page. An internal root left with a single child is
//! collapsed to that child, shrinking the tree by one level.
//!
//! ## Sentinel
//!
//! The very first insert creates a root leaf whose slot 0 is the empty key
//! with an empty value. Every real key is larger, so `lookup_le` always has
//! a floor and never misses left of slot 0. The sentinel is invisible at
//! the KV layer because empty keys are rejected up front.

use eyre::{ensure, Result};

use crate::storage::{
    NodeType, PagePtr, PageReader, PageStore, BTREE_MAX_KEY_SIZE, BTREE_MAX_VAL_SIZE,
    NODE_HEADER_SIZE, PAGE_SIZE,
};

use super::node::{
    leaf_delete, leaf_insert, leaf_update, node_merge, node_split3, replace_2_kid, Node,
};

/// Point lookup against a snapshot root.
pub fn tree_get<R: PageReader>(reader: &R, root: PagePtr, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }
    let mut node = Node::from_bytes(reader.page(root)?)?;
    loop {
        let idx = node.lookup_le(key);
        match node.btype() {
            NodeType::Leaf => {
                if node.key(idx) == key {
                    return Ok(Some(node.val(idx).to_vec()));
                }
                return Ok(None);
            }
            NodeType::Internal => {
                node = Node::from_bytes(reader.page(node.get_ptr(idx))?)?;
            }
            NodeType::FreeList => unreachable!("validated by Node::from_bytes"),
        }
    }
}

/// COW upsert. Returns the pointer of the new root.
pub fn tree_insert<S: PageStore>(
    store: &mut S,
    root: PagePtr,
    key: &[u8],
    val: &[u8],
) -> Result<PagePtr> {
    ensure!(!key.is_empty(), "empty key");
    ensure!(
        key.len() <= BTREE_MAX_KEY_SIZE,
        "key too large: {} > {}",
        key.len(),
        BTREE_MAX_KEY_SIZE
    );
    ensure!(
        val.len() <= BTREE_MAX_VAL_SIZE,
        "value too large: {} > {}",
        val.len(),
        BTREE_MAX_VAL_SIZE
    );

    if root == 0 {
        // First key ever: build the root leaf around the floor sentinel.
        let mut first = Node::with_capacity(NodeType::Leaf, 2, 1);
        first.append_kv(0, 0, b"", b"");
        first.append_kv(1, 0, key, val);
        return store.new_page(first.into_bytes());
    }

    let node = Node::from_bytes(store.page(root)?)?;
    store.free_page(root);
    let node = insert_rec(store, node, key, val)?;

    let mut split = node_split3(node);
    if split.len() == 1 {
        return store.new_page(split.pop().expect("one node").into_bytes());
    }
    // The old root burst: the split siblings become children of a new root.
    let mut new_root = Node::with_capacity(NodeType::Internal, split.len() as u16, 1);
    for (i, kid) in split.into_iter().enumerate() {
        let first_key = kid.key(0).to_vec();
        let ptr = store.new_page(kid.into_bytes())?;
        new_root.append_kv(i as u16, ptr, &first_key, b"");
    }
    store.new_page(new_root.into_bytes())
}

fn insert_rec<S: PageStore>(store: &mut S, node: Node, key: &[u8], val: &[u8]) -> Result<Node> {
    let idx = node.lookup_le(key);
    match node.btype() {
        NodeType::Leaf => {
            if node.key(idx) == key {
                Ok(leaf_update(&node, idx, key, val))
            } else {
                Ok(leaf_insert(&node, idx + 1, key, val))
            }
        }
        NodeType::Internal => {
            let kptr = node.get_ptr(idx);
            let kid = Node::from_bytes(store.page(kptr)?)?;
            let kid = insert_rec(store, kid, key, val)?;
            let split = node_split3(kid);
            store.free_page(kptr);
            replace_kid_n(store, &node, idx, split)
        }
        NodeType::FreeList => unreachable!("validated by Node::from_bytes"),
    }
}

/// New parent with the child at `idx` replaced by `kids` (1..=3 siblings
/// from a split), each freshly allocated.
fn replace_kid_n<S: PageStore>(
    store: &mut S,
    old: &Node,
    idx: u16,
    kids: Vec<Node>,
) -> Result<Node> {
    let n = kids.len() as u16;
    let mut new = Node::with_capacity(NodeType::Internal, old.nkeys() + n - 1, 2);
    new.append_range(old, 0, 0, idx);
    for (i, mut kid) in kids.into_iter().enumerate() {
        kid.shrink_to_page();
        let first_key = kid.key(0).to_vec();
        let ptr = store.new_page(kid.into_bytes())?;
        new.append_kv(idx + i as u16, ptr, &first_key, b"");
    }
    new.append_range(old, idx + n, idx + 1, old.nkeys() - (idx + 1));
    Ok(new)
}

/// COW deletion. `Ok(None)` means the key was absent; otherwise the new
/// root pointer (0 when the tree emptied).
pub fn tree_delete<S: PageStore>(
    store: &mut S,
    root: PagePtr,
    key: &[u8],
) -> Result<Option<PagePtr>> {
    if root == 0 || key.is_empty() || key.len() > BTREE_MAX_KEY_SIZE {
        return Ok(None);
    }

    let node = Node::from_bytes(store.page(root)?)?;
    let Some(mut updated) = delete_rec(store, node, key)? else {
        return Ok(None);
    };
    store.free_page(root);

    if updated.btype() == NodeType::Internal && updated.nkeys() == 1 {
        // One child left: collapse the root a level down.
        return Ok(Some(updated.get_ptr(0)));
    }
    if updated.nkeys() == 0 {
        return Ok(Some(0));
    }
    updated.shrink_to_page();
    Ok(Some(store.new_page(updated.into_bytes())?))
}

fn delete_rec<S: PageStore>(store: &mut S, node: Node, key: &[u8]) -> Result<Option<Node>> {
    let idx = node.lookup_le(key);
    match node.btype() {
        NodeType::Leaf => {
            if node.key(idx) != key {
                return Ok(None);
            }
            Ok(Some(leaf_delete(&node, idx)))
        }
        NodeType::Internal => {
            let kptr = node.get_ptr(idx);
            let kid = Node::from_bytes(store.page(kptr)?)?;
            let Some(updated) = delete_rec(store, kid, key)? else {
                return Ok(None);
            };
            store.free_page(kptr);

            match pick_merge(store, &node, idx, &updated)? {
                Some((MergeDir::Left, sibling)) => {
                    let mut merged = node_merge(&sibling, &updated);
                    store.free_page(node.get_ptr(idx - 1));
                    let first_key = merged.key(0).to_vec();
                    merged.shrink_to_page();
                    let ptr = store.new_page(merged.into_bytes())?;
                    Ok(Some(replace_2_kid(&node, idx - 1, ptr, &first_key)))
                }
                Some((MergeDir::Right, sibling)) => {
                    let mut merged = node_merge(&updated, &sibling);
                    store.free_page(node.get_ptr(idx + 1));
                    let first_key = merged.key(0).to_vec();
                    merged.shrink_to_page();
                    let ptr = store.new_page(merged.into_bytes())?;
                    Ok(Some(replace_2_kid(&node, idx, ptr, &first_key)))
                }
                None => {
                    if updated.nkeys() == 0 {
                        // The only child emptied out; hand an empty node up
                        // so the root case can drop the whole tree.
                        assert!(node.nkeys() == 1 && idx == 0);
                        Ok(Some(Node::with_capacity(NodeType::Internal, 0, 1)))
                    } else {
                        Ok(Some(replace_kid_n(store, &node, idx, vec![updated])?))
                    }
                }
            }
        }
        NodeType::FreeList => unreachable!("validated by Node::from_bytes"),
    }
}

enum MergeDir {
    Left,
    Right,
}

/// Decides whether the under-full `updated` child at `idx` should merge,
/// and with which sibling. Both neighbours are considered; the smaller
/// fitting one wins.
fn pick_merge<S: PageStore>(
    store: &S,
    parent: &Node,
    idx: u16,
    updated: &Node,
) -> Result<Option<(MergeDir, Node)>> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(None);
    }

    let mut best: Option<(MergeDir, Node)> = None;
    if idx > 0 {
        let sibling = Node::from_bytes(store.page(parent.get_ptr(idx - 1))?)?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            best = Some((MergeDir::Left, sibling));
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = Node::from_bytes(store.page(parent.get_ptr(idx + 1))?)?;
        if sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE <= PAGE_SIZE {
            let smaller = match &best {
                Some((_, left)) => sibling.nbytes() < left.nbytes(),
                None => true,
            };
            if smaller {
                best = Some((MergeDir::Right, sibling));
            }
        }
    }
    Ok(best)
}
