//! # Copy-on-Write B+Tree
//!
//! An ordered map from opaque byte keys to opaque byte values, stored one
//! node per page. All data lives in leaf nodes; internal nodes hold child
//! pointers and a copy of each child's first key, so descent is a chain of
//! `lookup_le` calls.
//!
//! The tree never mutates a page in place. Updates rebuild the path from
//! the touched leaf to the root, allocating new pages through the
//! [`crate::storage::PageStore`] trait and queuing replaced pages for the
//! free list. Readers holding an old root keep a consistent view for as
//! long as their snapshot lives.
//!
//! - `node`: on-page codec and structural primitives (insert, split, merge)
//! - `tree`: recursive COW get / insert / delete
//! - `iter`: seek-by-comparator iterator with a path stack

pub mod iter;
pub mod node;
pub mod tree;

pub use iter::{cmp_ok, Cmp, TreeIter};
pub use node::Node;
pub use tree::{tree_delete, tree_get, tree_insert};
