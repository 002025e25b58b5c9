//! # Table and Index Layer
//!
//! The relational face of the store: typed tables over the single B+tree
//! keyspace, partitioned by per-table prefixes. Rows are encoded with the
//! order-preserving tuple codec, so primary-key ranges map directly onto
//! key ranges of the tree; secondary indexes are just more keys under
//! their own prefixes.
//!
//! - `database`: the `Database` handle, catalog bootstrap, point reads
//! - `mutations`: table creation, keyed writes, deletes, index upkeep
//! - `scan`: directional range scans and filtered full-table scans

mod database;
mod mutations;
mod scan;

pub use database::Database;
pub use scan::Scanner;
