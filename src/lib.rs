//! # AtomixDB - Embedded Ordered Key-Value Database
//!
//! AtomixDB is an embedded, single-file database that layers a relational
//! record model (tables, typed columns, primary and secondary indexes,
//! range scans) over a persistent copy-on-write B+tree. The design
//! prioritizes:
//!
//! - **Single-file simplicity**: one backing file holds the tree, the free
//!   list, and the master page that anchors them
//! - **Snapshot reads**: unbounded concurrent readers over immutable tree
//!   versions, never blocked by the writer
//! - **Atomic commits**: a two-fsync protocol where the master page flips
//!   the durable root only after the data it points at is on disk
//!
//! ## Quick Start
//!
//! ```ignore
//! use atomixdb::{Database, Record, TableDef, ValueType};
//!
//! let db = Database::open("database.db")?;
//!
//! let mut tx = db.begin_write();
//! db.table_new(&mut tx, &users_def)?;
//! let mut row = Record::new();
//! row.add_int64("id", 1).add_bytes("name", &b"John"[..]);
//! db.insert(&mut tx, "users", &row)?;
//! db.commit(tx)?;
//!
//! let reader = db.begin_read();
//! let mut query = Record::new();
//! query.add_int64("id", 1);
//! db.get(&reader, "users", &mut query)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Tables & Indexes (db)          │
//! ├─────────────────────────────────────┤
//! │  Records & Tuple Codec (records,    │
//! │  encoding, schema)                  │
//! ├─────────────────────────────────────┤
//! │  Transactions & Snapshots (kv)      │
//! ├─────────────────────────────────────┤
//! │  Copy-on-Write B+Tree (btree)       │
//! ├─────────────────────────────────────┤
//! │  Pages, Mmap, Free List (storage)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database.db
//! ├── page 0       master page: signature, root, page count, free head
//! └── pages 1..N   B+tree nodes and free-list nodes
//! ```
//!
//! ## Concurrency Model
//!
//! Exactly one writer at a time; readers take frozen `(root, mmap chunks,
//! version)` snapshots and are isolated from every later commit. The file
//! is mapped in append-only chunks, so snapshots stay valid across file
//! growth for as long as the reader lives.

pub mod btree;
pub mod db;
pub mod encoding;
pub mod kv;
pub mod records;
pub mod schema;
pub mod storage;

pub use btree::Cmp;
pub use db::{Database, Scanner};
pub use kv::{Kv, KvReader, KvTx, TreeRead, WriteMode, WriteResult};
pub use records::{Record, Value, ValueType};
pub use schema::TableDef;
