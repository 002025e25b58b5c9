//! # Schema Definitions
//!
//! Table definitions, their validation, and the two internal catalog
//! tables. A [`TableDef`] is serialized to JSON and stored under the table
//! name in `@table`; `@meta` holds catalog metadata such as the next free
//! keyspace prefix.
//!
//! Prefixes partition the single B+tree keyspace: every table owns one
//! prefix for its rows and one more per secondary index. The internal
//! tables occupy prefixes 1 and 2, so the first user table starts at 3.

use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::records::{Record, Value, ValueType};

/// Lowest prefix the allocator will ever hand out.
pub const TABLE_PREFIX_MIN: u32 = 1;

/// Schema of one table: parallel column names and types, how many leading
/// columns form the primary key, secondary index column lists, and the
/// keyspace prefixes assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub types: Vec<ValueType>,
    pub cols: Vec<String>,
    pub pkeys: usize,
    #[serde(default)]
    pub indexes: Vec<Vec<String>>,
    #[serde(default)]
    pub prefix: u32,
    #[serde(default)]
    pub index_prefixes: Vec<u32>,
}

impl TableDef {
    pub fn pk_types(&self) -> &[ValueType] {
        &self.types[..self.pkeys]
    }

    pub fn non_pk_types(&self) -> &[ValueType] {
        &self.types[self.pkeys..]
    }

    pub fn col_index(&self, col: &str) -> Option<usize> {
        self.cols.iter().position(|c| c == col)
    }
}

/// Internal table `@meta` (prefix 1): catalog metadata, e.g. `next_prefix`.
pub fn meta_table() -> TableDef {
    TableDef {
        name: "@meta".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: 1,
        index_prefixes: Vec::new(),
    }
}

/// Internal table `@table` (prefix 2): one row per table, keyed by name,
/// holding the JSON [`TableDef`].
pub fn table_catalog() -> TableDef {
    TableDef {
        name: "@table".to_string(),
        types: vec![ValueType::Bytes, ValueType::Bytes],
        cols: vec!["name".to_string(), "def".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: 2,
        index_prefixes: Vec::new(),
    }
}

/// Validates a table definition before creation.
pub fn table_def_check(tdef: &TableDef) -> Result<()> {
    ensure!(!tdef.name.is_empty(), "table name cannot be empty");
    ensure!(!tdef.cols.is_empty(), "table must have at least one column");
    ensure!(
        tdef.cols.len() == tdef.types.len(),
        "table {} has {} columns but {} types",
        tdef.name,
        tdef.cols.len(),
        tdef.types.len()
    );
    for (i, col) in tdef.cols.iter().enumerate() {
        ensure!(!col.is_empty(), "column name cannot be empty");
        ensure!(
            !tdef.cols[..i].contains(col),
            "duplicate column name: {}",
            col
        );
    }
    ensure!(
        tdef.pkeys == 1,
        "exactly one primary key column is required"
    );
    Ok(())
}

/// Completes an index column list: every column must exist, and any primary
/// key column not already present is appended so index entries stay unique
/// per row.
pub fn check_index_cols(tdef: &TableDef, index: &[String]) -> Result<Vec<String>> {
    ensure!(!index.is_empty(), "index must have at least one column");
    let mut completed: Vec<String> = Vec::with_capacity(index.len() + tdef.pkeys);
    for col in index {
        ensure!(
            tdef.col_index(col).is_some(),
            "invalid index column: {}",
            col
        );
        ensure!(
            !completed.contains(col),
            "duplicate index column: {}",
            col
        );
        completed.push(col.clone());
    }
    for pk_col in &tdef.cols[..tdef.pkeys] {
        if !completed.contains(pk_col) {
            completed.push(pk_col.clone());
        }
    }
    Ok(completed)
}

/// Reorders a record's values into schema order for the first `n` columns
/// (`pkeys` for key lookups, all columns for full-row writes), checking
/// presence and types.
pub fn ordered_values(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let col = &tdef.cols[i];
        let val = rec.require(col)?;
        ensure!(
            val.value_type() == tdef.types[i],
            "column type mismatch: {}",
            col
        );
        out.push(val.clone());
    }
    Ok(out)
}
