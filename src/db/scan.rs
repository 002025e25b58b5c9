//! # Range and Table Scans
//!
//! A [`Scanner`] walks one table between two primary-key bounds, in either
//! direction; `scan_filter` walks a whole table's keyspace prefix and
//! selects rows by column equality. Both decode rows straight from the
//! tree iterator of whatever snapshot or transaction drives them.

use eyre::{ensure, Result};

use crate::btree::{cmp_ok, Cmp, TreeIter};
use crate::encoding::{decode_values, encode_key};
use crate::kv::TreeRead;
use crate::records::Record;
use crate::schema::{ordered_values, TableDef};

use super::database::Database;

/// Decodes `(key, value)` bytes from a table's keyspace into a full row.
pub(crate) fn decode_row(tdef: &TableDef, key: &[u8], val: &[u8]) -> Result<Record> {
    let pk = decode_values(&key[4..], tdef.pk_types())?;
    let rest = decode_values(val, tdef.non_pk_types())?;
    Ok(Record {
        cols: tdef.cols.clone(),
        vals: pk.into_iter().chain(rest).collect(),
    })
}

/// A directional range scan over one table.
///
/// The range runs from `key1` (seeked with `cmp1`) towards `key2`; the
/// scan stays valid while the current key still satisfies `cmp2` against
/// `key2`. Exactly one of the two comparators must be forward-looking, so
/// the direction is unambiguous.
pub struct Scanner<'a, R: TreeRead> {
    tdef: TableDef,
    cmp1: Cmp,
    cmp2: Cmp,
    key_end: Vec<u8>,
    iter: TreeIter<'a, R>,
}

impl<'a, R: TreeRead> std::fmt::Debug for Scanner<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("table", &self.tdef.name)
            .field("cmp1", &self.cmp1)
            .field("cmp2", &self.cmp2)
            .finish()
    }
}

impl Database {
    /// Opens a range scan over `table` between two primary-key records.
    pub fn scan<'a, R: TreeRead>(
        &self,
        handle: &'a R,
        table: &str,
        cmp1: Cmp,
        key1: &Record,
        cmp2: Cmp,
        key2: &Record,
    ) -> Result<Scanner<'a, R>> {
        let tdef = self.require_table(handle, table)?;

        let forward = cmp1.is_forward() && !cmp2.is_forward();
        let backward = cmp2.is_forward() && !cmp1.is_forward();
        ensure!(forward || backward, "bad range");

        let v1 = ordered_values(&tdef, key1, tdef.pkeys)?;
        let v2 = ordered_values(&tdef, key2, tdef.pkeys)?;
        let key_start = encode_key(tdef.prefix, &v1);
        let key_end = encode_key(tdef.prefix, &v2);

        let iter = handle.tree_seek(&key_start, cmp1)?;
        Ok(Scanner {
            tdef,
            cmp1,
            cmp2,
            key_end,
            iter,
        })
    }

    /// Full table scan selecting rows whose columns equal every value in
    /// `filter` (an empty filter selects everything).
    pub fn scan_filter<R: TreeRead>(
        &self,
        handle: &R,
        table: &str,
        filter: &Record,
    ) -> Result<Vec<Record>> {
        let tdef = self.require_table(handle, table)?;
        for col in &filter.cols {
            ensure!(tdef.col_index(col).is_some(), "column not found: {}", col);
        }

        let prefix = encode_key(tdef.prefix, &[]);
        let mut iter = handle.tree_seek(&prefix, Cmp::Ge)?;

        let mut rows = Vec::new();
        while iter.valid() {
            let row = {
                let (key, val) = iter.deref();
                if !key.starts_with(&prefix) {
                    break;
                }
                decode_row(&tdef, key, val)?
            };
            let selected = filter
                .cols
                .iter()
                .zip(&filter.vals)
                .all(|(col, want)| row.get(col) == Some(want));
            if selected {
                rows.push(row);
            }
            iter.next()?;
        }
        Ok(rows)
    }
}

impl<R: TreeRead> Scanner<'_, R> {
    /// Whether the cursor is inside the range.
    pub fn valid(&self) -> bool {
        if !self.iter.valid() {
            return false;
        }
        let (key, _) = self.iter.deref();
        cmp_ok(key, self.cmp2, &self.key_end)
    }

    /// Steps towards `key2` (forward or backward by range direction).
    pub fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        if self.cmp1.is_forward() {
            self.iter.next()
        } else {
            self.iter.prev()
        }
    }

    /// Decodes the current row into `rec`.
    pub fn deref(&self, rec: &mut Record) -> Result<()> {
        ensure!(self.valid(), "deref on exhausted scan");
        let (key, val) = self.iter.deref();
        *rec = decode_row(&self.tdef, key, val)?;
        Ok(())
    }
}
