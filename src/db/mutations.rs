//! # Table Mutations
//!
//! Table creation, row writes with conflict modes, deletion, and secondary
//! index maintenance. Everything here runs inside a caller-provided write
//! transaction; nothing becomes visible until the caller commits.
//!
//! ## Index Keys
//!
//! An index entry is `encode_key(index_prefix, [indexed cols..., pk cols
//! not already indexed...])` with an empty value: the row's primary key is
//! recoverable from the entry itself, and completing the column list with
//! the primary key makes entries unique per row. On every write that
//! changed a row, the entries for the prior values are deleted and entries
//! for the new values inserted.

use eyre::{bail, ensure, Result, WrapErr};

use crate::encoding::{decode_values, encode_key, encode_values};
use crate::kv::{KvTx, WriteMode, WriteResult};
use crate::records::{Record, Value};
use crate::schema::{
    check_index_cols, ordered_values, table_catalog, table_def_check, TableDef, TABLE_PREFIX_MIN,
};

use super::database::Database;

enum IndexOp {
    Add,
    Delete,
}

impl Database {
    /// Creates a table: validates the definition, allocates one keyspace
    /// prefix for the rows plus one per secondary index, completes index
    /// column lists with missing primary-key columns, and persists the
    /// definition as JSON in the catalog.
    pub fn table_new(&self, tx: &mut KvTx<'_>, tdef: &TableDef) -> Result<()> {
        table_def_check(tdef)?;

        let catalog = table_catalog();
        let mut probe = Record::new();
        probe.add_bytes("name", tdef.name.as_bytes());
        if self.get_row(tx, &catalog, &mut probe)? {
            bail!("table exists: {}", tdef.name);
        }

        let meta = crate::schema::meta_table();
        let mut meta_rec = Record::new();
        meta_rec.add_bytes("key", &b"next_prefix"[..]);
        let mut next_prefix = TABLE_PREFIX_MIN;
        if self.get_row(tx, &meta, &mut meta_rec)? {
            let raw = meta_rec
                .get("val")
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| eyre::eyre!("corrupt catalog: next_prefix"))?;
            ensure!(raw.len() == 4, "corrupt catalog: next_prefix");
            next_prefix = u32::from_le_bytes(raw.try_into().expect("4 bytes"));
        }

        let mut def = tdef.clone();
        def.prefix = next_prefix;
        def.index_prefixes = (0..def.indexes.len() as u32)
            .map(|i| def.prefix + 1 + i)
            .collect();
        let completed: Vec<Vec<String>> = def
            .indexes
            .iter()
            .map(|index| check_index_cols(&def, index))
            .collect::<Result<_>>()?;
        def.indexes = completed;

        let ntrees = 1 + def.indexes.len() as u32;
        let mut meta_update = Record::new();
        meta_update
            .add_bytes("key", &b"next_prefix"[..])
            .add_bytes("val", (next_prefix + ntrees).to_le_bytes().to_vec());
        self.set_row(tx, &meta, &meta_update, WriteMode::Upsert)?;

        let json = serde_json::to_vec(&def)
            .wrap_err_with(|| format!("serializing definition of {}", def.name))?;
        let mut row = Record::new();
        row.add_bytes("name", def.name.as_bytes()).add_bytes("def", json);
        self.set_row(tx, &catalog, &row, WriteMode::Upsert)?;
        Ok(())
    }

    /// Writes a full row with the requested conflict mode and keeps every
    /// secondary index in step.
    pub fn set(
        &self,
        tx: &mut KvTx<'_>,
        table: &str,
        rec: &Record,
        mode: WriteMode,
    ) -> Result<WriteResult> {
        let tdef = self.require_table(tx, table)?;
        self.set_row(tx, &tdef, rec, mode)
    }

    /// INSERT_ONLY wrapper; true when the row was added.
    pub fn insert(&self, tx: &mut KvTx<'_>, table: &str, rec: &Record) -> Result<bool> {
        Ok(self.set(tx, table, rec, WriteMode::InsertOnly)?.added)
    }

    /// UPDATE_ONLY wrapper; true when the row changed.
    pub fn update(&self, tx: &mut KvTx<'_>, table: &str, rec: &Record) -> Result<bool> {
        Ok(self.set(tx, table, rec, WriteMode::UpdateOnly)?.updated)
    }

    /// UPSERT wrapper; true when the row changed.
    pub fn upsert(&self, tx: &mut KvTx<'_>, table: &str, rec: &Record) -> Result<bool> {
        Ok(self.set(tx, table, rec, WriteMode::Upsert)?.updated)
    }

    /// Deletes a row by primary key, cleaning its index entries from the
    /// prior value. False when the key was absent.
    pub fn delete(&self, tx: &mut KvTx<'_>, table: &str, rec: &Record) -> Result<bool> {
        let tdef = self.require_table(tx, table)?;
        let pk_vals = ordered_values(&tdef, rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &pk_vals);

        let Some(old) = tx.del(&key)? else {
            return Ok(false);
        };
        if !tdef.indexes.is_empty() {
            let old_vals = decode_values(&old, tdef.non_pk_types())?;
            let full: Vec<Value> = pk_vals.into_iter().chain(old_vals).collect();
            self.index_op(tx, &tdef, &full, IndexOp::Delete)?;
        }
        Ok(true)
    }

    pub(crate) fn set_row(
        &self,
        tx: &mut KvTx<'_>,
        tdef: &TableDef,
        rec: &Record,
        mode: WriteMode,
    ) -> Result<WriteResult> {
        let values = ordered_values(tdef, rec, tdef.cols.len())?;
        let key = encode_key(tdef.prefix, &values[..tdef.pkeys]);
        let mut val = Vec::new();
        encode_values(&mut val, &values[tdef.pkeys..]);

        let result = tx.set_with_mode(&key, &val, mode)?;

        if !tdef.indexes.is_empty() && result.updated {
            if !result.added {
                if let Some(old) = &result.old {
                    let old_vals = decode_values(old, tdef.non_pk_types())?;
                    let old_full: Vec<Value> = values[..tdef.pkeys]
                        .iter()
                        .cloned()
                        .chain(old_vals)
                        .collect();
                    self.index_op(tx, tdef, &old_full, IndexOp::Delete)?;
                }
            }
            self.index_op(tx, tdef, &values, IndexOp::Add)?;
        }
        Ok(result)
    }

    /// Applies one index operation for every secondary index of the table.
    /// `values` is the full row in schema order.
    fn index_op(
        &self,
        tx: &mut KvTx<'_>,
        tdef: &TableDef,
        values: &[Value],
        op: IndexOp,
    ) -> Result<()> {
        for (i, index) in tdef.indexes.iter().enumerate() {
            let ivals: Vec<Value> = index
                .iter()
                .map(|col| {
                    let pos = tdef.col_index(col).expect("validated at table creation");
                    values[pos].clone()
                })
                .collect();
            let key = encode_key(tdef.index_prefixes[i], &ivals);
            match op {
                IndexOp::Add => {
                    tx.set_with_mode(&key, b"", WriteMode::Upsert)?;
                }
                IndexOp::Delete => {
                    tx.del(&key)?;
                }
            }
        }
        Ok(())
    }
}
