//! # Database Handle
//!
//! `Database` layers the relational record model over the transactional
//! key-value store: a schema catalog held in two internal tables, a cache
//! of table definitions, and row-level point reads. Mutations live in
//! `mutations`, range scans in `scan`.
//!
//! ## Catalog Bootstrap
//!
//! `open` creates `@meta` and `@table` through the ordinary `table_new`
//! path, each in its own write transaction. On a fresh file the prefix
//! allocator hands them prefixes 1 and 2, matching the constants their
//! definitions carry; on reopen the creation fails with "table exists"
//! and is skipped.

use std::path::Path;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::btree::Cmp;
use crate::encoding::{decode_values, encode_key};
use crate::kv::{Kv, KvReader, KvTx, TreeRead};
use crate::records::Record;
use crate::schema::{meta_table, ordered_values, table_catalog, TableDef};

pub struct Database {
    pub(crate) kv: Kv,
    pub(crate) tables: Mutex<HashMap<String, TableDef>>,
}

impl Database {
    /// Opens (or creates) the backing file and ensures the internal
    /// catalog tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let kv = Kv::open(path)?;
        let db = Self {
            kv,
            tables: Mutex::new(HashMap::new()),
        };
        db.init_internal_tables()?;
        Ok(db)
    }

    fn init_internal_tables(&self) -> Result<()> {
        for def in [meta_table(), table_catalog()] {
            let mut tx = self.kv.begin_write();
            match self.table_new(&mut tx, &def) {
                Ok(()) => tx.commit()?,
                Err(err) if err.to_string().contains("table exists") => tx.abort(),
                Err(err) => {
                    tx.abort();
                    return Err(err.wrap_err(format!("creating {}", def.name)));
                }
            }
        }
        Ok(())
    }

    /// Closes the database, releasing the file and every mapping.
    pub fn close(self) {
        self.kv.close();
    }

    pub fn begin_write(&self) -> KvTx<'_> {
        self.kv.begin_write()
    }

    pub fn begin_read(&self) -> KvReader<'_> {
        self.kv.begin_read()
    }

    /// Ends a read transaction. Equivalent to dropping the reader.
    pub fn end_read(&self, reader: KvReader<'_>) {
        drop(reader);
    }

    pub fn commit(&self, tx: KvTx<'_>) -> Result<()> {
        tx.commit()
    }

    /// Aborts a transaction. The definition cache is dropped wholesale in
    /// case the transaction had created tables that were already looked up.
    pub fn abort(&self, tx: KvTx<'_>) {
        self.tables.lock().clear();
        tx.abort();
    }

    /// Access to the underlying key-value store.
    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    /// Resolves a table definition: internal defs are built in, user defs
    /// come from the cache or the `@table` catalog.
    pub(crate) fn table_def<R: TreeRead>(
        &self,
        handle: &R,
        name: &str,
    ) -> Result<Option<TableDef>> {
        if name == "@meta" {
            return Ok(Some(meta_table()));
        }
        if name == "@table" {
            return Ok(Some(table_catalog()));
        }
        if let Some(def) = self.tables.lock().get(name) {
            return Ok(Some(def.clone()));
        }

        let catalog = table_catalog();
        let mut row = Record::new();
        row.add_bytes("name", name.as_bytes());
        if !self.get_row(handle, &catalog, &mut row)? {
            return Ok(None);
        }
        let json = row
            .get("def")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| eyre::eyre!("corrupt catalog row for table {}", name))?;
        let def: TableDef = serde_json::from_slice(json)
            .wrap_err_with(|| format!("corrupt table definition for {}", name))?;

        self.tables.lock().insert(name.to_string(), def.clone());
        Ok(Some(def))
    }

    pub(crate) fn require_table<R: TreeRead>(&self, handle: &R, name: &str) -> Result<TableDef> {
        self.table_def(handle, name)?
            .ok_or_else(|| eyre::eyre!("table not found: {}", name))
    }

    /// Point lookup by primary key. `rec` must carry the key columns; on a
    /// hit the remaining columns are filled in and `true` is returned.
    pub fn get<R: TreeRead>(&self, handle: &R, table: &str, rec: &mut Record) -> Result<bool> {
        let tdef = self.require_table(handle, table)?;
        self.get_row(handle, &tdef, rec)
    }

    pub(crate) fn get_row<R: TreeRead>(
        &self,
        handle: &R,
        tdef: &TableDef,
        rec: &mut Record,
    ) -> Result<bool> {
        let pk_vals = ordered_values(tdef, rec, tdef.pkeys)?;
        let key = encode_key(tdef.prefix, &pk_vals);

        let iter = handle.tree_seek(&key, Cmp::Ge)?;
        if !iter.valid() {
            return Ok(false);
        }
        let (found_key, found_val) = iter.deref();
        if found_key != key.as_slice() {
            return Ok(false);
        }

        let non_pk = decode_values(found_val, tdef.non_pk_types())?;
        for (i, val) in non_pk.into_iter().enumerate() {
            let col = &tdef.cols[tdef.pkeys + i];
            match rec.cols.iter().position(|c| c == col) {
                Some(pos) => rec.vals[pos] = val,
                None => {
                    rec.cols.push(col.clone());
                    rec.vals.push(val);
                }
            }
        }
        Ok(true)
    }
}
