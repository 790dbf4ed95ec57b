//! In-memory connection for tests and embedded use.
//!
//! Tables live in a shared map so clones observe each other's writes. A
//! transaction snapshots every table on start; rollback restores the
//! snapshot and commit discards it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rowpipe_core::id::TransactionId;
use rowpipe_core::row::Row;
use rowpipe_core::schema::{DeltaType, Table};
use rowpipe_core::types::Scalar;

use crate::connection::Connection;
use crate::error::ConnectionError;

#[derive(Debug, Clone)]
struct StoredTable {
    table: Table,
    rows: Vec<Row>,
    next_id: i64,
}

impl StoredTable {
    fn new(table: &Table) -> Self {
        Self {
            table: table.schema(),
            rows: Vec::new(),
            next_id: 1,
        }
    }

    fn matches(&self, stored: &Row, keys: &[usize], row: &Row) -> Result<bool, ConnectionError> {
        for &k in keys {
            let (a, b) = (&stored[k], &row[k]);
            if a.is_null() || b.is_null() || a.try_cmp(b)? != Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    tables: HashMap<String, StoredTable>,
    snapshot: Option<(TransactionId, HashMap<String, StoredTable>)>,
    next_tx: u64,
    commits: usize,
    rollbacks: usize,
    fail_on: Option<&'static str>,
}

impl MemoryStore {
    fn check_tx(&self, tx: Option<TransactionId>) -> Result<(), ConnectionError> {
        match (tx, &self.snapshot) {
            (None, _) => Ok(()),
            (Some(tx), Some((active, _))) if tx == *active => Ok(()),
            (Some(tx), _) => Err(ConnectionError::UnknownTransaction(tx)),
        }
    }

    fn fail_if(&self, operation: &'static str) -> Result<(), ConnectionError> {
        if self.fail_on == Some(operation) {
            return Err(ConnectionError::Failed {
                operation,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn table_mut(&mut self, table: &Table, dynamic: bool) -> Result<&mut StoredTable, ConnectionError> {
        if dynamic && !self.tables.contains_key(&table.name) {
            self.tables.insert(table.name.clone(), StoredTable::new(table));
        }
        let stored = self
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| ConnectionError::UnknownTable(table.name.clone()))?;
        if !stored.table.same_shape(table) {
            return Err(ConnectionError::Failed {
                operation: "resolve table",
                message: format!("'{}' does not match the stored column layout", table.name),
            });
        }
        Ok(stored)
    }
}

/// Thread-safe in-memory connection.
#[derive(Clone)]
pub struct MemoryConnection {
    name: String,
    dynamic: bool,
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dynamic: false,
            store: Arc::new(Mutex::new(MemoryStore::default())),
        }
    }

    /// Create missing tables on first insert instead of failing.
    pub fn with_dynamic_tables(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Make every call of `operation` fail (`"insert"`, `"update"`,
    /// `"delete"`, `"truncate"`, `"commit"`).
    pub fn fail_on(&self, operation: &'static str) {
        if let Ok(mut store) = self.store.lock() {
            store.fail_on = Some(operation);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStore>, ConnectionError> {
        self.store.lock().map_err(|_| ConnectionError::Failed {
            operation: "lock",
            message: format!("connection '{}' is poisoned", self.name),
        })
    }

    /// Current rows of `table`, including uncommitted writes.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .ok()
            .and_then(|s| s.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn contains_table(&self, table: &str) -> bool {
        self.lock().map(|s| s.tables.contains_key(table)).unwrap_or(false)
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().map(|s| s.snapshot.is_some()).unwrap_or(false)
    }

    /// `(commits, rollbacks)` performed so far.
    pub fn transaction_counts(&self) -> (usize, usize) {
        self.lock().map(|s| (s.commits, s.rollbacks)).unwrap_or((0, 0))
    }
}

impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dynamic_tables(&self) -> bool {
        self.dynamic
    }

    fn create_table(&mut self, table: &Table) -> Result<(), ConnectionError> {
        let mut store = self.lock()?;
        store
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| StoredTable::new(table));
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<TransactionId, ConnectionError> {
        let mut store = self.lock()?;
        if store.snapshot.is_some() {
            return Err(ConnectionError::TransactionActive);
        }
        store.next_tx += 1;
        let tx = TransactionId::new(store.next_tx);
        let snapshot = store.tables.clone();
        store.snapshot = Some((tx, snapshot));
        Ok(tx)
    }

    fn commit_transaction(&mut self, tx: TransactionId) -> Result<(), ConnectionError> {
        let mut store = self.lock()?;
        store.check_tx(Some(tx))?;
        store.fail_if("commit")?;
        store.snapshot = None;
        store.commits += 1;
        Ok(())
    }

    fn rollback_transaction(&mut self, tx: TransactionId) -> Result<(), ConnectionError> {
        let mut store = self.lock()?;
        store.check_tx(Some(tx))?;
        if let Some((_, tables)) = store.snapshot.take() {
            store.tables = tables;
        }
        store.rollbacks += 1;
        Ok(())
    }

    fn execute_insert(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        columns: &[usize],
        rows: &[Row],
    ) -> Result<Vec<i64>, ConnectionError> {
        let dynamic = self.dynamic;
        let mut store = self.lock()?;
        store.check_tx(tx)?;
        store.fail_if("insert")?;
        let stored = store.table_mut(table, dynamic)?;
        let auto = stored.table.ordinal_of_delta(DeltaType::AutoIncrement);

        let mut ids = Vec::new();
        for row in rows {
            let mut full = Row::nulls(stored.table.width());
            for &c in columns {
                full.set(c, row[c].clone());
            }
            if let Some(ordinal) = auto {
                let id = stored.next_id;
                stored.next_id += 1;
                let data_type = stored.table.columns[ordinal].data_type;
                full.set(ordinal, Scalar::I64(id).cast_to(data_type)?);
                ids.push(id);
            }
            stored.rows.push(full);
        }
        Ok(ids)
    }

    fn execute_update(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        columns: &[usize],
        keys: &[usize],
        row: &Row,
    ) -> Result<u64, ConnectionError> {
        let mut store = self.lock()?;
        store.check_tx(tx)?;
        store.fail_if("update")?;
        let stored = store.table_mut(table, false)?;
        let mut changed = 0;
        for i in 0..stored.rows.len() {
            if stored.matches(&stored.rows[i], keys, row)? {
                for &c in columns {
                    stored.rows[i].set(c, row[c].clone());
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn execute_delete(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        keys: &[usize],
        row: &Row,
    ) -> Result<u64, ConnectionError> {
        let mut store = self.lock()?;
        store.check_tx(tx)?;
        store.fail_if("delete")?;
        let stored = store.table_mut(table, false)?;
        let before = stored.rows.len();
        let mut kept = Vec::with_capacity(before);
        for r in std::mem::take(&mut stored.rows) {
            if !stored.matches(&r, keys, row)? {
                kept.push(r);
            }
        }
        stored.rows = kept;
        Ok((before - stored.rows.len()) as u64)
    }

    fn truncate_table(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
    ) -> Result<(), ConnectionError> {
        let mut store = self.lock()?;
        store.check_tx(tx)?;
        store.fail_if("truncate")?;
        store.table_mut(table, false)?.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::schema::{Column, DataType};

    fn people() -> Table {
        Table::new(
            "people",
            vec![
                Column::new("id", DataType::Int64).with_delta_type(DeltaType::AutoIncrement),
                Column::new("name", DataType::String),
            ],
        )
    }

    fn named(name: &str) -> Row {
        Row::new(vec![Scalar::Null, Scalar::Str(name.into())])
    }

    #[test]
    fn insert_assigns_auto_increment_ids() {
        let mut conn = MemoryConnection::new("mem");
        conn.create_table(&people()).unwrap();
        let ids = conn
            .execute_insert(None, &people(), &[1], &[named("a"), named("b")])
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(conn.rows("people")[1][0], Scalar::I64(2));
    }

    #[test]
    fn rollback_restores_the_snapshot() {
        let mut conn = MemoryConnection::new("mem");
        conn.create_table(&people()).unwrap();
        let tx = conn.start_transaction().unwrap();
        assert!(matches!(
            conn.start_transaction(),
            Err(ConnectionError::TransactionActive)
        ));
        conn.execute_insert(Some(tx), &people(), &[1], &[named("a")])
            .unwrap();
        assert_eq!(conn.rows("people").len(), 1);
        conn.rollback_transaction(tx).unwrap();
        assert!(conn.rows("people").is_empty());
        assert!(!conn.in_transaction());
    }

    #[test]
    fn stale_transaction_ids_are_rejected() {
        let mut conn = MemoryConnection::new("mem");
        conn.create_table(&people()).unwrap();
        let tx = conn.start_transaction().unwrap();
        conn.commit_transaction(tx).unwrap();
        assert!(matches!(
            conn.execute_insert(Some(tx), &people(), &[1], &[named("a")]),
            Err(ConnectionError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn keyed_update_and_delete() {
        let mut conn = MemoryConnection::new("mem");
        conn.create_table(&people()).unwrap();
        conn.execute_insert(None, &people(), &[1], &[named("a"), named("b")])
            .unwrap();
        let change = Row::new(vec![Scalar::I64(2), Scalar::Str("bee".into())]);
        assert_eq!(conn.execute_update(None, &people(), &[1], &[0], &change).unwrap(), 1);
        assert_eq!(conn.rows("people")[1][1], Scalar::Str("bee".into()));
        assert_eq!(conn.execute_delete(None, &people(), &[0], &change).unwrap(), 1);
        assert_eq!(conn.rows("people").len(), 1);
    }

    #[test]
    fn unknown_tables_fail_unless_dynamic() {
        let mut fixed = MemoryConnection::new("fixed");
        assert!(matches!(
            fixed.execute_insert(None, &people(), &[1], &[named("a")]),
            Err(ConnectionError::UnknownTable(_))
        ));
        let mut dynamic = MemoryConnection::new("dyn").with_dynamic_tables();
        dynamic
            .execute_insert(None, &people(), &[1], &[named("a")])
            .unwrap();
        assert!(dynamic.contains_table("people"));
    }
}
