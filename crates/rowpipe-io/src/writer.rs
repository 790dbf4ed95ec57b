//! Transactional writer task.
//!
//! Applies a stream of `(WriteOperation, Row)` pairs to a target connection
//! inside one transaction, with rejects routed to a separate connection
//! outside that transaction. Commit and rollback are explicit calls; a task
//! dropped with its transaction still open logs an error and leaves the
//! transaction to the store.

use serde::{Deserialize, Serialize};

use rowpipe_core::config::EngineConfig;
use rowpipe_core::id::TransactionId;
use rowpipe_core::row::Row;
use rowpipe_core::schema::{Column, DataType, DeltaType, Table};
use rowpipe_core::types::Scalar;

use crate::connection::Connection;
use crate::error::{ConnectionError, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteOperation {
    Create,
    Update,
    Delete,
    Reject,
    Truncate,
}

impl WriteOperation {
    /// Decode a `DatabaseOperation` cell: `C`, `U`, `D`, `R` or `T`
    /// (case-insensitive).
    pub fn from_code(cell: &Scalar) -> Result<Self> {
        let Scalar::Str(code) = cell else {
            return Err(Error::Schema(format!("operation code must be a string, got {:?}", cell)));
        };
        match code.trim().to_ascii_uppercase().as_str() {
            "C" => Ok(WriteOperation::Create),
            "U" => Ok(WriteOperation::Update),
            "D" => Ok(WriteOperation::Delete),
            "R" => Ok(WriteOperation::Reject),
            "T" => Ok(WriteOperation::Truncate),
            other => Err(Error::Schema(format!("unknown operation code '{}'", other))),
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            WriteOperation::Create => "C",
            WriteOperation::Update => "U",
            WriteOperation::Delete => "D",
            WriteOperation::Reject => "R",
            WriteOperation::Truncate => "T",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCounts {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub rejected: u64,
    pub truncated: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.created + self.updated + self.deleted + self.rejected + self.truncated
    }
}

/// Columns never written by the engine.
fn is_derived(column: &Column) -> bool {
    matches!(
        column.delta_type,
        DeltaType::AutoIncrement | DeltaType::IgnoreField | DeltaType::DatabaseOperation
    )
}

struct RejectTarget {
    connection: Box<dyn Connection>,
    table: Table,
    reason: usize,
    prepared: bool,
}

pub struct WriterTask {
    table: Table,
    target: Box<dyn Connection>,
    rejects: Option<RejectTarget>,
    transaction: Option<TransactionId>,
    pending: Vec<Row>,
    batch_size: usize,
    truncated: bool,
    counts: WriteCounts,
    insert_columns: Vec<usize>,
    update_columns: Vec<usize>,
    auto_keys: Vec<usize>,
    natural_keys: Vec<usize>,
}

impl WriterTask {
    pub fn new(table: Table, target: Box<dyn Connection>) -> Self {
        let table = table.schema();
        let insert_columns = (0..table.width())
            .filter(|&i| !is_derived(&table.columns[i]))
            .collect();
        let auto_keys = table.ordinals_of_delta(DeltaType::AutoIncrement);
        let natural_keys = table.ordinals_of_delta(DeltaType::NaturalKey);
        let update_columns = (0..table.width())
            .filter(|&i| {
                let c = &table.columns[i];
                !is_derived(c)
                    && !matches!(
                        c.delta_type,
                        DeltaType::NaturalKey | DeltaType::CreateDate | DeltaType::CreateAuditKey
                    )
            })
            .collect();
        Self {
            table,
            target,
            rejects: None,
            transaction: None,
            pending: Vec::new(),
            batch_size: EngineConfig::default().write_batch_size,
            truncated: false,
            counts: WriteCounts::default(),
            insert_columns,
            update_columns,
            auto_keys,
            natural_keys,
        }
    }

    /// Build a writer using the batch size and reject naming of `config`.
    pub fn from_config(
        table: Table,
        target: Box<dyn Connection>,
        rejects: Option<Box<dyn Connection>>,
        config: &EngineConfig,
    ) -> Self {
        let reject_name = config.reject_table_name(&table.name);
        let writer = Self::new(table, target).with_batch_size(config.write_batch_size);
        match rejects {
            Some(conn) => writer.with_rejects(conn, &reject_name),
            None => writer,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Route rejects to `table_name` on `connection`. The reject table has
    /// the target's columns (auto-increment values kept as plain data) plus
    /// a `RejectedReason` column when the target lacks one.
    pub fn with_rejects(mut self, connection: Box<dyn Connection>, table_name: &str) -> Self {
        let mut columns: Vec<Column> = self
            .table
            .columns
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if c.delta_type == DeltaType::AutoIncrement {
                    c.delta_type = DeltaType::TrackingField;
                }
                c
            })
            .collect();
        let reason = match self.table.ordinal_of_delta(DeltaType::RejectedReason) {
            Some(ordinal) => ordinal,
            None => {
                columns.push(
                    Column::new("rejected_reason", DataType::String)
                        .with_delta_type(DeltaType::RejectedReason),
                );
                columns.len() - 1
            }
        };
        self.rejects = Some(RejectTarget {
            connection,
            table: Table::new(table_name, columns),
            reason,
            prepared: false,
        });
        self
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn counts(&self) -> WriteCounts {
        self.counts
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn write_error(&self, operation: &'static str, source: ConnectionError) -> Error {
        Error::Write {
            table: self.table.name.clone(),
            operation,
            source,
        }
    }

    fn active(&self, operation: &str) -> Result<TransactionId> {
        self.transaction.ok_or_else(|| Error::Transaction {
            connection: self.target.name().to_string(),
            message: format!("{} requires an active transaction; call start first", operation),
        })
    }

    /// Open the transaction on the target connection.
    pub fn start(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::Transaction {
                connection: self.target.name().to_string(),
                message: "writer already started".into(),
            });
        }
        let tx = self
            .target
            .start_transaction()
            .map_err(|e| self.write_error("start", e))?;
        tracing::debug!(table = %self.table.name, %tx, "writer transaction started");
        self.transaction = Some(tx);
        Ok(())
    }

    /// Apply one operation. `reason` is recorded on rejected rows.
    pub fn write(&mut self, operation: WriteOperation, row: Row, reason: Option<&str>) -> Result<()> {
        if row.len() != self.table.width() {
            return Err(Error::Schema(format!(
                "row has {} values but '{}' has {} columns",
                row.len(),
                self.table.name,
                self.table.width()
            )));
        }
        match operation {
            WriteOperation::Create => {
                self.active("create")?;
                self.pending.push(row);
                if self.pending.len() >= self.batch_size {
                    self.flush()?;
                }
                Ok(())
            }
            WriteOperation::Update => {
                self.flush()?;
                let tx = self.active("update")?;
                let keys = self.keys_for(&row)?;
                let changed = self
                    .target
                    .execute_update(Some(tx), &self.table, &self.update_columns, &keys, &row)
                    .map_err(|e| self.write_error("update", e))?;
                self.counts.updated += changed;
                Ok(())
            }
            WriteOperation::Delete => {
                self.flush()?;
                let tx = self.active("delete")?;
                let keys = self.keys_for(&row)?;
                let deleted = self
                    .target
                    .execute_delete(Some(tx), &self.table, &keys, &row)
                    .map_err(|e| self.write_error("delete", e))?;
                self.counts.deleted += deleted;
                Ok(())
            }
            WriteOperation::Reject => self.reject(row, reason.unwrap_or("rejected")),
            WriteOperation::Truncate => self.truncate(),
        }
    }

    /// Auto-increment columns when the row carries their values, otherwise
    /// the natural key.
    fn keys_for(&self, row: &Row) -> Result<Vec<usize>> {
        if !self.auto_keys.is_empty() && self.auto_keys.iter().all(|&k| !row[k].is_null()) {
            return Ok(self.auto_keys.clone());
        }
        if !self.natural_keys.is_empty() {
            return Ok(self.natural_keys.clone());
        }
        Err(Error::Schema(format!(
            "'{}' has no auto-increment or natural key columns to match on",
            self.table.name
        )))
    }

    /// Write `row` to the reject table outside the transaction.
    pub fn reject(&mut self, row: Row, reason: &str) -> Result<()> {
        let table_name = self.table.name.clone();
        let Some(target) = self.rejects.as_mut() else {
            return Err(Error::Transaction {
                connection: self.target.name().to_string(),
                message: format!("no reject connection configured for '{}'", table_name),
            });
        };
        let reject_table = target.table.name.clone();
        let reject_error = |source| Error::Write {
            table: reject_table.clone(),
            operation: "reject",
            source,
        };
        if !target.prepared {
            if target.connection.dynamic_tables() {
                target
                    .connection
                    .create_table(&target.table)
                    .map_err(reject_error)?;
            }
            target.prepared = true;
        }
        let mut values = row.into_values();
        values.resize(target.table.width(), Scalar::Null);
        values[target.reason] = Scalar::Str(reason.to_string());
        let columns: Vec<usize> = (0..target.table.width()).collect();
        target
            .connection
            .execute_insert(None, &target.table, &columns, &[Row::new(values)])
            .map_err(reject_error)?;
        self.counts.rejected += 1;
        tracing::warn!(table = %table_name, reason, "row rejected");
        Ok(())
    }

    /// Truncate the target once per task; skipped for dynamic-table stores.
    pub fn truncate(&mut self) -> Result<()> {
        if self.truncated {
            return Ok(());
        }
        self.flush()?;
        let tx = self.active("truncate")?;
        self.truncated = true;
        if self.target.dynamic_tables() {
            tracing::warn!(table = %self.table.name, "truncate skipped for dynamic tables");
            return Ok(());
        }
        self.target
            .truncate_table(Some(tx), &self.table)
            .map_err(|e| self.write_error("truncate", e))?;
        self.counts.truncated += 1;
        Ok(())
    }

    /// Send buffered creates as one insert.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self.active("create")?;
        let rows = std::mem::take(&mut self.pending);
        self.target
            .execute_insert(Some(tx), &self.table, &self.insert_columns, &rows)
            .map_err(|e| self.write_error("insert", e))?;
        self.counts.created += rows.len() as u64;
        tracing::trace!(table = %self.table.name, rows = rows.len(), "insert batch flushed");
        Ok(())
    }

    /// Flush and commit. On failure the transaction stays open for `rollback`.
    pub fn commit(&mut self) -> Result<WriteCounts> {
        self.flush()?;
        let tx = self.active("commit")?;
        self.target
            .commit_transaction(tx)
            .map_err(|e| self.write_error("commit", e))?;
        self.transaction = None;
        tracing::debug!(table = %self.table.name, counts = ?self.counts, "writer committed");
        Ok(self.counts)
    }

    /// Discard buffered creates and roll back the transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        let tx = self.active("rollback")?;
        self.target
            .rollback_transaction(tx)
            .map_err(|e| self.write_error("rollback", e))?;
        self.transaction = None;
        tracing::debug!(table = %self.table.name, "writer rolled back");
        Ok(())
    }
}

impl Drop for WriterTask {
    fn drop(&mut self) {
        if let Some(tx) = self.transaction {
            tracing::error!(
                table = %self.table.name,
                %tx,
                pending = self.pending.len(),
                "writer dropped without commit or rollback"
            );
        }
    }
}
