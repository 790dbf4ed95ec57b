//! Runtime: drive a transform tree into a writer and report a summary.
//!
//! Behavior:
//! - `Engine` owns the configuration and the memory budget shared by the
//!   buffering transforms it builds (sort, materialize) and hands out
//!   configured flatten transforms and writers.
//! - `Pipeline::run` opens the top transform, applies every row to the
//!   writer, then commits. Any failure or cancellation rolls the writer back
//!   explicitly before the error is returned.
//! - Each run emits a `RunSummary` with write counts and timing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::config::EngineConfig;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{Query, SortField};
use rowpipe_core::row::Row;
use rowpipe_core::schema::{DeltaType, Table};
use rowpipe_core::types::Scalar;

use rowpipe_mem::MemoryBudgetImpl;

use rowpipe_io::{Connection, WriteCounts, WriteOperation, WriterTask};
use rowpipe_operators::{
    BoxedTransform, FlattenTransform, MaterializeTransform, OpError, SortTransform,
};

use crate::metrics::emit_span;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("transform: {0}")]
    Operator(OpError),
    #[error("write: {0}")]
    Write(#[from] rowpipe_io::Error),
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid pipeline: {0}")]
    Invalid(String),
    #[error("summary encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }
}

impl From<OpError> for ExecError {
    fn from(err: OpError) -> Self {
        if err.is_cancelled() {
            ExecError::Cancelled
        } else {
            ExecError::Operator(err)
        }
    }
}

/// Where each row's write operation comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationSelector {
    /// Apply the same operation to every row.
    Fixed(WriteOperation),
    /// Decode `C`/`U`/`D`/`R`/`T` from the named column of each row.
    Column(String),
}

impl OperationSelector {
    /// Decode from the table's `DatabaseOperation` column when it has one,
    /// otherwise create every row.
    pub fn for_table(table: &Table) -> Self {
        match table.ordinal_of_delta(DeltaType::DatabaseOperation) {
            Some(ordinal) => OperationSelector::Column(table.columns[ordinal].name.clone()),
            None => OperationSelector::Fixed(WriteOperation::Create),
        }
    }

    fn bind(&self, table: &Table) -> Result<BoundSelector, ExecError> {
        match self {
            OperationSelector::Fixed(op) => Ok(BoundSelector::Fixed(*op)),
            OperationSelector::Column(name) => table
                .index_of(name)
                .map(BoundSelector::Ordinal)
                .ok_or_else(|| {
                    ExecError::Invalid(format!(
                        "operation column '{}' not found in '{}'",
                        name, table.name
                    ))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BoundSelector {
    Fixed(WriteOperation),
    Ordinal(usize),
}

impl BoundSelector {
    fn operation(self, row: &Row) -> Result<WriteOperation, ExecError> {
        match self {
            BoundSelector::Fixed(op) => Ok(op),
            BoundSelector::Ordinal(ordinal) => Ok(WriteOperation::from_code(&row[ordinal])?),
        }
    }
}

/// Outcome of one successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub audit_key: AuditKey,
    pub rows_read: u64,
    pub counts: WriteCounts,
    /// True when the top transform reported its output already sorted.
    pub sorted: bool,
    /// Peak bytes held by budgeted transforms, when a budget was attached.
    pub peak_bytes: Option<usize>,
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunSummary {
    pub fn to_json(&self) -> Result<String, ExecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One top transform feeding one writer.
pub struct Pipeline {
    top: BoxedTransform,
    writer: WriterTask,
    selector: OperationSelector,
    max_rows: Option<usize>,
    budget: Option<MemoryBudgetImpl>,
    reason: Option<usize>,
}

impl Pipeline {
    /// The top transform's rows must have the writer table's shape.
    pub fn new(
        top: BoxedTransform,
        writer: WriterTask,
        selector: OperationSelector,
    ) -> Result<Self, ExecError> {
        let (produced, target) = (top.table(), writer.table());
        if produced.width() != target.width() {
            return Err(ExecError::Invalid(format!(
                "'{}' produces {} columns but '{}' has {}",
                top.name(),
                produced.width(),
                target.name,
                target.width()
            )));
        }
        let reason = target.ordinal_of_delta(DeltaType::RejectedReason);
        Ok(Self {
            top,
            writer,
            selector,
            max_rows: None,
            budget: None,
            reason,
        })
    }

    pub fn with_max_rows(mut self, rows: Option<usize>) -> Self {
        self.max_rows = rows;
        self
    }

    /// Report the peak usage of `budget` in run summaries.
    pub fn with_budget(mut self, budget: MemoryBudgetImpl) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn writer(&self) -> &WriterTask {
        &self.writer
    }

    pub fn into_parts(self) -> (BoxedTransform, WriterTask) {
        (self.top, self.writer)
    }

    /// Run to completion and commit, or roll back and return the error.
    pub fn run(&mut self, audit_key: AuditKey, cancel: &CancelToken) -> Result<RunSummary, ExecError> {
        let started_ms = now_millis();
        let selector = self.selector.bind(self.top.table())?;
        self.writer.start()?;

        let outcome = self
            .drive(audit_key, selector, cancel)
            .and_then(|(rows_read, sorted)| Ok((rows_read, sorted, self.writer.commit()?)));
        self.top.close();

        match outcome {
            Ok((rows_read, sorted, counts)) => {
                let summary = RunSummary {
                    audit_key,
                    rows_read,
                    counts,
                    sorted,
                    peak_bytes: self.budget.as_ref().map(|b| b.peak_bytes()),
                    started_ms,
                    finished_ms: now_millis(),
                };
                emit_span(
                    "run_committed",
                    &[
                        ("audit_key", audit_key.to_string()),
                        ("rows_read", rows_read.to_string()),
                        ("written", counts.total().to_string()),
                        ("rejected", counts.rejected.to_string()),
                    ],
                );
                tracing::debug!(%audit_key, rows_read, ?counts, "run committed");
                Ok(summary)
            }
            Err(err) => {
                if self.writer.in_transaction() {
                    if let Err(rollback) = self.writer.rollback() {
                        tracing::error!(%audit_key, error = %rollback, "rollback failed");
                    }
                }
                emit_span(
                    "run_rolled_back",
                    &[
                        ("audit_key", audit_key.to_string()),
                        ("cancelled", err.is_cancelled().to_string()),
                    ],
                );
                tracing::warn!(%audit_key, error = %err, "run rolled back");
                Err(err)
            }
        }
    }

    fn drive(
        &mut self,
        audit_key: AuditKey,
        selector: BoundSelector,
        cancel: &CancelToken,
    ) -> Result<(u64, bool), ExecError> {
        let query = match self.max_rows {
            Some(rows) => Query::new().with_rows(rows),
            None => Query::new(),
        };
        let sorted = self.top.open(audit_key, &query, cancel)?;
        let mut rows_read = 0u64;
        loop {
            if self.max_rows.is_some_and(|cap| rows_read >= cap as u64) {
                break;
            }
            let Some(row) = self.top.read_next(cancel)? else {
                break;
            };
            rows_read += 1;
            let operation = selector.operation(&row)?;
            let reason = match (operation, self.reason) {
                (WriteOperation::Reject, Some(ordinal)) => match &row[ordinal] {
                    Scalar::Str(text) => Some(text.clone()),
                    _ => None,
                },
                _ => None,
            };
            self.writer.write(operation, row, reason.as_deref())?;
        }
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        Ok((rows_read, sorted))
    }
}

/// Engine owns the configuration and the memory budget.
pub struct Engine {
    cfg: EngineConfig,
    budget: MemoryBudgetImpl,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let budget = MemoryBudgetImpl::new(cfg.mem_cap_bytes);
        Self { cfg, budget }
    }

    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn budget(&self) -> &MemoryBudgetImpl {
        &self.budget
    }

    /// Sort accounted against the engine budget.
    pub fn sort(&self, upstream: BoxedTransform, fields: Vec<SortField>) -> Result<SortTransform, ExecError> {
        Ok(SortTransform::new(upstream, fields)?.with_budget(self.budget.clone()))
    }

    /// Materialize with the configured cache capacity, accounted against the
    /// engine budget.
    pub fn materialize(&self, upstream: BoxedTransform) -> MaterializeTransform {
        let op = MaterializeTransform::new(upstream).with_budget(self.budget.clone());
        match self.cfg.cache_capacity {
            0 => op,
            capacity => op.with_capacity(capacity),
        }
    }

    /// Flatten at most `flatten_max_depth` levels of `path`.
    pub fn flatten(&self, upstream: BoxedTransform, path: Vec<String>) -> Result<FlattenTransform, ExecError> {
        Ok(FlattenTransform::with_max_depth(
            upstream,
            path,
            self.cfg.flatten_max_depth,
        )?)
    }

    pub fn writer(
        &self,
        table: Table,
        target: Box<dyn Connection>,
        rejects: Option<Box<dyn Connection>>,
    ) -> WriterTask {
        WriterTask::from_config(table, target, rejects, &self.cfg)
    }

    /// Pipeline with the configured row cap, reporting this engine's peak.
    pub fn pipeline(
        &self,
        top: BoxedTransform,
        writer: WriterTask,
        selector: OperationSelector,
    ) -> Result<Pipeline, ExecError> {
        Ok(Pipeline::new(top, writer, selector)?
            .with_max_rows(self.cfg.max_rows)
            .with_budget(self.budget.clone()))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::schema::{Column, DataType};
    use rowpipe_io::MemoryConnection;
    use rowpipe_operators::MemorySource;

    fn table() -> Table {
        Table::new(
            "items",
            vec![
                Column::new("id", DataType::Int32).with_delta_type(DeltaType::NaturalKey),
                Column::new("op", DataType::String).with_delta_type(DeltaType::DatabaseOperation),
            ],
        )
    }

    fn row(id: i32, op: &str) -> Row {
        Row::new(vec![Scalar::I32(id), Scalar::Str(op.into())])
    }

    fn source(rows: Vec<Row>) -> BoxedTransform {
        Box::new(MemorySource::from_rows(table(), rows).unwrap().into_transform())
    }

    fn target() -> MemoryConnection {
        let mut conn = MemoryConnection::new("target");
        conn.create_table(&table()).unwrap();
        conn
    }

    #[test]
    fn selector_follows_the_operation_column() {
        assert_eq!(
            OperationSelector::for_table(&table()),
            OperationSelector::Column("op".into())
        );
        let plain = Table::new("p", vec![Column::new("id", DataType::Int32)]);
        assert_eq!(
            OperationSelector::for_table(&plain),
            OperationSelector::Fixed(WriteOperation::Create)
        );
    }

    #[test]
    fn run_commits_all_rows() {
        let conn = target();
        let writer = WriterTask::new(table(), Box::new(conn.clone()));
        let mut pipeline = Pipeline::new(
            source(vec![row(1, "C"), row(2, "C")]),
            writer,
            OperationSelector::for_table(&table()),
        )
        .unwrap();
        let summary = pipeline.run(AuditKey::new(7), &CancelToken::new()).unwrap();
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.counts.created, 2);
        assert_eq!(conn.rows("items").len(), 2);
        assert_eq!(conn.transaction_counts(), (1, 0));
    }

    #[test]
    fn bad_operation_code_rolls_back() {
        let conn = target();
        let writer = WriterTask::new(table(), Box::new(conn.clone()));
        let mut pipeline = Pipeline::new(
            source(vec![row(1, "C"), row(2, "?")]),
            writer,
            OperationSelector::for_table(&table()),
        )
        .unwrap();
        let err = pipeline.run(AuditKey::new(1), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, ExecError::Write(_)));
        assert!(conn.rows("items").is_empty());
        assert_eq!(conn.transaction_counts(), (0, 1));
        assert!(!pipeline.writer().in_transaction());
    }

    #[test]
    fn mismatched_widths_are_rejected() {
        let narrow = Table::new("narrow", vec![Column::new("id", DataType::Int32)]);
        let writer = WriterTask::new(narrow, Box::new(MemoryConnection::new("t")));
        assert!(matches!(
            Pipeline::new(source(vec![]), writer, OperationSelector::Fixed(WriteOperation::Create)),
            Err(ExecError::Invalid(_))
        ));
    }
}
