//! Leaf transforms: adapt an external row source to the `Transform` protocol.
//!
//! `RowSource` is the seam for connection-backed readers. Source errors are
//! opaque to the engine and surface as `OpError::Connection` tagged with the
//! operation that was running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::error::Error as CoreError;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{
    bind_filters, bind_sort, matches_all, sort_rows, sort_satisfied, DuplicateStrategy, Filter,
    Lookup, Query, SortField,
};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;

use crate::traits::{
    describe_filters, Lifecycle, OpError, ResidualQuery, Transform, TransformState,
};

pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// A readable external source of rows.
pub trait RowSource: Send {
    fn name(&self) -> &str;

    fn table(&self) -> &Table;

    /// Begin reading. Returns `true` when the rows will arrive in the
    /// query's sort order.
    fn open(&mut self, query: &Query) -> Result<bool, SourceError>;

    fn read_next(&mut self) -> Result<Option<Row>, SourceError>;

    fn close(&mut self);

    fn lookup_rows(
        &mut self,
        filters: &[Filter],
        strategy: DuplicateStrategy,
    ) -> Result<Lookup, SourceError>;

    /// Order the source yields when no sort is requested.
    fn natural_order(&self) -> Option<&[SortField]> {
        None
    }

    /// Rewind to the first row of the current open, if supported.
    fn restart(&mut self) -> Result<bool, SourceError> {
        Ok(false)
    }
}

/// Transform over a `RowSource`.
///
/// The query is handed to the source as a hint and enforced again on the
/// rows it returns, so a source may ignore filters or the row cap.
pub struct SourceTransform {
    source: Box<dyn RowSource>,
    table: Table,
    lifecycle: Lifecycle,
    produced: Option<Vec<SortField>>,
    residual: ResidualQuery,
}

impl SourceTransform {
    pub fn new(source: Box<dyn RowSource>) -> Self {
        let table = source.table().schema();
        let lifecycle = Lifecycle::new(source.name());
        Self {
            source,
            table,
            lifecycle,
            produced: None,
            residual: ResidualQuery::default(),
        }
    }

    fn connection_error(&self, operation: &'static str, err: SourceError) -> OpError {
        OpError::Connection {
            source_name: self.lifecycle.name().to_string(),
            operation,
            message: err.to_string(),
        }
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        while !self.residual.is_exhausted() {
            cancel.check()?;
            let row = self
                .source
                .read_next()
                .map_err(|e| self.connection_error("read", e))?;
            let Some(row) = row else {
                return Ok(None);
            };
            let keep = self
                .table
                .validate_row(&row)
                .and_then(|_| self.residual.admit(&row))
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))?;
            if keep {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

impl Transform for SourceTransform {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn state(&self) -> TransformState {
        self.lifecycle.state()
    }

    fn open(
        &mut self,
        audit_key: AuditKey,
        query: &Query,
        cancel: &CancelToken,
    ) -> Result<bool, OpError> {
        self.lifecycle.begin_open()?;
        let result = match cancel.check() {
            Ok(()) => ResidualQuery::bind(&query.filters, query.rows, &self.table)
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
                .and_then(|residual| {
                    self.residual = residual;
                    self.source.open(query).map_err(|e| OpError::Connection {
                        source_name: self.lifecycle.name().to_string(),
                        operation: "open",
                        message: e.to_string(),
                    })
                }),
            Err(e) => Err(e.into()),
        };
        let sorted = self.lifecycle.finish_open(result)?;
        self.produced = if sorted && !query.sorts.is_empty() {
            Some(query.sorts.clone())
        } else {
            self.source.natural_order().map(<[SortField]>::to_vec)
        };
        tracing::debug!(source = self.name(), %audit_key, sorted, "source opened");
        Ok(sort_satisfied(self.produced.as_deref(), &query.sorts))
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = self.next_row(cancel);
        self.lifecycle.finish_read(result)
    }

    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        let result = self
            .source
            .restart()
            .map_err(|e| self.connection_error("reset", e));
        if let Ok(true) = result {
            self.residual.rewind();
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        if self.lifecycle.is_open() {
            self.source.close();
        }
        self.lifecycle.close();
    }

    fn produced_sort(&self) -> Option<&[SortField]> {
        self.produced.as_deref()
    }

    fn lookup(
        &mut self,
        filters: &[Filter],
        strategy: DuplicateStrategy,
        cancel: &CancelToken,
    ) -> Result<Lookup, OpError> {
        self.lifecycle.check_lookup()?;
        cancel.check()?;
        self.source.lookup_rows(filters, strategy).map_err(|e| {
            match e.downcast_ref::<CoreError>() {
                Some(CoreError::DuplicateRows { count }) => OpError::DuplicateRows {
                    transform: self.lifecycle.name().to_string(),
                    key: describe_filters(filters),
                    count: *count,
                },
                _ => self.connection_error("lookup", e),
            }
        })
    }
}

/// Apply a query's filters, sort and row cap to `rows`.
/// Returns the selected rows and whether the sort was applied.
pub(crate) fn select_rows<'a>(
    rows: impl Iterator<Item = &'a Row>,
    table: &Table,
    query: &Query,
) -> Result<(Vec<Row>, bool), CoreError> {
    let filters = bind_filters(&query.filters, table)?;
    let mut selected = Vec::new();
    for row in rows {
        if matches_all(&filters, row)? {
            selected.push(row.clone());
        }
    }
    let sorted = !query.sorts.is_empty();
    if sorted {
        let keys = bind_sort(&query.sorts, table)?;
        sort_rows(&mut selected, &keys)?;
    }
    if let Some(cap) = query.rows {
        selected.truncate(cap);
    }
    Ok((selected, sorted))
}

/// Scan `rows` for matches of `filters`, reduced by `strategy`.
pub(crate) fn scan_lookup<'a>(
    rows: impl Iterator<Item = &'a Row>,
    table: &Table,
    filters: &[Filter],
    strategy: DuplicateStrategy,
) -> Result<Lookup, CoreError> {
    let bound = bind_filters(filters, table)?;
    let mut matched = Vec::new();
    for row in rows {
        if matches_all(&bound, row)? {
            matched.push(row.clone());
        }
    }
    strategy.apply(matched)
}

/// Counters shared between a `MemorySource` and whoever built it.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    opens: Arc<AtomicUsize>,
    rows_read: Arc<AtomicUsize>,
    lookups: Arc<AtomicUsize>,
}

impl SourceStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read.load(Ordering::Relaxed)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

/// In-memory `RowSource` backed by a table's row cache.
///
/// Honors filters, sort and row cap on open; restartable unless configured
/// otherwise.
pub struct MemorySource {
    table: Table,
    natural_order: Option<Vec<SortField>>,
    restartable: bool,
    sort_pushdown: bool,
    fail_after: Option<usize>,
    failing_opens: usize,
    stats: SourceStats,
    view: Vec<Row>,
    position: usize,
    is_open: bool,
}

impl MemorySource {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            natural_order: None,
            restartable: true,
            sort_pushdown: true,
            fail_after: None,
            failing_opens: 0,
            stats: SourceStats::default(),
            view: Vec::new(),
            position: 0,
            is_open: false,
        }
    }

    pub fn from_rows(table: Table, rows: Vec<Row>) -> Result<Self, CoreError> {
        Ok(Self::new(table.with_rows(rows)?))
    }

    /// Declare the order rows are stored in.
    pub fn with_natural_order(mut self, order: Vec<SortField>) -> Self {
        self.natural_order = Some(order);
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    /// When disabled, requested sorts are ignored and `open` reports unsorted.
    pub fn sort_pushdown(mut self, enabled: bool) -> Self {
        self.sort_pushdown = enabled;
        self
    }

    /// Fail every read after `rows` rows have been served.
    pub fn fail_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }

    /// Fail the next `opens` calls to `open`.
    pub fn fail_opens(mut self, opens: usize) -> Self {
        self.failing_opens = opens;
        self
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.clone()
    }

    pub fn boxed(self) -> Box<dyn RowSource> {
        Box::new(self)
    }

    pub fn into_transform(self) -> SourceTransform {
        SourceTransform::new(Box::new(self))
    }
}

impl RowSource for MemorySource {
    fn name(&self) -> &str {
        &self.table.name
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn open(&mut self, query: &Query) -> Result<bool, SourceError> {
        if self.is_open {
            return Err(format!("source '{}' is already open", self.table.name).into());
        }
        if self.failing_opens > 0 {
            self.failing_opens -= 1;
            return Err(format!("source '{}' refused the connection", self.table.name).into());
        }
        let query = if self.sort_pushdown {
            query.clone()
        } else {
            Query {
                sorts: Vec::new(),
                rows: None,
                ..query.clone()
            }
        };
        let (view, sorted) = select_rows(self.table.cache.iter(), &self.table, &query)?;
        self.view = view;
        self.position = 0;
        self.is_open = true;
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        Ok(sorted)
    }

    fn read_next(&mut self) -> Result<Option<Row>, SourceError> {
        if !self.is_open {
            return Err(format!("source '{}' is not open", self.table.name).into());
        }
        if self.fail_after.is_some_and(|n| self.position >= n) {
            return Err(format!("source '{}' lost its connection", self.table.name).into());
        }
        let row = self.view.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
            self.stats.rows_read.fetch_add(1, Ordering::Relaxed);
        }
        Ok(row)
    }

    fn close(&mut self) {
        self.view.clear();
        self.position = 0;
        self.is_open = false;
    }

    fn lookup_rows(
        &mut self,
        filters: &[Filter],
        strategy: DuplicateStrategy,
    ) -> Result<Lookup, SourceError> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(scan_lookup(self.table.cache.iter(), &self.table, filters, strategy)?)
    }

    fn natural_order(&self) -> Option<&[SortField]> {
        self.natural_order.as_deref()
    }

    fn restart(&mut self) -> Result<bool, SourceError> {
        if self.restartable {
            self.position = 0;
        }
        Ok(self.restartable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::read_all;
    use rowpipe_core::schema::{Column, DataType};
    use rowpipe_core::types::Scalar;

    fn source() -> MemorySource {
        let table = Table::new(
            "people",
            vec![
                Column::new("id", DataType::Int64),
                Column::new("name", DataType::String),
            ],
        );
        let rows = [(3, "c"), (1, "a"), (2, "b")]
            .into_iter()
            .map(|(id, name)| Row::new(vec![Scalar::I64(id), Scalar::Str(name.into())]))
            .collect();
        MemorySource::from_rows(table, rows).unwrap()
    }

    #[test]
    fn applies_query_and_reports_sort() {
        let mut t = source().into_transform();
        let cancel = CancelToken::new();
        let query = Query::new().with_sort(SortField::asc("id")).with_rows(2);
        assert!(t.open(AuditKey::new(1), &query, &cancel).unwrap());
        let rows = read_all(&mut t, &cancel).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![Scalar::I64(1), Scalar::I64(2)]);
        assert_eq!(t.produced_sort(), Some(&[SortField::asc("id")][..]));
    }

    #[test]
    fn query_holds_even_when_the_source_ignores_it() {
        use rowpipe_core::query::{CompareOp, Operand};

        let mut t = source().sort_pushdown(false).into_transform();
        let cancel = CancelToken::new();
        let query = Query::new()
            .with_filter(Filter::new("id", CompareOp::NotEq, Operand::Value(Scalar::I64(3))))
            .with_rows(1);
        t.open(AuditKey::default(), &query, &cancel).unwrap();
        let rows = read_all(&mut t, &cancel).unwrap();
        assert_eq!(rows, vec![Row::new(vec![Scalar::I64(1), Scalar::Str("a".into())])]);
        assert!(t.reset().unwrap());
        assert_eq!(read_all(&mut t, &cancel).unwrap().len(), 1);
    }

    #[test]
    fn failed_open_can_be_retried() {
        let mut t = source().fail_opens(1).into_transform();
        let cancel = CancelToken::new();
        assert!(matches!(
            t.open(AuditKey::default(), &Query::new(), &cancel),
            Err(OpError::Connection { operation: "open", .. })
        ));
        assert_eq!(t.state(), TransformState::Unopened);
        t.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        assert_eq!(read_all(&mut t, &cancel).unwrap().len(), 3);
    }

    #[test]
    fn read_failures_become_connection_errors() {
        let mut t = source().fail_after(1).into_transform();
        let cancel = CancelToken::new();
        t.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        assert!(t.read_next(&cancel).unwrap().is_some());
        match t.read_next(&cancel) {
            Err(OpError::Connection { operation, .. }) => assert_eq!(operation, "read"),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert_eq!(t.state(), TransformState::Failed);
    }

    #[test]
    fn non_restartable_reset_reports_false() {
        let mut t = source().restartable(false).into_transform();
        let cancel = CancelToken::new();
        t.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        t.read_next(&cancel).unwrap();
        assert!(!t.reset().unwrap());
        assert_eq!(t.read_next(&cancel).unwrap().map(|r| r[0].clone()), Some(Scalar::I64(1)));
    }

    #[test]
    fn cancelled_read_fails_fast() {
        let mut t = source().into_transform();
        let cancel = CancelToken::new();
        t.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        cancel.cancel();
        assert!(t.read_next(&cancel).unwrap_err().is_cancelled());
    }
}
