//! Sort transform.
//!
//! Negotiates with its upstream first: the required order is requested on
//! open, and when the upstream reports it can honor it the sort streams rows
//! through untouched. Otherwise the upstream is drained into an index on the
//! first read and rows are served in key order.

mod index;

pub use index::SortIndex;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{bind_sort, sort_satisfied, BoundSort, Query, SortField};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use rowpipe_mem::MemoryBudgetImpl;

use crate::traits::{BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform, TransformState};

enum SortMode {
    /// Upstream already yields the required order.
    PassThrough,
    Pending,
    Serving(SortIndex),
    Exhausted,
}

pub struct SortTransform {
    upstream: BoxedTransform,
    fields: Vec<SortField>,
    keys: BoundSort,
    table: Table,
    lifecycle: Lifecycle,
    mode: SortMode,
    budget: Option<MemoryBudgetImpl>,
    residual: ResidualQuery,
}

impl SortTransform {
    pub fn new(upstream: BoxedTransform, fields: Vec<SortField>) -> Result<Self, OpError> {
        let name = format!("sort({})", upstream.name());
        let table = upstream.table().schema();
        let keys = bind_sort(&fields, &table).map_err(|e| OpError::in_transform(&name, e))?;
        Ok(Self {
            upstream,
            fields,
            keys,
            table,
            lifecycle: Lifecycle::new(name),
            mode: SortMode::Pending,
            budget: None,
            residual: ResidualQuery::default(),
        })
    }

    /// Account buffered rows against `budget`.
    pub fn with_budget(mut self, budget: MemoryBudgetImpl) -> Self {
        self.budget = Some(budget);
        self
    }

    /// True when the upstream satisfied the order and no buffering happens.
    pub fn is_pass_through(&self) -> bool {
        matches!(self.mode, SortMode::PassThrough)
    }

    /// Rows currently held by the index.
    pub fn buffered_rows(&self) -> usize {
        match &self.mode {
            SortMode::Serving(index) => index.len(),
            _ => 0,
        }
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        cancel.check()?;
        if let SortMode::Pending = self.mode {
            let index = SortIndex::build(
                self.lifecycle.name(),
                self.upstream.as_mut(),
                &self.keys,
                self.budget.as_ref(),
                cancel,
            )?;
            self.mode = SortMode::Serving(index);
        }
        match &mut self.mode {
            SortMode::PassThrough => self.upstream.read_next(cancel),
            SortMode::Serving(index) => {
                let row = index.pop();
                if index.is_empty() {
                    // Release the index and its budget as soon as it drains.
                    self.mode = SortMode::Exhausted;
                }
                Ok(row)
            }
            SortMode::Pending | SortMode::Exhausted => Ok(None),
        }
    }

    /// Sorted rows up to the caller's row cap.
    fn next_output(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if self.residual.is_exhausted() {
            return Ok(None);
        }
        let row = self.next_row(cancel)?;
        if let Some(row) = &row {
            self.residual
                .admit(row)
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))?;
        }
        Ok(row)
    }
}

impl Transform for SortTransform {
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
        // Filters go upstream; the row cap is applied to sorted output.
        let upstream_query = query.without_rows().sorted_by(&self.fields);
        self.residual = ResidualQuery::row_cap(query.rows);
        let result = cancel
            .check()
            .map_err(OpError::from)
            .and_then(|_| self.upstream.open(audit_key, &upstream_query, cancel));
        let upstream_sorted = self.lifecycle.finish_open(result)?;

        let pass_through =
            upstream_sorted || sort_satisfied(self.upstream.produced_sort(), &self.fields);
        self.mode = if pass_through {
            SortMode::PassThrough
        } else {
            SortMode::Pending
        };
        tracing::debug!(transform = self.name(), pass_through, "sort opened");
        Ok(sort_satisfied(Some(&self.fields), &query.sorts))
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = self.next_output(cancel);
        self.lifecycle.finish_read(result)
    }

    /// Discards the index; the next read rebuilds it from the rewound upstream.
    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        let result = self.upstream.reset();
        if let Ok(true) = result {
            if !self.is_pass_through() {
                self.mode = SortMode::Pending;
            }
            self.residual.rewind();
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        if !self.is_pass_through() {
            self.mode = SortMode::Pending;
        }
        self.upstream.close();
        self.lifecycle.close();
    }

    fn required_sort(&self) -> &[SortField] {
        &self.fields
    }

    fn produced_sort(&self) -> Option<&[SortField]> {
        Some(&self.fields)
    }

    fn pass_through_columns(&self) -> bool {
        true
    }
}
