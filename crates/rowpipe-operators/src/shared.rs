//! Materialized rows shared by several readers, possibly on other threads.
//!
//! `SharedMaterialized` owns the upstream behind a mutex and pulls rows only
//! as far as the furthest reader has asked. Each `SharedReader` keeps its own
//! cursor, so row `i` is the same for every reader regardless of the order in
//! which they run.

use std::sync::{Arc, Mutex, MutexGuard};

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{sort_satisfied, DuplicateStrategy, Filter, Lookup, Query};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;

use crate::source::scan_lookup;
use crate::traits::{
    describe_filters, BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform, TransformState,
};

struct SharedState {
    upstream: BoxedTransform,
    rows: Vec<Row>,
    opened: bool,
    exhausted: bool,
}

#[derive(Clone)]
pub struct SharedMaterialized {
    name: Arc<str>,
    table: Arc<Table>,
    audit_key: AuditKey,
    query: Arc<Query>,
    state: Arc<Mutex<SharedState>>,
}

impl SharedMaterialized {
    /// The upstream is opened with `audit_key` and `query` by whichever
    /// reader first needs a row.
    pub fn new(upstream: BoxedTransform, audit_key: AuditKey, query: Query) -> Self {
        let name: Arc<str> = Arc::from(format!("shared({})", upstream.name()));
        let table = Arc::new(upstream.table().schema());
        Self {
            name,
            table,
            audit_key,
            query: Arc::new(query),
            state: Arc::new(Mutex::new(SharedState {
                upstream,
                rows: Vec::new(),
                opened: false,
                exhausted: false,
            })),
        }
    }

    pub fn reader(&self) -> SharedReader {
        SharedReader {
            shared: self.clone(),
            lifecycle: Lifecycle::new(self.name.to_string()),
            position: 0,
            residual: ResidualQuery::default(),
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    fn lock(&self) -> Result<MutexGuard<'_, SharedState>, OpError> {
        self.state.lock().map_err(|_| OpError::Pipeline {
            transform: self.name.to_string(),
            message: "shared state lock poisoned".into(),
        })
    }

    /// Pull from the upstream until row `until` is loaded or it runs dry.
    fn fill(&self, state: &mut SharedState, until: Option<usize>, cancel: &CancelToken) -> Result<(), OpError> {
        if !state.opened {
            state.upstream.open(self.audit_key, &self.query, cancel)?;
            state.opened = true;
        }
        while !state.exhausted && until.map_or(true, |i| state.rows.len() <= i) {
            cancel.check()?;
            match state.upstream.read_next(cancel)? {
                Some(row) => state.rows.push(row),
                None => {
                    state.exhausted = true;
                    tracing::debug!(transform = %self.name, rows = state.rows.len(), "shared rows loaded");
                }
            }
        }
        Ok(())
    }

    /// Row at `index`, loading it on demand.
    pub fn row(&self, index: usize, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        let mut state = self.lock()?;
        self.fill(&mut state, Some(index), cancel)?;
        Ok(state.rows.get(index).cloned())
    }

    /// Rows loaded so far.
    pub fn loaded(&self) -> Result<usize, OpError> {
        Ok(self.lock()?.rows.len())
    }

    pub fn lookup(
        &self,
        filters: &[Filter],
        strategy: DuplicateStrategy,
        cancel: &CancelToken,
    ) -> Result<Lookup, OpError> {
        let mut state = self.lock()?;
        self.fill(&mut state, None, cancel)?;
        scan_lookup(state.rows.iter(), &self.table, filters, strategy).map_err(|e| match e {
            rowpipe_core::error::Error::DuplicateRows { count } => OpError::DuplicateRows {
                transform: self.name.to_string(),
                key: describe_filters(filters),
                count,
            },
            other => OpError::in_transform(&self.name, other),
        })
    }

    /// Close the upstream and drop loaded rows.
    pub fn close(&self) -> Result<(), OpError> {
        let mut state = self.lock()?;
        state.upstream.close();
        state.rows.clear();
        state.opened = false;
        state.exhausted = false;
        Ok(())
    }
}

/// Independent cursor over a `SharedMaterialized`.
///
/// The shared rows are loaded once for every reader, so each reader applies
/// its own query's filters and row cap to them.
pub struct SharedReader {
    shared: SharedMaterialized,
    lifecycle: Lifecycle,
    position: usize,
    residual: ResidualQuery,
}

impl SharedReader {
    pub fn position(&self) -> usize {
        self.position
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        while !self.residual.is_exhausted() {
            let Some(row) = self.shared.row(self.position, cancel)? else {
                return Ok(None);
            };
            self.position += 1;
            let keep = self
                .residual
                .admit(&row)
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))?;
            if keep {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

impl Transform for SharedReader {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn table(&self) -> &Table {
        self.shared.table()
    }

    fn state(&self) -> TransformState {
        self.lifecycle.state()
    }

    fn open(
        &mut self,
        _audit_key: AuditKey,
        query: &Query,
        cancel: &CancelToken,
    ) -> Result<bool, OpError> {
        self.lifecycle.begin_open()?;
        self.position = 0;
        let result = cancel.check().map_err(OpError::from).and_then(|_| {
            ResidualQuery::bind(&query.filters, query.rows, self.shared.table())
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
        });
        self.residual = self.lifecycle.finish_open(result)?;
        Ok(sort_satisfied(None, &query.sorts))
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
        self.position = 0;
        self.residual.rewind();
        self.lifecycle.finish_reset(Ok(true))
    }

    /// Closes this cursor only; the shared rows stay loaded.
    fn close(&mut self) {
        self.lifecycle.close();
    }

    fn pass_through_columns(&self) -> bool {
        true
    }

    fn lookup(
        &mut self,
        filters: &[Filter],
        strategy: DuplicateStrategy,
        cancel: &CancelToken,
    ) -> Result<Lookup, OpError> {
        self.lifecycle.check_lookup()?;
        self.shared.lookup(filters, strategy, cancel)
    }
}
