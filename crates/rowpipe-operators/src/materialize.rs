//! Materialize transform: drain an upstream once and replay it.
//!
//! Rows are pulled into a `RowCache` on the first read (or lookup) after
//! `open`. `reset` rewinds over the cache without touching the upstream, so
//! a materialized subtree can be re-read any number of times at the cost of
//! holding its rows. Equality lookups go through a lazily built hash index.

use std::collections::HashMap;

use rowpipe_core::cache::RowCache;
use rowpipe_core::cancel::CancelToken;
use rowpipe_core::hash::hash_key;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{
    bind_filters, matches_all, BoundFilter, BoundOperand, DuplicateStrategy, Filter, Lookup, Query,
    SortField,
};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use rowpipe_mem::{BudgetGuardImpl, MemoryBudgetImpl};

use crate::source::scan_lookup;
use crate::traits::{describe_filters, BoxedTransform, Lifecycle, OpError, Transform, TransformState};

/// Row positions keyed by the hash of the indexed columns.
type KeyIndex = HashMap<u64, Vec<usize>>;

pub struct MaterializeTransform {
    upstream: BoxedTransform,
    table: Table,
    lifecycle: Lifecycle,
    cache: RowCache,
    loaded: bool,
    /// A drain started and failed; the upstream is mid-stream or failed.
    drain_failed: bool,
    position: usize,
    drains: usize,
    indexes: HashMap<Vec<usize>, KeyIndex>,
    budget: Option<MemoryBudgetImpl>,
    guard: Option<BudgetGuardImpl>,
}

impl MaterializeTransform {
    pub fn new(upstream: BoxedTransform) -> Self {
        let name = format!("materialize({})", upstream.name());
        let table = upstream.table().schema();
        Self {
            upstream,
            table,
            lifecycle: Lifecycle::new(name),
            cache: RowCache::unbounded(),
            loaded: false,
            drain_failed: false,
            position: 0,
            drains: 0,
            indexes: HashMap::new(),
            budget: None,
            guard: None,
        }
    }

    /// Keep only the most recent `capacity` rows.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.cache = RowCache::new(capacity);
        self
    }

    pub fn with_budget(mut self, budget: MemoryBudgetImpl) -> Self {
        self.budget = Some(budget);
        self
    }

    /// How many times the upstream has been drained.
    pub fn drain_count(&self) -> usize {
        self.drains
    }

    pub fn cached(&self) -> &RowCache {
        &self.cache
    }

    fn ensure_loaded(&mut self, cancel: &CancelToken) -> Result<(), OpError> {
        if self.loaded {
            return Ok(());
        }
        if let Err(e) = self.drain(cancel) {
            // A partial cache is never served.
            self.release();
            self.drain_failed = true;
            return Err(e);
        }
        self.loaded = true;
        self.drains += 1;
        tracing::debug!(transform = self.name(), rows = self.cache.len(), "materialized");
        Ok(())
    }

    fn drain(&mut self, cancel: &CancelToken) -> Result<(), OpError> {
        let name = self.lifecycle.name().to_string();
        if self.guard.is_none() {
            if let Some(budget) = &self.budget {
                self.guard = Some(
                    budget
                        .acquire(0, "materialize")
                        .map_err(|e| OpError::memory(&name, e))?,
                );
            }
        }
        let mut held = 0usize;
        while let Some(row) = self.upstream.read_next(cancel)? {
            cancel.check()?;
            held += row.estimated_bytes();
            if let Some(evicted) = self.cache.push(row) {
                held = held.saturating_sub(evicted.estimated_bytes());
            }
            if let Some(guard) = self.guard.as_mut() {
                if !guard.try_resize(held) {
                    return Err(OpError::Memory {
                        transform: name,
                        message: format!("cannot hold {} cached bytes", held),
                    });
                }
            }
        }
        Ok(())
    }

    fn index_for(&mut self, ordinals: &[usize]) -> &KeyIndex {
        let cache = &self.cache;
        self.indexes.entry(ordinals.to_vec()).or_insert_with(|| {
            let mut index = KeyIndex::new();
            for (pos, row) in cache.iter().enumerate() {
                let key = row.project(ordinals);
                if key.iter().any(|v| v.is_null()) {
                    continue;
                }
                index.entry(hash_key(&key)).or_default().push(pos);
            }
            index
        })
    }

    fn indexed_lookup(
        &mut self,
        bound: &[BoundFilter],
        strategy: DuplicateStrategy,
    ) -> Result<Lookup, rowpipe_core::error::Error> {
        let mut ordinals = Vec::with_capacity(bound.len());
        let mut key = Vec::with_capacity(bound.len());
        for f in bound {
            if let BoundOperand::Value(v) = &f.operand {
                ordinals.push(f.ordinal);
                key.push(v.clone());
            }
        }
        if key.iter().any(|v| v.is_null()) {
            return Ok(Lookup::NotFound);
        }
        let candidates = self
            .index_for(&ordinals)
            .get(&hash_key(&key))
            .cloned()
            .unwrap_or_default();
        let mut matched = Vec::new();
        for pos in candidates {
            if let Some(row) = self.cache.get(pos) {
                // Hash collisions are resolved by re-checking the filters.
                if matches_all(bound, row)? {
                    matched.push(row.clone());
                }
            }
        }
        strategy.apply(matched)
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        cancel.check()?;
        self.ensure_loaded(cancel)?;
        let row = self.cache.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }

    fn release(&mut self) {
        self.cache.clear();
        self.indexes.clear();
        self.guard = None;
        self.loaded = false;
        self.drain_failed = false;
        self.position = 0;
    }
}

impl Transform for MaterializeTransform {
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
        self.release();
        let result = self.upstream.open(audit_key, query, cancel);
        self.lifecycle.finish_open(result)
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = self.next_row(cancel);
        self.lifecycle.finish_read(result)
    }

    /// Always rewindable once loaded; the upstream is not re-read. After a
    /// failed drain the upstream itself must rewind so the next read can
    /// drain it from the start.
    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        let result = if self.drain_failed {
            let rewound = self.upstream.reset();
            if let Ok(true) = rewound {
                self.drain_failed = false;
            }
            rewound
        } else {
            Ok(true)
        };
        if let Ok(true) = result {
            self.position = 0;
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        self.release();
        self.upstream.close();
        self.lifecycle.close();
    }

    fn produced_sort(&self) -> Option<&[SortField]> {
        self.upstream.produced_sort()
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
        cancel.check()?;
        self.ensure_loaded(cancel)?;
        let name = self.lifecycle.name().to_string();
        let bound =
            bind_filters(filters, &self.table).map_err(|e| OpError::in_transform(&name, e))?;
        let result = if !filters.is_empty() && filters.iter().all(Filter::is_equality_literal) {
            self.indexed_lookup(&bound, strategy)
        } else {
            scan_lookup(self.cache.iter(), &self.table, filters, strategy)
        };
        result.map_err(|e| match e {
            rowpipe_core::error::Error::DuplicateRows { count } => OpError::DuplicateRows {
                transform: name.clone(),
                key: describe_filters(filters),
                count,
            },
            other => OpError::in_transform(&name, other),
        })
    }
}
