//! Lookup join: enrich each primary row with matching reference rows.
//!
//! The reference is opened once and queried through `Transform::lookup` with
//! equality filters built from the join pairs. Output rows are the primary
//! row followed by the reference columns; when nothing matches the reference
//! columns are null.

use std::collections::VecDeque;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{
    sort_satisfied, DuplicateStrategy, Filter, JoinPair, Lookup, Operand, Query,
};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use rowpipe_core::types::Scalar;

use crate::traits::{
    describe_filters, split_filters, BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform,
    TransformState,
};

/// Where a join key value comes from on the primary side.
#[derive(Debug, Clone)]
enum KeySource {
    Column(usize),
    Value(Scalar),
}

pub struct LookupTransform {
    primary: BoxedTransform,
    reference: BoxedTransform,
    keys: Vec<(KeySource, String)>,
    strategy: DuplicateStrategy,
    table: Table,
    reference_width: usize,
    lifecycle: Lifecycle,
    reference_open: bool,
    pending: VecDeque<Row>,
    residual: ResidualQuery,
}

impl LookupTransform {
    /// Reference columns are aliased with the reference table name.
    pub fn new(
        primary: BoxedTransform,
        reference: BoxedTransform,
        joins: Vec<JoinPair>,
        strategy: DuplicateStrategy,
    ) -> Result<Self, OpError> {
        let alias = reference.table().name.clone();
        Self::with_alias(primary, reference, joins, strategy, &alias)
    }

    pub fn with_alias(
        primary: BoxedTransform,
        reference: BoxedTransform,
        joins: Vec<JoinPair>,
        strategy: DuplicateStrategy,
        alias: &str,
    ) -> Result<Self, OpError> {
        let name = format!("lookup({} -> {})", primary.name(), reference.name());
        if joins.is_empty() {
            return Err(OpError::Schema(format!("{}: no join pairs", name)));
        }

        let primary_table = primary.table();
        let reference_table = reference.table();
        let mut keys = Vec::with_capacity(joins.len());
        for pair in joins {
            reference_table
                .ordinal(&pair.reference_column)
                .map_err(|e| OpError::in_transform(&name, e))?;
            let source = match pair.primary {
                Operand::Column(column) => KeySource::Column(
                    primary_table
                        .ordinal(&column)
                        .map_err(|e| OpError::in_transform(&name, e))?,
                ),
                Operand::Value(value) => KeySource::Value(value),
            };
            keys.push((source, pair.reference_column));
        }

        let mut columns = primary_table.columns.clone();
        columns.extend(reference_table.aliased(alias).columns);
        let table = Table::new(primary_table.name.clone(), columns);
        let reference_width = reference_table.width();

        Ok(Self {
            primary,
            reference,
            keys,
            strategy,
            table,
            reference_width,
            lifecycle: Lifecycle::new(name),
            reference_open: false,
            pending: VecDeque::new(),
            residual: ResidualQuery::default(),
        })
    }

    pub fn strategy(&self) -> DuplicateStrategy {
        self.strategy
    }

    /// Equality filters for `row`; `None` when a key is null, which never
    /// matches.
    fn filters_for(&self, row: &Row) -> Option<Vec<Filter>> {
        let mut filters = Vec::with_capacity(self.keys.len());
        for (source, column) in &self.keys {
            let value = match source {
                KeySource::Column(ordinal) => row.get(*ordinal)?.clone(),
                KeySource::Value(value) => value.clone(),
            };
            if value.is_null() {
                return None;
            }
            filters.push(Filter::equals(column.clone(), value));
        }
        Some(filters)
    }

    fn find_matches(&mut self, filters: &[Filter], cancel: &CancelToken) -> Result<Lookup, OpError> {
        let found = self
            .reference
            .lookup(filters, self.strategy, cancel)
            .map_err(|e| match e {
                OpError::DuplicateRows { count, .. } => OpError::DuplicateRows {
                    transform: self.lifecycle.name().to_string(),
                    key: describe_filters(filters),
                    count,
                },
                other => other,
            })?;
        // Reduce again in case the reference returned every match.
        self.strategy
            .apply(found.into_rows())
            .map_err(|e| match e {
                rowpipe_core::error::Error::DuplicateRows { count } => OpError::DuplicateRows {
                    transform: self.lifecycle.name().to_string(),
                    key: describe_filters(filters),
                    count,
                },
                other => OpError::in_transform(self.lifecycle.name(), other),
            })
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        cancel.check()?;
        if let Some(row) = self.pending.pop_front() {
            return Ok(Some(row));
        }
        let Some(primary_row) = self.primary.read_next(cancel)? else {
            return Ok(None);
        };

        let found = match self.filters_for(&primary_row) {
            Some(filters) => self.find_matches(&filters, cancel)?,
            None => Lookup::NotFound,
        };

        match found {
            Lookup::NotFound => Ok(Some(primary_row.append(Row::nulls(self.reference_width).into_values()))),
            Lookup::Found(rows) => {
                let mut matches = rows.into_iter();
                let Some(first) = matches.next() else {
                    return Ok(Some(
                        primary_row.append(Row::nulls(self.reference_width).into_values()),
                    ));
                };
                for extra in matches {
                    self.pending
                        .push_back(primary_row.clone().append(extra.into_values()));
                }
                Ok(Some(primary_row.append(first.into_values())))
            }
        }
    }

    /// Joined rows that pass the caller's reference-side filters and row cap.
    fn next_output(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        while !self.residual.is_exhausted() {
            let Some(row) = self.next_row(cancel)? else {
                return Ok(None);
            };
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

impl Transform for LookupTransform {
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
        self.pending.clear();
        // Primary-side filters go upstream; the rest and the row cap apply
        // to joined rows.
        let (pushed, residual) = split_filters(query, self.primary.table());
        let primary_query = Query {
            filters: pushed,
            ..Query::default()
        };
        let mut result = ResidualQuery::bind(&residual, query.rows, &self.table)
            .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
            .and_then(|residual| {
                self.residual = residual;
                self.primary.open(audit_key, &primary_query, cancel)
            });
        if result.is_ok() && !self.reference_open {
            result = match self.reference.open(audit_key, &Query::default(), cancel) {
                Ok(_) => {
                    self.reference_open = true;
                    Ok(false)
                }
                Err(e) => {
                    // Leave nothing half open so the caller can retry.
                    self.primary.close();
                    Err(e)
                }
            };
        }
        self.lifecycle.finish_open(result)?;
        tracing::debug!(transform = self.name(), strategy = ?self.strategy, "lookup opened");
        // Join expansion output carries no ordering guarantee.
        Ok(sort_satisfied(None, &query.sorts))
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = self.next_output(cancel);
        self.lifecycle.finish_read(result)
    }

    /// Rewinds the primary only; the reference stays open.
    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        let result = self.primary.reset();
        if let Ok(true) = result {
            self.pending.clear();
            self.residual.rewind();
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        self.pending.clear();
        self.primary.close();
        self.reference.close();
        self.reference_open = false;
        self.lifecycle.close();
    }

    fn pass_through_columns(&self) -> bool {
        true
    }
}
