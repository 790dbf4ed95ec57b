//! Query enforcement over any upstream.
//!
//! The transform's own query and the caller's are merged and handed to the
//! upstream, then enforced again on the rows that come back so the consumer
//! only ever sees rows that satisfy both. Sorting is left to `SortTransform`.

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{bind_filters, Query, SortField};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;

use crate::traits::{BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform, TransformState};

pub struct QueryTransform {
    upstream: BoxedTransform,
    query: Query,
    table: Table,
    lifecycle: Lifecycle,
    residual: ResidualQuery,
}

/// Both queries at once: every filter of either, the smaller row cap, and
/// the caller's sort when it asks for one.
fn merge(own: &Query, caller: &Query) -> Query {
    let mut filters = own.filters.clone();
    filters.extend(caller.filters.iter().cloned());
    let rows = match (own.rows, caller.rows) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let sorts = if caller.sorts.is_empty() {
        own.sorts.clone()
    } else {
        caller.sorts.clone()
    };
    Query {
        filters,
        sorts,
        rows,
        joins: own.joins.clone(),
    }
}

impl QueryTransform {
    pub fn new(upstream: BoxedTransform, query: Query) -> Result<Self, OpError> {
        let name = format!("query({})", upstream.name());
        let table = upstream.table().schema();
        bind_filters(&query.filters, &table).map_err(|e| OpError::in_transform(&name, e))?;
        Ok(Self {
            upstream,
            query,
            table,
            lifecycle: Lifecycle::new(name),
            residual: ResidualQuery::default(),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        while !self.residual.is_exhausted() {
            cancel.check()?;
            let Some(row) = self.upstream.read_next(cancel)? else {
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

impl Transform for QueryTransform {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn table(&self) -> &Table {
        &self.table
    }

    fn state(&self) -> TransformState {
        self.lifecycle.state()
    }

    /// The caller's query is merged with the transform's own; the merged
    /// query goes upstream and is enforced again on the rows that come back.
    fn open(
        &mut self,
        audit_key: AuditKey,
        query: &Query,
        cancel: &CancelToken,
    ) -> Result<bool, OpError> {
        self.lifecycle.begin_open()?;
        let merged = merge(&self.query, query);
        let result = ResidualQuery::bind(&merged.filters, merged.rows, &self.table)
            .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
            .and_then(|residual| {
                self.residual = residual;
                self.upstream.open(audit_key, &merged, cancel)
            });
        self.lifecycle.finish_open(result)
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
        let result = self.upstream.reset();
        if let Ok(true) = result {
            self.residual.rewind();
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        self.upstream.close();
        self.lifecycle.close();
    }

    fn produced_sort(&self) -> Option<&[SortField]> {
        self.upstream.produced_sort()
    }

    fn pass_through_columns(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::traits::read_all;
    use rowpipe_core::query::{CompareOp, Filter, Operand};
    use rowpipe_core::schema::{Column, DataType};
    use rowpipe_core::types::Scalar;

    #[test]
    fn nested_queries_compose() {
        let table = Table::new("n", vec![Column::new("v", DataType::Int64)]);
        let rows = (0..10).map(|i| Row::new(vec![Scalar::I64(i)])).collect();
        let source = MemorySource::from_rows(table, rows).unwrap();
        let inner = QueryTransform::new(Box::new(source.into_transform()), Query::new()).unwrap();
        let query = Query::new()
            .with_filter(Filter::new("v", CompareOp::GtEq, Operand::Value(Scalar::I32(4))))
            .with_rows(3);
        let mut t = QueryTransform::new(Box::new(inner), query).unwrap();
        let cancel = CancelToken::new();
        t.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        let rows = read_all(&mut t, &cancel).unwrap();
        let vals: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(vals, vec![Scalar::I64(4), Scalar::I64(5), Scalar::I64(6)]);
        assert!(t.reset().unwrap());
        assert_eq!(read_all(&mut t, &cancel).unwrap().len(), 3);
    }

    #[test]
    fn caller_query_is_merged_with_its_own() {
        let table = Table::new("n", vec![Column::new("v", DataType::Int64)]);
        let rows = (0..10).map(|i| Row::new(vec![Scalar::I64(i)])).collect();
        let source = MemorySource::from_rows(table, rows).unwrap();
        let own = Query::new()
            .with_filter(Filter::new("v", CompareOp::GtEq, Operand::Value(Scalar::I64(2))))
            .with_rows(5);
        let mut t = QueryTransform::new(Box::new(source.into_transform()), own).unwrap();
        let caller = Query::new()
            .with_filter(Filter::new("v", CompareOp::NotEq, Operand::Value(Scalar::I64(3))))
            .with_rows(2);
        let cancel = CancelToken::new();
        t.open(AuditKey::default(), &caller, &cancel).unwrap();
        let vals: Vec<_> = read_all(&mut t, &cancel)
            .unwrap()
            .into_iter()
            .map(|r| r[0].clone())
            .collect();
        assert_eq!(vals, vec![Scalar::I64(2), Scalar::I64(4)]);
    }
}
