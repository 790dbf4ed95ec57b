//! Expose a nested row-set as an ordinary transform.

use std::sync::Arc;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{sort_satisfied, DuplicateStrategy, Filter, Lookup, Query, SortField};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use rowpipe_core::types::{RowSet, Scalar};

use crate::source::{scan_lookup, select_rows};
use crate::traits::{describe_filters, Lifecycle, OpError, Transform, TransformState};

/// Restartable transform over the child rows of a node cell.
pub struct NodeTransform {
    set: Arc<RowSet>,
    table: Table,
    lifecycle: Lifecycle,
    view: Vec<Row>,
    position: usize,
    produced: Option<Vec<SortField>>,
}

impl NodeTransform {
    pub fn new(set: Arc<RowSet>) -> Self {
        let table = set.table.schema();
        let lifecycle = Lifecycle::new(format!("node({})", table.name));
        Self {
            set,
            table,
            lifecycle,
            view: Vec::new(),
            position: 0,
            produced: None,
        }
    }

    /// Build from a node cell; a null cell is an empty set of `table`.
    pub fn from_cell(cell: &Scalar, table: &Table) -> Result<Self, OpError> {
        match cell {
            Scalar::Node(set) => Ok(Self::new(Arc::clone(set))),
            Scalar::Null => Ok(Self::new(Arc::new(RowSet::new(table.schema(), Vec::new())))),
            other => Err(OpError::Schema(format!(
                "expected a node value for '{}', got {:?}",
                table.name,
                other.data_type()
            ))),
        }
    }
}

impl Transform for NodeTransform {
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
        _audit_key: AuditKey,
        query: &Query,
        cancel: &CancelToken,
    ) -> Result<bool, OpError> {
        self.lifecycle.begin_open()?;
        let result = cancel.check().map_err(OpError::from).and_then(|_| {
            select_rows(self.set.rows.iter(), &self.table, query)
                .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
        });
        let (view, sorted) = self.lifecycle.finish_open(result)?;
        self.view = view;
        self.position = 0;
        self.produced = sorted.then(|| query.sorts.clone());
        Ok(sort_satisfied(self.produced.as_deref(), &query.sorts))
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = cancel.check().map_err(OpError::from).map(|_| {
            let row = self.view.get(self.position).cloned();
            if row.is_some() {
                self.position += 1;
            }
            row
        });
        self.lifecycle.finish_read(result)
    }

    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        self.position = 0;
        self.lifecycle.finish_reset(Ok(true))
    }

    fn close(&mut self) {
        self.view.clear();
        self.position = 0;
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
        scan_lookup(self.set.rows.iter(), &self.table, filters, strategy).map_err(|e| match e {
            rowpipe_core::error::Error::DuplicateRows { count } => OpError::DuplicateRows {
                transform: self.lifecycle.name().to_string(),
                key: describe_filters(filters),
                count,
            },
            other => OpError::in_transform(self.lifecycle.name(), other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::SortTransform;
    use crate::traits::read_all;
    use rowpipe_core::schema::{Column, DataType};

    fn set() -> Arc<RowSet> {
        let table = Table::new("lines", vec![Column::new("qty", DataType::Int32)]);
        let rows = [3, 1, 2].iter().map(|q| Row::new(vec![Scalar::I32(*q)])).collect();
        Arc::new(RowSet::new(table, rows))
    }

    #[test]
    fn nested_sets_sort_like_any_source() {
        let node = NodeTransform::new(set());
        let mut sort = SortTransform::new(Box::new(node), vec![SortField::desc("qty")]).unwrap();
        let cancel = CancelToken::new();
        sort.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        assert!(sort.is_pass_through());
        let qty: Vec<_> = read_all(&mut sort, &cancel)
            .unwrap()
            .into_iter()
            .map(|r| r[0].clone())
            .collect();
        assert_eq!(qty, vec![Scalar::I32(3), Scalar::I32(2), Scalar::I32(1)]);
    }

    #[test]
    fn lookups_scan_the_set() {
        let mut node = NodeTransform::new(set());
        let cancel = CancelToken::new();
        node.open(AuditKey::default(), &Query::new(), &cancel).unwrap();
        let found = node
            .lookup(&[Filter::equals("qty", 1)], DuplicateStrategy::Abend, &cancel)
            .unwrap();
        assert!(found.is_found());
        assert!(node.reset().unwrap());
    }
}
