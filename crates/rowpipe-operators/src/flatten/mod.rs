//! Flatten nested node columns into parent rows.
//!
//! A node cell holds a child row-set. Flattening replaces the node column
//! with the child's columns and emits one output row per child row, repeating
//! the parent's other columns. Nesting is followed along a declared path of
//! node column names, up to `max_depth` levels; deeper nodes stay nested.
//!
//! Expansion builds each output row from immutable slices of the parent and
//! child rows, so sibling rows that share a parent prefix never alias.

mod node;

pub use node::NodeTransform;

use std::collections::VecDeque;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{sort_satisfied, Query, SortField};
use rowpipe_core::row::Row;
use rowpipe_core::schema::{Column, Table};
use rowpipe_core::types::Scalar;

use crate::traits::{
    split_filters, BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform, TransformState,
};

/// One node column along the flatten path.
#[derive(Debug, Clone)]
struct Level {
    /// Position of the node column within its parent row.
    ordinal: usize,
    /// Declared width of the child rows.
    child_width: usize,
    /// Width of the expanded segment that replaces the node column.
    segment_width: usize,
    next: Option<Box<Level>>,
}

/// Resolve `path` within `columns`, returning the level plan and the
/// columns of the expanded segment.
fn plan_level(
    columns: &[Column],
    path: &[String],
    depth: usize,
) -> Result<(Level, Vec<Column>), String> {
    let name = &path[0];
    let ordinal = columns
        .iter()
        .position(|c| &c.name == name)
        .ok_or_else(|| format!("node column '{}' not found", name))?;
    let node = &columns[ordinal];
    if !node.is_node() {
        return Err(format!("column '{}' is not a node column", name));
    }
    let children = &node.child_columns;

    let (next, expanded) = if depth > 1 && path.len() > 1 {
        let (level, segment) = plan_level(children, &path[1..], depth - 1)?;
        let mut expanded = Vec::with_capacity(children.len() + segment.len());
        expanded.extend_from_slice(&children[..level.ordinal]);
        expanded.extend(segment);
        expanded.extend_from_slice(&children[level.ordinal + 1..]);
        (Some(Box::new(level)), expanded)
    } else {
        (None, children.clone())
    };

    let segment: Vec<Column> = expanded
        .into_iter()
        .map(|c| {
            if c.alias.is_some() {
                c
            } else {
                c.with_alias(name.clone())
            }
        })
        .collect();
    Ok((
        Level {
            ordinal,
            child_width: children.len(),
            segment_width: segment.len(),
            next,
        },
        segment,
    ))
}

/// Splice `segment` into `row` in place of the value at `ordinal`.
fn splice(row: &[Scalar], ordinal: usize, segment: Vec<Scalar>) -> Vec<Scalar> {
    let mut out = Vec::with_capacity(row.len() + segment.len());
    out.extend_from_slice(&row[..ordinal]);
    out.extend(segment);
    out.extend_from_slice(&row[ordinal + 1..]);
    out
}

pub struct FlattenTransform {
    upstream: BoxedTransform,
    path: Vec<String>,
    plan: Option<Level>,
    suppress_empty: bool,
    table: Table,
    lifecycle: Lifecycle,
    buffer: VecDeque<Row>,
    produced: Option<Vec<SortField>>,
    residual: ResidualQuery,
}

impl FlattenTransform {
    /// Flatten along `path` (outermost node first) with no depth limit.
    pub fn new(upstream: BoxedTransform, path: Vec<String>) -> Result<Self, OpError> {
        Self::with_max_depth(upstream, path, usize::MAX)
    }

    /// Flatten at most `max_depth` levels of `path`; a depth of 0 passes rows
    /// through unchanged.
    pub fn with_max_depth(
        upstream: BoxedTransform,
        path: Vec<String>,
        max_depth: usize,
    ) -> Result<Self, OpError> {
        let name = format!("flatten({})", upstream.name());
        let upstream_table = upstream.table();
        let (plan, table) = if path.is_empty() || max_depth == 0 {
            (None, upstream_table.schema())
        } else {
            let (level, segment) = plan_level(&upstream_table.columns, &path, max_depth)
                .map_err(|msg| OpError::Schema(format!("{}: {}", name, msg)))?;
            let columns = splice_columns(&upstream_table.columns, level.ordinal, segment);
            (Some(level), Table::new(upstream_table.name.clone(), columns))
        };
        Ok(Self {
            upstream,
            path,
            plan,
            suppress_empty: false,
            table,
            lifecycle: Lifecycle::new(name),
            buffer: VecDeque::new(),
            produced: None,
            residual: ResidualQuery::default(),
        })
    }

    /// Drop parents whose child set is empty instead of emitting a null row.
    pub fn suppress_empty(mut self, suppress: bool) -> Self {
        self.suppress_empty = suppress;
        self
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Expand one node cell into row segments of `level.segment_width`.
    fn expand(&self, level: &Level, cell: &Scalar) -> Result<Vec<Vec<Scalar>>, OpError> {
        let children: &[Row] = match cell {
            Scalar::Null => &[],
            Scalar::Node(set) => &set.rows,
            other => {
                return Err(OpError::Schema(format!(
                    "{}: expected a node value, got {:?}",
                    self.name(),
                    other.data_type()
                )))
            }
        };

        if children.is_empty() {
            return Ok(if self.suppress_empty {
                Vec::new()
            } else {
                vec![vec![Scalar::Null; level.segment_width]]
            });
        }

        let mut out = Vec::new();
        for child in children {
            if child.len() != level.child_width {
                return Err(OpError::Schema(format!(
                    "{}: child row has {} values, expected {}",
                    self.name(),
                    child.len(),
                    level.child_width
                )));
            }
            match &level.next {
                None => out.push(child.values().to_vec()),
                Some(next) => {
                    for segment in self.expand(next, &child[next.ordinal])? {
                        out.push(splice(child.values(), next.ordinal, segment));
                    }
                }
            }
        }
        Ok(out)
    }

    fn next_row(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        loop {
            cancel.check()?;
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            let Some(parent) = self.upstream.read_next(cancel)? else {
                return Ok(None);
            };
            let Some(level) = &self.plan else {
                return Ok(Some(parent));
            };
            let segments = self.expand(level, &parent[level.ordinal])?;
            tracing::trace!(transform = self.name(), rows = segments.len(), "expanded parent row");
            for segment in segments {
                self.buffer
                    .push_back(Row::new(splice(parent.values(), level.ordinal, segment)));
            }
        }
    }

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

    /// Name of the node column this transform replaces, if any.
    fn flattened_column(&self) -> Option<&str> {
        self.plan
            .as_ref()
            .map(|level| self.upstream.table().columns[level.ordinal].name.as_str())
    }
}

fn splice_columns(columns: &[Column], ordinal: usize, segment: Vec<Column>) -> Vec<Column> {
    let mut out = Vec::with_capacity(columns.len() + segment.len());
    out.extend_from_slice(&columns[..ordinal]);
    out.extend(segment);
    out.extend_from_slice(&columns[ordinal + 1..]);
    out
}

impl Transform for FlattenTransform {
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
        self.buffer.clear();
        // Filters and sort keys on parent columns hold for every expanded
        // row and go upstream. Filters on child columns and the row cap are
        // checked here.
        let node = self.flattened_column().map(str::to_string);
        let (mut pushed, mut residual) = split_filters(query, self.upstream.table());
        if let Some(node) = &node {
            let (on_node, parent): (Vec<_>, Vec<_>) =
                pushed.into_iter().partition(|f| &f.column == node);
            pushed = parent;
            residual.extend(on_node);
        }
        let parent_sort = query.sorts.iter().all(|f| {
            self.upstream.table().index_of(&f.column).is_some()
                && node.as_deref() != Some(f.column.as_str())
        });
        let upstream_query = Query {
            filters: pushed,
            sorts: if parent_sort { query.sorts.clone() } else { Vec::new() },
            ..Query::default()
        };
        let result = ResidualQuery::bind(&residual, query.rows, &self.table)
            .map_err(|e| OpError::in_transform(self.lifecycle.name(), e))
            .and_then(|residual| {
                self.residual = residual;
                self.upstream.open(audit_key, &upstream_query, cancel)
            });
        self.lifecycle.finish_open(result)?;

        // Parent order survives unless it was keyed on the flattened column.
        self.produced = match (&self.plan, self.upstream.produced_sort()) {
            (None, order) => order.map(<[SortField]>::to_vec),
            (Some(level), Some(order)) => {
                let node = &self.upstream.table().columns[level.ordinal].name;
                if order.iter().any(|f| &f.column == node) {
                    None
                } else {
                    Some(order.to_vec())
                }
            }
            (Some(_), None) => None,
        };
        Ok(sort_satisfied(self.produced.as_deref(), &query.sorts))
    }

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError> {
        if !self.lifecycle.begin_read()? {
            return Ok(None);
        }
        let result = self.next_output(cancel);
        self.lifecycle.finish_read(result)
    }

    fn reset(&mut self) -> Result<bool, OpError> {
        self.lifecycle.begin_reset()?;
        let result = self.upstream.reset();
        if let Ok(true) = result {
            self.buffer.clear();
            self.residual.rewind();
        }
        self.lifecycle.finish_reset(result)
    }

    fn close(&mut self) {
        self.buffer.clear();
        self.upstream.close();
        self.lifecycle.close();
    }

    fn produced_sort(&self) -> Option<&[SortField]> {
        self.produced.as_deref()
    }
}
