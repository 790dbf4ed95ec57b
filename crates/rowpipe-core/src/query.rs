//! Query descriptor passed down a pipeline on open.
//!
//! A `Query` expresses intent only: filters, sort keys, a row cap and join
//! pairs. Each transform either satisfies it internally or forwards it so an
//! upstream can, and the transform that finally consumes the rows enforces
//! whatever was left unsatisfied.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::row::Row;
use crate::schema::Table;
use crate::types::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    pub column: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// True when `produced` order satisfies `required` order: same columns,
/// directions and sequence. An empty requirement is always satisfied.
pub fn sort_satisfied(produced: Option<&[SortField]>, required: &[SortField]) -> bool {
    required.is_empty() || produced == Some(required)
}

/// Sort keys resolved against a table: `(ordinal, direction)`.
pub type BoundSort = Vec<(usize, SortDirection)>;

pub fn bind_sort(fields: &[SortField], table: &Table) -> Result<BoundSort> {
    fields
        .iter()
        .map(|f| Ok((table.ordinal(&f.column)?, f.direction)))
        .collect()
}

/// Compare two rows on bound sort keys.
pub fn compare_rows(a: &Row, b: &Row, keys: &[(usize, SortDirection)]) -> Result<Ordering> {
    for &(ordinal, direction) in keys {
        let ord = a[ordinal].try_cmp(&b[ordinal])?;
        let ord = match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Stable in-place sort of `rows`; the first comparison error aborts.
pub fn sort_rows(rows: &mut [Row], keys: &[(usize, SortDirection)]) -> Result<()> {
    let mut failure = None;
    rows.sort_by(|a, b| match compare_rows(a, b, keys) {
        Ok(ord) => ord,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    failure.map_or(Ok(()), Err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Column(String),
    Value(Scalar),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub operand: Operand,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: CompareOp, operand: Operand) -> Self {
        Self {
            column: column.into(),
            op,
            operand,
        }
    }

    pub fn equals(column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(column, CompareOp::Eq, Operand::Value(value.into()))
    }

    pub fn is_equality_literal(&self) -> bool {
        self.op == CompareOp::Eq && matches!(self.operand, Operand::Value(_))
    }

    /// Resolve column names against `table` and cast literals to the column type.
    pub fn bind(&self, table: &Table) -> Result<BoundFilter> {
        let ordinal = table.ordinal(&self.column)?;
        let data_type = table.columns[ordinal].data_type;
        let operand = match &self.operand {
            Operand::Column(name) => BoundOperand::Column(table.ordinal(name)?),
            Operand::Value(v) => BoundOperand::Value(v.cast_to(data_type)?),
        };
        Ok(BoundFilter {
            ordinal,
            op: self.op,
            operand,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundOperand {
    Column(usize),
    Value(Scalar),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundFilter {
    pub ordinal: usize,
    pub op: CompareOp,
    pub operand: BoundOperand,
}

impl BoundFilter {
    /// Comparisons against `Null` are false, except for the null tests.
    pub fn matches(&self, row: &Row) -> Result<bool> {
        let left = row
            .get(self.ordinal)
            .ok_or_else(|| Error::Schema(format!("ordinal {} out of range", self.ordinal)))?;
        match self.op {
            CompareOp::IsNull => Ok(left.is_null()),
            CompareOp::IsNotNull => Ok(!left.is_null()),
            CompareOp::Eq => self.compare(left, row, Ordering::is_eq),
            CompareOp::NotEq => self.compare(left, row, Ordering::is_ne),
            CompareOp::Lt => self.compare(left, row, Ordering::is_lt),
            CompareOp::LtEq => self.compare(left, row, Ordering::is_le),
            CompareOp::Gt => self.compare(left, row, Ordering::is_gt),
            CompareOp::GtEq => self.compare(left, row, Ordering::is_ge),
        }
    }

    fn compare(&self, left: &Scalar, row: &Row, test: fn(Ordering) -> bool) -> Result<bool> {
        let right = match &self.operand {
            BoundOperand::Value(v) => v,
            BoundOperand::Column(i) => row
                .get(*i)
                .ok_or_else(|| Error::Schema(format!("ordinal {} out of range", i)))?,
        };
        if left.is_null() || right.is_null() {
            return Ok(false);
        }
        Ok(test(left.try_cmp(right)?))
    }
}

pub fn bind_filters(filters: &[Filter], table: &Table) -> Result<Vec<BoundFilter>> {
    filters.iter().map(|f| f.bind(table)).collect()
}

/// All bound filters hold for `row`.
pub fn matches_all(filters: &[BoundFilter], row: &Row) -> Result<bool> {
    for f in filters {
        if !f.matches(row)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A join condition: a primary column (or literal) equals a reference column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPair {
    pub primary: Operand,
    pub reference_column: String,
}

impl JoinPair {
    pub fn columns(primary: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            primary: Operand::Column(primary.into()),
            reference_column: reference.into(),
        }
    }

    pub fn literal(value: impl Into<Scalar>, reference: impl Into<String>) -> Self {
        Self {
            primary: Operand::Value(value.into()),
            reference_column: reference.into(),
        }
    }
}

/// Rule for lookups that match more than one reference row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DuplicateStrategy {
    /// Fail the pipeline.
    #[default]
    Abend,
    First,
    Last,
    /// Emit one output row per match.
    All,
}

/// Outcome of a row lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    NotFound,
    Found(Vec<Row>),
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Lookup::NotFound => Vec::new(),
            Lookup::Found(rows) => rows,
        }
    }
}

impl DuplicateStrategy {
    /// Reduce the matching rows according to this strategy.
    pub fn apply(self, mut rows: Vec<Row>) -> Result<Lookup> {
        if rows.is_empty() {
            return Ok(Lookup::NotFound);
        }
        match self {
            DuplicateStrategy::Abend if rows.len() > 1 => {
                Err(Error::DuplicateRows { count: rows.len() })
            }
            DuplicateStrategy::First => {
                rows.truncate(1);
                Ok(Lookup::Found(rows))
            }
            DuplicateStrategy::Last => {
                let last = rows.split_off(rows.len() - 1);
                Ok(Lookup::Found(last))
            }
            DuplicateStrategy::Abend | DuplicateStrategy::All => Ok(Lookup::Found(rows)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sorts: Vec<SortField>,
    /// Maximum rows to return; `None` is unlimited.
    pub rows: Option<usize>,
    pub joins: Vec<JoinPair>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_sort(mut self, field: SortField) -> Self {
        self.sorts.push(field);
        self
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_join(mut self, pair: JoinPair) -> Self {
        self.joins.push(pair);
        self
    }

    /// Same query with the sort replaced.
    pub fn sorted_by(&self, sorts: &[SortField]) -> Query {
        Query {
            sorts: sorts.to_vec(),
            ..self.clone()
        }
    }

    pub fn without_rows(&self) -> Query {
        Query {
            rows: None,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.sorts.is_empty() && self.rows.is_none() && self.joins.is_empty()
    }
}
