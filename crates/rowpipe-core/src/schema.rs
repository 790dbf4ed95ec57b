//! Logical schema types: `DataType`, `DeltaType`, `Column`, `Table`.
//!
//! A `Table` is built at pipeline-assembly time and is immutable afterwards,
//! apart from its row cache which transforms fill and clear while running.

use serde::{Deserialize, Serialize};

use crate::cache::RowCache;
use crate::error::{Error, Result};
use crate::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Decimal,
    Float32,
    Float64,
    Boolean,
    Date,
    Time,
    DateTime,
    Binary,
    Guid,
    /// Nested one-to-many row-set; see `Column::child_columns`.
    Node,
}

impl DataType {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer()
            || matches!(self, DataType::Decimal | DataType::Float32 | DataType::Float64)
    }
}

/// Role of a column in change tracking and auditing. Consumed by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeltaType {
    #[default]
    TrackingField,
    NonTrackingField,
    NaturalKey,
    SurrogateKey,
    SourceSurrogateKey,
    /// Assigned by the store on insert; never written by `Create`.
    AutoIncrement,
    ValidFromDate,
    ValidToDate,
    IsCurrentField,
    Version,
    CreateDate,
    UpdateDate,
    CreateAuditKey,
    UpdateAuditKey,
    /// Holds the operation code (`C`, `U`, `D`, `R`, `T`) for a row.
    DatabaseOperation,
    RejectedReason,
    IgnoreField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub logical_name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub delta_type: DeltaType,
    /// Source alias used to disambiguate same-named columns after a join.
    pub alias: Option<String>,
    /// Columns of the nested row-set when `data_type == Node`.
    pub child_columns: Vec<Column>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        Self {
            logical_name: name.clone(),
            name,
            data_type,
            nullable: true,
            delta_type: DeltaType::default(),
            alias: None,
            child_columns: Vec::new(),
        }
    }

    /// Build a node column holding a nested row-set with `children` columns.
    pub fn node(name: impl Into<String>, children: Vec<Column>) -> Self {
        Self {
            child_columns: children,
            ..Self::new(name, DataType::Node)
        }
    }

    pub fn with_delta_type(mut self, delta_type: DeltaType) -> Self {
        self.delta_type = delta_type;
        self
    }

    pub fn with_logical_name(mut self, logical_name: impl Into<String>) -> Self {
        self.logical_name = logical_name.into();
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// `alias.name` when aliased, otherwise the bare name.
    pub fn qualified_name(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{}.{}", alias, self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_node(&self) -> bool {
        self.data_type == DataType::Node
    }

    fn matches(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        match (&self.alias, name.split_once('.')) {
            (Some(alias), Some((prefix, rest))) => alias == prefix && self.name == rest,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub cache: RowCache,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            cache: RowCache::unbounded(),
        }
    }

    /// Build a table whose cache is pre-filled with `rows` (validated).
    pub fn with_rows(mut self, rows: impl IntoIterator<Item = Row>) -> Result<Self> {
        for row in rows {
            self.validate_row(&row)?;
            self.cache.push(row);
        }
        Ok(self)
    }

    /// Columns only, with an empty cache.
    pub fn schema(&self) -> Table {
        Table::new(self.name.clone(), self.columns.clone())
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, ordinal: usize) -> Option<&Column> {
        self.columns.get(ordinal)
    }

    /// Position of a column addressed either as `name` or `alias.name`.
    ///
    /// A qualified match wins over a bare-name match so that joined tables
    /// with duplicate names stay addressable.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        if name.contains('.') {
            if let Some(pos) = self
                .columns
                .iter()
                .position(|c| c.alias.is_some() && c.matches(name))
            {
                return Some(pos);
            }
        }
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn ordinal(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| Error::Schema(format!("column '{}' not found in table '{}'", name, self.name)))
    }

    pub fn ordinal_of_delta(&self, delta_type: DeltaType) -> Option<usize> {
        self.columns.iter().position(|c| c.delta_type == delta_type)
    }

    pub fn ordinals_of_delta(&self, delta_type: DeltaType) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.delta_type == delta_type)
            .map(|(i, _)| i)
            .collect()
    }

    /// Copy of this table with every column tagged by `alias`.
    pub fn aliased(&self, alias: &str) -> Table {
        Table {
            name: self.name.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| c.clone().with_alias(alias))
                .collect(),
            cache: RowCache::unbounded(),
        }
    }

    /// Schema of the nested row-set held by the node column at `ordinal`.
    pub fn child_table(&self, ordinal: usize) -> Result<Table> {
        let col = self.column(ordinal).ok_or_else(|| {
            Error::Schema(format!("ordinal {} out of range for '{}'", ordinal, self.name))
        })?;
        if !col.is_node() {
            return Err(Error::Schema(format!(
                "column '{}' in '{}' is not a node column",
                col.name, self.name
            )));
        }
        Ok(Table::new(col.name.clone(), col.child_columns.clone()))
    }

    /// Same columns (names and types) in the same order, ignoring the cache.
    pub fn same_shape(&self, other: &Table) -> bool {
        self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(other.columns.iter())
                .all(|(a, b)| a.name == b.name && a.data_type == b.data_type)
    }

    /// Check row length and positional types against this table.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Schema(format!(
                "row has {} values but table '{}' has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )));
        }
        for (col, value) in self.columns.iter().zip(row.values()) {
            if value.is_null() {
                if !col.nullable {
                    return Err(Error::Schema(format!(
                        "null in non-nullable column '{}' of '{}'",
                        col.name, self.name
                    )));
                }
                continue;
            }
            if !value.conforms_to(col.data_type) {
                return Err(Error::Schema(format!(
                    "column '{}' of '{}' expects {:?}, got {:?}",
                    col.name,
                    self.name,
                    col.data_type,
                    value.data_type()
                )));
            }
        }
        Ok(())
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;

    fn people() -> Table {
        Table::new(
            "people",
            vec![
                Column::new("id", DataType::Int64).not_null(),
                Column::new("name", DataType::String),
            ],
        )
    }

    #[test]
    fn qualified_lookup_prefers_alias() {
        let left = people();
        let right = people().aliased("ref");
        let mut columns = left.columns.clone();
        columns.extend(right.columns.clone());
        let joined = Table::new("joined", columns);

        assert_eq!(joined.index_of("id"), Some(0));
        assert_eq!(joined.index_of("ref.id"), Some(2));
        assert_eq!(joined.index_of("ref.name"), Some(3));
        assert!(joined.index_of("other.id").is_none());
    }

    #[test]
    fn validate_row_checks_width_and_types() {
        let table = people();
        assert!(table
            .validate_row(&Row::new(vec![Scalar::I64(1), Scalar::Str("a".into())]))
            .is_ok());
        assert!(table.validate_row(&Row::new(vec![Scalar::I64(1)])).is_err());
        assert!(table
            .validate_row(&Row::new(vec![Scalar::Str("x".into()), Scalar::Null]))
            .is_err());
        assert!(table
            .validate_row(&Row::new(vec![Scalar::Null, Scalar::Null]))
            .is_err());
    }

    #[test]
    fn child_table_requires_node_column() {
        let table = Table::new(
            "orders",
            vec![
                Column::new("id", DataType::Int32),
                Column::node("lines", vec![Column::new("sku", DataType::String)]),
            ],
        );
        assert_eq!(table.child_table(1).unwrap().columns[0].name, "sku");
        assert!(table.child_table(0).is_err());
    }
}
