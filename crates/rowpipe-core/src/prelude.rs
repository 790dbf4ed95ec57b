//! Convenient re-exports for downstream crates.

pub use crate::cache::RowCache;
pub use crate::cancel::{CancelToken, Cancelled};
pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{AuditKey, TransactionId};
pub use crate::query::{
    CompareOp, DuplicateStrategy, Filter, JoinPair, Lookup, Operand, Query, SortDirection,
    SortField,
};
pub use crate::row::Row;
pub use crate::schema::{Column, DataType, DeltaType, Table};
pub use crate::types::{Decimal, RowSet, Scalar};
