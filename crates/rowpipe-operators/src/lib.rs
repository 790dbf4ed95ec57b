#![forbid(unsafe_code)]
//! rowpipe-operators: pull-based transforms (source/sort/lookup/materialize/flatten).
//!
//! Design intent:
//! - Pure and synchronous; every transform pulls from its upstreams on demand.
//! - Buffers that grow with input (sort index, materialized cache) account
//!   their bytes through `rowpipe-mem` guards when a budget is attached.
//! - Sort order is negotiated through `open`'s return value so redundant
//!   sorts collapse into pass-through.

pub mod filter;
pub mod flatten;
pub mod join;
pub mod materialize;
pub mod shared;
pub mod sort;
pub mod source;
pub mod traits;

pub use filter::QueryTransform;
pub use flatten::{FlattenTransform, NodeTransform};
pub use join::LookupTransform;
pub use materialize::MaterializeTransform;
pub use shared::{SharedMaterialized, SharedReader};
pub use sort::SortTransform;
pub use source::{MemorySource, RowSource, SourceError, SourceStats, SourceTransform};
pub use traits::{
    read_all, BoxedTransform, Lifecycle, OpError, ResidualQuery, Transform, TransformState,
};
