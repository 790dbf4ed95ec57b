#![forbid(unsafe_code)]
//! rowpipe-exec: runs a transform tree into a transactional writer.
//!
//! The `Engine` owns the memory budget and configuration shared by the
//! buffering transforms it builds; a `Pipeline` drives one top transform
//! into one `WriterTask` and decides commit or rollback.

pub mod metrics;
pub mod runtime;

pub use runtime::{Engine, ExecError, OperationSelector, Pipeline, RunSummary};
