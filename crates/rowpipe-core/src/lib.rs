#![forbid(unsafe_code)]
//! rowpipe-core: values, schemas, rows, row caches, and query descriptors.
//!
//! Pure data and small algorithms only; no IO and no transform logic. Every
//! other crate in the workspace builds on these types.

pub mod budget;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod query;
pub mod row;
pub mod schema;
pub mod types;
