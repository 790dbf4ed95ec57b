#![forbid(unsafe_code)]
//! rowpipe-mem: hard memory budgeting for buffering transforms.
//!
//! Concrete implementation of the interfaces in `rowpipe-core::budget`. Any
//! transform that holds a whole input (sort index, materialized cache)
//! accounts for it here with an RAII guard.

pub mod error;
pub mod guard;
pub mod tracking;

pub use error::{Error, Result};
pub use guard::{BudgetGuardImpl, MemoryBudgetImpl};
pub use tracking::PeakTracker;
