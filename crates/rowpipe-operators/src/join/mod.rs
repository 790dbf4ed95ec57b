//! Joins against a reference transform.

mod lookup;

pub use lookup::LookupTransform;
