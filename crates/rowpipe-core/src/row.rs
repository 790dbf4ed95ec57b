//! Positional rows.
//!
//! A row is produced by exactly one transform per pull and is owned by the
//! caller once returned. Consumers that need to keep a row while also handing
//! it downstream clone it.

use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::types::Scalar;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: Vec<Scalar>,
}

impl Row {
    pub fn new(values: Vec<Scalar>) -> Self {
        Self { values }
    }

    /// A row of `width` nulls.
    pub fn nulls(width: usize) -> Self {
        Self {
            values: vec![Scalar::Null; width],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Option<&Scalar> {
        self.values.get(ordinal)
    }

    pub fn set(&mut self, ordinal: usize, value: Scalar) -> Option<Scalar> {
        self.values
            .get_mut(ordinal)
            .map(|slot| std::mem::replace(slot, value))
    }

    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Scalar> {
        self.values
    }

    /// Reuse this row's storage and append `extra` values after it.
    pub fn append(mut self, extra: impl IntoIterator<Item = Scalar>) -> Row {
        self.values.extend(extra);
        self
    }

    /// Values at `ordinals`, in that order.
    pub fn project(&self, ordinals: &[usize]) -> Vec<Scalar> {
        ordinals
            .iter()
            .map(|&i| self.values.get(i).cloned().unwrap_or(Scalar::Null))
            .collect()
    }

    pub fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Row>() + self.values.iter().map(Scalar::estimated_bytes).sum::<usize>()
    }
}

impl Index<usize> for Row {
    type Output = Scalar;

    fn index(&self, ordinal: usize) -> &Scalar {
        &self.values[ordinal]
    }
}

impl From<Vec<Scalar>> for Row {
    fn from(values: Vec<Scalar>) -> Self {
        Self::new(values)
    }
}

impl FromIterator<Scalar> for Row {
    fn from_iter<I: IntoIterator<Item = Scalar>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
