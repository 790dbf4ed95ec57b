//! Ordered row store with optional fixed capacity.
//!
//! Unbounded caches are append-only. Bounded caches are a fixed-size arena:
//! once full, each push overwrites the oldest slot and advances `start`, so
//! the cache always holds the most recent `capacity` rows. Logical index 0 is
//! always the oldest retained row: `phys(i) = (i + start) % capacity`.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::row::Row;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "RawRowCache")]
pub struct RowCache {
    slots: Vec<Row>,
    /// 0 means unbounded.
    capacity: usize,
    start: usize,
}

impl RowCache {
    /// `capacity == 0` builds an unbounded cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            start: 0,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn phys(&self, index: usize) -> usize {
        if self.is_bounded() {
            (index + self.start) % self.capacity
        } else {
            index
        }
    }

    /// Append a row, evicting the oldest one when a bounded cache is full.
    /// Returns the evicted row, if any.
    pub fn push(&mut self, row: Row) -> Option<Row> {
        if !self.is_bounded() || self.slots.len() < self.capacity {
            self.slots.push(row);
            return None;
        }
        let slot = self.start;
        self.start = (self.start + 1) % self.capacity;
        Some(std::mem::replace(&mut self.slots[slot], row))
    }

    /// Row at logical `index` (0 = oldest retained).
    pub fn get(&self, index: usize) -> Option<&Row> {
        if index >= self.slots.len() {
            return None;
        }
        self.slots.get(self.phys(index))
    }

    /// Most recently pushed row.
    pub fn last(&self) -> Option<&Row> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> + '_ {
        (0..self.slots.len()).map(move |i| &self.slots[self.phys(i)])
    }

    /// Rows in logical order.
    pub fn to_vec(&self) -> Vec<Row> {
        self.iter().cloned().collect()
    }

    /// Drop all rows; capacity is kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.start = 0;
    }
}

/// Wire shape of a cache; checked before it becomes a `RowCache`.
#[derive(Deserialize)]
struct RawRowCache {
    slots: Vec<Row>,
    capacity: usize,
    start: usize,
}

impl TryFrom<RawRowCache> for RowCache {
    type Error = Error;

    fn try_from(raw: RawRowCache) -> Result<Self, Error> {
        let RawRowCache {
            slots,
            capacity,
            start,
        } = raw;
        if capacity == 0 {
            if start != 0 {
                return Err(Error::Invariant(format!(
                    "unbounded cache has start {start}"
                )));
            }
        } else {
            if slots.len() > capacity {
                return Err(Error::Invariant(format!(
                    "{} rows exceed capacity {capacity}",
                    slots.len()
                )));
            }
            // Wrapping only begins once every slot is filled.
            if start >= capacity || (start != 0 && slots.len() < capacity) {
                return Err(Error::Invariant(format!(
                    "start {start} is invalid for {} of {capacity} rows",
                    slots.len()
                )));
            }
        }
        Ok(Self {
            slots,
            capacity,
            start,
        })
    }
}

impl PartialEq for RowCache {
    fn eq(&self, other: &Self) -> bool {
        self.capacity == other.capacity && self.iter().eq(other.iter())
    }
}

impl Extend<Row> for RowCache {
    fn extend<I: IntoIterator<Item = Row>>(&mut self, iter: I) {
        for row in iter {
            self.push(row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;

    fn r(tag: &str) -> Row {
        Row::new(vec![Scalar::Str(tag.into())])
    }

    #[test]
    fn bounded_cache_keeps_most_recent() {
        let mut cache = RowCache::new(2);
        for tag in ["A", "B", "C", "D"] {
            cache.push(r(tag));
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.to_vec(), vec![r("C"), r("D")]);
        assert_eq!(cache.get(0), Some(&r("C")));
        assert_eq!(cache.last(), Some(&r("D")));
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn eviction_returns_oldest() {
        let mut cache = RowCache::new(3);
        assert!(cache.push(r("A")).is_none());
        cache.push(r("B"));
        cache.push(r("C"));
        assert_eq!(cache.push(r("D")), Some(r("A")));
        assert_eq!(cache.push(r("E")), Some(r("B")));
        assert_eq!(cache.to_vec(), vec![r("C"), r("D"), r("E")]);
    }

    #[test]
    fn unbounded_cache_retains_everything() {
        let mut cache = RowCache::unbounded();
        for i in 0..100 {
            cache.push(Row::new(vec![Scalar::I32(i)]));
        }
        assert_eq!(cache.len(), 100);
        assert_eq!(cache.get(0), Some(&Row::new(vec![Scalar::I32(0)])));
        assert_eq!(cache.get(99), Some(&Row::new(vec![Scalar::I32(99)])));
    }

    #[test]
    fn retains_last_c_for_many_lengths() {
        for capacity in 1..6usize {
            for appended in 0..20usize {
                let mut cache = RowCache::new(capacity);
                for i in 0..appended {
                    cache.push(Row::new(vec![Scalar::I64(i as i64)]));
                }
                let expected: Vec<Row> = (appended.saturating_sub(capacity)..appended)
                    .map(|i| Row::new(vec![Scalar::I64(i as i64)]))
                    .collect();
                assert_eq!(cache.to_vec(), expected, "capacity {capacity}, appended {appended}");
            }
        }
    }

    #[test]
    fn deserialized_cache_keeps_its_order() {
        let mut cache = RowCache::new(2);
        cache.extend([r("A"), r("B"), r("C")]);
        let json = serde_json::to_string(&cache).unwrap();
        let back: RowCache = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_vec(), vec![r("B"), r("C")]);
        assert_eq!(back.last(), Some(&r("C")));
    }

    #[test]
    fn inconsistent_cache_is_rejected() {
        let row = serde_json::to_value(r("A")).unwrap();
        for (capacity, start, rows) in [(0, 1, 1), (1, 0, 2), (2, 2, 2), (3, 1, 2)] {
            let json = serde_json::json!({
                "slots": vec![row.clone(); rows],
                "capacity": capacity,
                "start": start,
            });
            let result = serde_json::from_value::<RowCache>(json);
            assert!(result.is_err(), "capacity {capacity}, start {start}, rows {rows}");
        }
    }

    #[test]
    fn clear_resets_wrap_position() {
        let mut cache = RowCache::new(2);
        cache.extend([r("A"), r("B"), r("C")]);
        cache.clear();
        assert!(cache.is_empty());
        cache.push(r("X"));
        assert_eq!(cache.get(0), Some(&r("X")));
        assert_eq!(cache.capacity(), 2);
    }
}
