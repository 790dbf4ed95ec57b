//! In-memory sort index built by draining an upstream.

use std::cmp::Ordering;
use std::collections::VecDeque;

use rowpipe_core::cancel::CancelToken;
use rowpipe_core::query::{compare_rows, BoundSort};
use rowpipe_core::row::Row;
use rowpipe_mem::{BudgetGuardImpl, MemoryBudgetImpl};

use crate::traits::{OpError, Transform};

/// Fully sorted rows waiting to be served, plus the memory they hold.
pub struct SortIndex {
    rows: VecDeque<Row>,
    _guard: Option<BudgetGuardImpl>,
}

impl SortIndex {
    /// Drain `upstream` and sort on `keys`. Ties keep arrival order.
    pub fn build(
        name: &str,
        upstream: &mut dyn Transform,
        keys: &BoundSort,
        budget: Option<&MemoryBudgetImpl>,
        cancel: &CancelToken,
    ) -> Result<Self, OpError> {
        let mut guard = match budget {
            Some(b) => Some(b.acquire(0, "sort_index").map_err(|e| OpError::memory(name, e))?),
            None => None,
        };

        let mut entries: Vec<(usize, Row)> = Vec::new();
        while let Some(row) = upstream.read_next(cancel)? {
            cancel.check()?;
            if let Some(g) = guard.as_mut() {
                g.grow(row.estimated_bytes())
                    .map_err(|e| OpError::memory(name, e))?;
            }
            entries.push((entries.len(), row));
        }

        let mut failure = None;
        entries.sort_by(|(ia, a), (ib, b)| match compare_rows(a, b, keys) {
            Ok(Ordering::Equal) => ia.cmp(ib),
            Ok(ord) => ord,
            Err(e) => {
                failure.get_or_insert(e);
                Ordering::Equal
            }
        });
        if let Some(err) = failure {
            return Err(OpError::Pipeline {
                transform: name.to_string(),
                message: format!("cannot compare sort keys: {}", err),
            });
        }

        tracing::debug!(transform = name, rows = entries.len(), "sort index built");
        Ok(Self {
            rows: entries.into_iter().map(|(_, row)| row).collect(),
            _guard: guard,
        })
    }

    pub fn pop(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
