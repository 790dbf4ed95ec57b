//! Abstract memory budget interfaces.
//!
//! The concrete implementation lives in `rowpipe-mem`. Only the traits are
//! kept here so transforms can depend on the API without the accounting code.

/// A guard returned by a memory budget when bytes are acquired.
///
/// Must release its bytes on Drop.
pub trait BudgetGuard: Send {
    /// Number of bytes currently accounted for by this guard.
    fn bytes(&self) -> usize;
    /// Debug tag naming the buffer being accounted (e.g. `"sort_index"`).
    fn tag(&self) -> &'static str {
        "guard"
    }
}

/// A handle representing a memory-cap enforcer.
///
/// Transforms that buffer rows (sort index, materialized cache) call
/// `try_acquire` before growing. `None` means the cap would be exceeded and
/// the transform must fail.
pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    /// Attempt to acquire `bytes` from the live budget. Returns a guard on success.
    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard>;

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> usize;

    /// Approximate currently used bytes (advisory; not a correctness API).
    fn used_bytes(&self) -> usize;
}
