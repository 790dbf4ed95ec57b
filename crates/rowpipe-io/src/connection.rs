//! Target store abstraction used by writers.
//!
//! A connection executes inserts, keyed updates and deletes, and truncates
//! against named tables, optionally inside one active transaction. Calls
//! made with `tx = None` bypass the transaction.

use rowpipe_core::id::TransactionId;
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;

use crate::error::ConnectionError;

pub trait Connection: Send {
    fn name(&self) -> &str;

    /// True for stores that create their tables per load; such tables are
    /// never truncated.
    fn dynamic_tables(&self) -> bool {
        false
    }

    fn create_table(&mut self, table: &Table) -> Result<(), ConnectionError>;

    fn start_transaction(&mut self) -> Result<TransactionId, ConnectionError>;

    fn commit_transaction(&mut self, tx: TransactionId) -> Result<(), ConnectionError>;

    fn rollback_transaction(&mut self, tx: TransactionId) -> Result<(), ConnectionError>;

    /// Insert `rows` (shaped like `table`), writing only the `columns`
    /// ordinals. Returns the store-assigned id of each row when the table
    /// has an auto-increment column, otherwise an empty list.
    fn execute_insert(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        columns: &[usize],
        rows: &[Row],
    ) -> Result<Vec<i64>, ConnectionError>;

    /// Set `columns` from `row` on every stored row whose `keys` equal the
    /// row's key values. Returns the number of rows changed.
    fn execute_update(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        columns: &[usize],
        keys: &[usize],
        row: &Row,
    ) -> Result<u64, ConnectionError>;

    fn execute_delete(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
        keys: &[usize],
        row: &Row,
    ) -> Result<u64, ConnectionError>;

    fn truncate_table(
        &mut self,
        tx: Option<TransactionId>,
        table: &Table,
    ) -> Result<(), ConnectionError>;
}
