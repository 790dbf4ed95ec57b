use rowpipe_core::id::TransactionId;
use rowpipe_operators::OpError;
use thiserror::Error;

/// Result type local to rowpipe-io.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a `Connection` implementation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("{0} is not the active transaction")]
    UnknownTransaction(TransactionId),

    #[error("a transaction is already active")]
    TransactionActive,

    #[error("{operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },

    #[error(transparent)]
    Value(#[from] rowpipe_core::error::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    /// A write against the target or reject store failed. The transaction
    /// is left open for the caller to roll back.
    #[error("write failed on '{table}' during {operation}: {source}")]
    Write {
        table: String,
        operation: &'static str,
        #[source]
        source: ConnectionError,
    },

    #[error("transaction error on '{connection}': {message}")]
    Transaction { connection: String, message: String },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Operator(#[from] OpError),
}
