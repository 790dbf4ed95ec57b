use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    /// Two values of different semantic types were compared, or a value could
    /// not be converted to the requested type.
    #[error("Type error: {0}")]
    Type(String),

    #[error("Lookup matched {count} rows where at most one was allowed")]
    DuplicateRows { count: usize },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
