//! Transform trait + common interfaces.
//!
//! A pipeline is a tree of transforms. The consumer at the root calls
//! `open` once with a `Query`, then pulls rows with `read_next` until it
//! returns `None`. Each transform pulls from its own upstreams on demand, so
//! at most one row per stage is in flight unless the transform must buffer
//! (sort, materialize, flatten expansion, lookup `All` matches).

use rowpipe_core::cancel::{CancelToken, Cancelled};
use rowpipe_core::error::Error as CoreError;
use rowpipe_core::id::AuditKey;
use rowpipe_core::query::{
    bind_filters, matches_all, BoundFilter, DuplicateStrategy, Filter, Lookup, Query, SortField,
};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpError {
    /// A source or sink failed; `operation` names what was being attempted.
    #[error("connection error in '{source_name}' during {operation}: {message}")]
    Connection {
        source_name: String,
        operation: &'static str,
        message: String,
    },

    #[error("pipeline error in '{transform}': {message}")]
    Pipeline { transform: String, message: String },

    #[error("'{transform}' matched {count} reference rows for [{key}] with duplicate strategy Abend")]
    DuplicateRows {
        transform: String,
        key: String,
        count: usize,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("'{transform}' cannot {operation} while {state:?}")]
    State {
        transform: String,
        state: TransformState,
        operation: &'static str,
    },

    #[error("memory budget exceeded in '{transform}': {message}")]
    Memory { transform: String, message: String },

    #[error("'{transform}' does not support {operation}")]
    Unsupported {
        transform: String,
        operation: &'static str,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl OpError {
    /// Attach the failing transform's name to a core error.
    pub fn in_transform(transform: &str, err: CoreError) -> Self {
        match err {
            CoreError::Schema(msg) => OpError::Schema(format!("{}: {}", transform, msg)),
            CoreError::DuplicateRows { count } => OpError::DuplicateRows {
                transform: transform.to_string(),
                key: String::new(),
                count,
            },
            other => OpError::Pipeline {
                transform: transform.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn memory(transform: &str, err: rowpipe_mem::Error) -> Self {
        OpError::Memory {
            transform: transform.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpError::Cancelled)
    }
}

impl From<Cancelled> for OpError {
    fn from(_: Cancelled) -> Self {
        OpError::Cancelled
    }
}

/// Lifecycle of a transform. `RowReady` means the last read produced a row
/// and another read may be issued; `Finished` means the stream is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransformState {
    Unopened,
    Open,
    Reading,
    RowReady,
    Finished,
    Failed,
    Closed,
}

/// Shared state machine for transform implementations.
///
/// Rejects re-entrant `open`, reads on an unopened transform, and reads after
/// a failure until the transform is reset.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: String,
    state: TransformState,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TransformState::Unopened,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, TransformState::Unopened | TransformState::Closed)
    }

    fn reject(&self, operation: &'static str) -> OpError {
        OpError::State {
            transform: self.name.clone(),
            state: self.state,
            operation,
        }
    }

    pub fn begin_open(&mut self) -> Result<(), OpError> {
        match self.state {
            TransformState::Unopened | TransformState::Closed => Ok(()),
            _ => Err(self.reject("open")),
        }
    }

    /// Record the outcome of `open`. A failed open leaves the transform
    /// unopened so the caller can close it or try again.
    pub fn finish_open<T>(&mut self, result: Result<T, OpError>) -> Result<T, OpError> {
        self.state = match &result {
            Ok(_) => TransformState::Open,
            Err(_) => TransformState::Unopened,
        };
        result
    }

    /// `Ok(false)` when the stream is already exhausted.
    pub fn begin_read(&mut self) -> Result<bool, OpError> {
        match self.state {
            TransformState::Open | TransformState::RowReady => {
                self.state = TransformState::Reading;
                Ok(true)
            }
            TransformState::Finished => Ok(false),
            _ => Err(self.reject("read")),
        }
    }

    pub fn finish_read(&mut self, result: Result<Option<Row>, OpError>) -> Result<Option<Row>, OpError> {
        self.state = match &result {
            Ok(Some(_)) => TransformState::RowReady,
            Ok(None) => TransformState::Finished,
            Err(_) => TransformState::Failed,
        };
        result
    }

    pub fn begin_reset(&mut self) -> Result<(), OpError> {
        match self.state {
            TransformState::Unopened | TransformState::Closed | TransformState::Reading => {
                Err(self.reject("reset"))
            }
            _ => Ok(()),
        }
    }

    /// Record the outcome of `reset`: a rewound transform is open again,
    /// otherwise its state is unchanged.
    pub fn finish_reset(&mut self, result: Result<bool, OpError>) -> Result<bool, OpError> {
        match &result {
            Ok(true) => self.state = TransformState::Open,
            Ok(false) => {}
            Err(_) => self.state = TransformState::Failed,
        }
        result
    }

    /// Lookups are served between reads once the transform is open.
    pub fn check_lookup(&self) -> Result<(), OpError> {
        match self.state {
            TransformState::Open | TransformState::RowReady | TransformState::Finished => Ok(()),
            _ => Err(self.reject("lookup")),
        }
    }

    pub fn close(&mut self) {
        self.state = TransformState::Closed;
    }
}

/// A pull-based row transform.
///
/// Invariants:
/// - Every row returned by `read_next` matches `table()` in length and
///   positional types.
/// - `open` returns `true` when the output order already satisfies the
///   query's sort, so callers may skip their own sort.
/// - `reset` returns `false` when the transform cannot rewind; its state is
///   then unchanged.
/// - `close` is idempotent and releases buffered rows and upstreams.
pub trait Transform: Send {
    /// Human-readable transform name used in errors and traces.
    fn name(&self) -> &str;

    /// Output schema, fixed at assembly time.
    fn table(&self) -> &Table;

    fn state(&self) -> TransformState;

    fn open(&mut self, audit_key: AuditKey, query: &Query, cancel: &CancelToken)
        -> Result<bool, OpError>;

    fn read_next(&mut self, cancel: &CancelToken) -> Result<Option<Row>, OpError>;

    fn reset(&mut self) -> Result<bool, OpError>;

    fn close(&mut self);

    /// Order this transform needs from its upstream.
    fn required_sort(&self) -> &[SortField] {
        &[]
    }

    /// Order of the rows this transform emits, if any is guaranteed.
    fn produced_sort(&self) -> Option<&[SortField]> {
        None
    }

    /// True when output rows carry upstream columns unchanged at the same
    /// positions (possibly with extra columns appended).
    fn pass_through_columns(&self) -> bool {
        false
    }

    /// Find rows matching all `filters`, reduced by `strategy`.
    fn lookup(
        &mut self,
        _filters: &[Filter],
        _strategy: DuplicateStrategy,
        _cancel: &CancelToken,
    ) -> Result<Lookup, OpError> {
        Err(OpError::Unsupported {
            transform: self.name().to_string(),
            operation: "lookup",
        })
    }
}

pub type BoxedTransform = Box<dyn Transform>;

/// Pull every remaining row from `transform`.
pub fn read_all(transform: &mut dyn Transform, cancel: &CancelToken) -> Result<Vec<Row>, OpError> {
    let mut rows = Vec::new();
    while let Some(row) = transform.read_next(cancel)? {
        rows.push(row);
    }
    Ok(rows)
}

/// Split the filters of `query` into those that resolve against `table`,
/// which can be handed to an upstream with that schema, and the rest.
pub fn split_filters(query: &Query, table: &Table) -> (Vec<Filter>, Vec<Filter>) {
    query.filters.iter().cloned().partition(|f| f.bind(table).is_ok())
}

/// Filters and a row cap enforced on a transform's own output rows.
///
/// Whatever part of the caller's query a transform could not hand to its
/// upstream ends up here, so the consumer only sees rows satisfying it.
#[derive(Debug, Clone, Default)]
pub struct ResidualQuery {
    filters: Vec<BoundFilter>,
    rows: Option<usize>,
    emitted: usize,
}

impl ResidualQuery {
    pub fn bind(filters: &[Filter], rows: Option<usize>, table: &Table) -> Result<Self, CoreError> {
        Ok(Self {
            filters: bind_filters(filters, table)?,
            rows,
            emitted: 0,
        })
    }

    /// A row cap with no filters.
    pub fn row_cap(rows: Option<usize>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// The row cap has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.rows.is_some_and(|cap| self.emitted >= cap)
    }

    /// True when `row` passes the filters; admitted rows count toward the cap.
    pub fn admit(&mut self, row: &Row) -> Result<bool, CoreError> {
        let keep = matches_all(&self.filters, row)?;
        if keep {
            self.emitted += 1;
        }
        Ok(keep)
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn rewind(&mut self) {
        self.emitted = 0;
    }
}

/// Render filters as `col=value, ...` for error messages.
pub fn describe_filters(filters: &[Filter]) -> String {
    filters
        .iter()
        .map(|f| match &f.operand {
            rowpipe_core::query::Operand::Value(v) => format!("{}={}", f.column, v),
            rowpipe_core::query::Operand::Column(c) => format!("{}={}", f.column, c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
