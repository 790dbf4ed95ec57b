#![forbid(unsafe_code)]
//! rowpipe-io: the edges of a pipeline.
//!
//! - `Connection`: target stores with explicit transactions.
//! - `WriterTask`: applies create/update/delete/reject/truncate to a store.
//! - `RowStream`: serializes a transform's rows as csv, a JSON array or
//!   binary records through `std::io::Read`.

pub mod connection;
pub mod error;
pub mod memory_connection;
pub mod stream;
pub mod writer;

pub use connection::Connection;
pub use error::{ConnectionError, Error, Result};
pub use memory_connection::MemoryConnection;
pub use stream::{Framing, RowStream};
pub use writer::{WriteCounts, WriteOperation, WriterTask};
