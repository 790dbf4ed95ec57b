//! Forward-only byte stream over an opened transform.
//!
//! `RowStream` pulls rows lazily as the caller reads, encoding one row at a
//! time into a small pending buffer. A caller buffer smaller than a record is
//! filled across several `read` calls.

mod encode;

pub use encode::{json_object, scalar_to_json};

use std::io::{self, Read};

use rowpipe_core::cancel::CancelToken;
use rowpipe_operators::BoxedTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Header line then one record per row, split by the given byte.
    Delimited(u8),
    /// `[` then comma-separated JSON objects keyed by column name, then `]`.
    JsonArray,
    /// Tagged binary records, no header.
    Binary,
}

impl Framing {
    pub fn csv() -> Self {
        Framing::Delimited(b',')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prologue,
    Rows,
    Done,
}

pub struct RowStream {
    transform: BoxedTransform,
    framing: Framing,
    cancel: CancelToken,
    max_rows: Option<usize>,
    rows: usize,
    phase: Phase,
    pending: Vec<u8>,
    offset: usize,
}

impl RowStream {
    /// `transform` must already be open.
    pub fn new(transform: BoxedTransform, framing: Framing, cancel: CancelToken) -> Self {
        Self {
            transform,
            framing,
            cancel,
            max_rows: None,
            rows: 0,
            phase: Phase::Prologue,
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// Stop after `rows` rows; the framing is still closed properly.
    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = Some(rows);
        self
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Close the underlying transform and hand it back.
    pub fn into_inner(mut self) -> BoxedTransform {
        self.transform.close();
        self.transform
    }

    fn fail(err: crate::error::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }

    /// Encode the next chunk into `pending`. `false` once everything is out.
    fn fill(&mut self) -> io::Result<bool> {
        match self.phase {
            Phase::Prologue => {
                self.phase = Phase::Rows;
                match self.framing {
                    Framing::Delimited(d) => {
                        self.pending = encode::csv_header(self.transform.table(), d)
                            .map_err(Self::fail)?;
                    }
                    Framing::JsonArray => self.pending.push(b'['),
                    Framing::Binary => {}
                }
                Ok(true)
            }
            Phase::Rows => {
                let capped = self.max_rows.is_some_and(|cap| self.rows >= cap);
                let next = if capped {
                    None
                } else {
                    self.transform
                        .read_next(&self.cancel)
                        .map_err(|e| Self::fail(e.into()))?
                };
                let Some(row) = next else {
                    self.phase = Phase::Done;
                    if self.framing == Framing::JsonArray {
                        self.pending.push(b']');
                    }
                    tracing::debug!(rows = self.rows, "row stream finished");
                    return Ok(true);
                };
                match self.framing {
                    Framing::Delimited(d) => {
                        self.pending = encode::csv_record(&row, d).map_err(Self::fail)?;
                    }
                    Framing::JsonArray => {
                        self.pending =
                            encode::json_element(self.transform.table(), &row, self.rows == 0)
                                .map_err(Self::fail)?;
                    }
                    Framing::Binary => {
                        if let Err(e) = encode::binary_record(&row, &mut self.pending) {
                            self.pending.clear();
                            return Err(Self::fail(e));
                        }
                    }
                }
                self.rows += 1;
                Ok(true)
            }
            Phase::Done => Ok(false),
        }
    }
}

impl Read for RowStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.offset < self.pending.len() {
                let n = (self.pending.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }
            self.pending.clear();
            self.offset = 0;
            if !self.fill()? {
                return Ok(0);
            }
        }
    }
}
