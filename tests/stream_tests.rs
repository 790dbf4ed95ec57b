//! Row stream serialization tests.


use std::io::Read;

use rowpipe_core::prelude::*;
use rowpipe_io::{Framing, RowStream};
use rowpipe_operators::{BoxedTransform, MemorySource, Transform};
use test_data_gen::{pair_rows, pairs_table, source};

fn opened(mut t: BoxedTransform) -> BoxedTransform {
    t.open(AuditKey::new(1), &Query::new(), &CancelToken::new())
        .unwrap();
    t
}

fn pairs() -> BoxedTransform {
    opened(source(
        pairs_table(),
        pair_rows(&[(1, "a"), (2, "b,c"), (3, "d\"e")]),
    ))
}

fn read_in_chunks(stream: &mut RowStream, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert!(n <= chunk);
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn test_csv_framing() {
    let mut stream = RowStream::new(pairs(), Framing::csv(), CancelToken::new());
    let mut text = String::new();
    stream.read_to_string(&mut text).unwrap();
    assert_eq!(text, "k,v\n1,a\n2,\"b,c\"\n3,\"d\"\"e\"\n");
    assert_eq!(stream.rows_written(), 3);
}

#[test]
fn test_tiny_buffers_reassemble_the_same_bytes() {
    let mut whole = Vec::new();
    RowStream::new(pairs(), Framing::JsonArray, CancelToken::new())
        .read_to_end(&mut whole)
        .unwrap();

    for chunk in [1, 3, 7] {
        let mut stream = RowStream::new(pairs(), Framing::JsonArray, CancelToken::new());
        assert_eq!(read_in_chunks(&mut stream, chunk), whole);
    }
}

#[test]
fn test_json_array_framing() {
    let mut stream = RowStream::new(pairs(), Framing::JsonArray, CancelToken::new());
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        value,
        serde_json::json!([
            { "k": 1, "v": "a" },
            { "k": 2, "v": "b,c" },
            { "k": 3, "v": "d\"e" }
        ])
    );
}

#[test]
fn test_max_rows_still_closes_the_framing() {
    let mut stream =
        RowStream::new(pairs(), Framing::JsonArray, CancelToken::new()).with_max_rows(1);
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value, serde_json::json!([{ "k": 1, "v": "a" }]));

    let mut empty = RowStream::new(pairs(), Framing::JsonArray, CancelToken::new()).with_max_rows(0);
    let mut text = String::new();
    empty.read_to_string(&mut text).unwrap();
    assert_eq!(text, "[]");
}

#[test]
fn test_binary_framing() {
    let table = Table::new("one", vec![Column::new("n", DataType::Int32)]);
    let rows = vec![Row::new(vec![Scalar::I32(7)]), Row::new(vec![Scalar::Null])];
    let mut stream = RowStream::new(opened(source(table, rows)), Framing::Binary, CancelToken::new());
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    assert_eq!(
        bytes,
        vec![
            1, 0, 0, 0, 4, 7, 0, 0, 0, // [I32(7)]
            1, 0, 0, 0, 0, // [Null]
        ]
    );
}

#[test]
fn test_source_failure_surfaces_as_io_error() {
    let src = MemorySource::from_rows(pairs_table(), pair_rows(&[(1, "a"), (2, "b")]))
        .unwrap()
        .fail_after(1);
    let mut stream = RowStream::new(
        opened(Box::new(src.into_transform())),
        Framing::csv(),
        CancelToken::new(),
    );
    let mut text = String::new();
    let err = stream.read_to_string(&mut text).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);
}

#[test]
fn test_cancelled_stream_fails() {
    let cancel = CancelToken::new();
    let mut stream = RowStream::new(pairs(), Framing::csv(), cancel.clone());
    let mut buf = [0u8; 64];
    // Header only.
    assert!(stream.read(&mut buf).unwrap() > 0);
    cancel.cancel();
    assert!(stream.read(&mut buf).is_err());
}
