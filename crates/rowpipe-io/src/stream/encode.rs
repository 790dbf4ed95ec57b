//! Per-row encoders for each stream framing.

use std::io;

use chrono::{Datelike, Timelike};
use rowpipe_core::row::Row;
use rowpipe_core::schema::Table;
use rowpipe_core::types::Scalar;

use crate::error::Result;

/// Delimited text header: one field per qualified column name.
pub fn csv_header(table: &Table, delimiter: u8) -> Result<Vec<u8>> {
    let names: Vec<String> = table.columns.iter().map(|c| c.qualified_name()).collect();
    csv_line(&names, delimiter)
}

pub fn csv_record(row: &Row, delimiter: u8) -> Result<Vec<u8>> {
    let fields: Vec<String> = row.values().iter().map(|v| v.to_string()).collect();
    csv_line(&fields, delimiter)
}

fn csv_line(fields: &[String], delimiter: u8) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer
        .into_inner()
        .map_err(|e| crate::error::Error::Io(e.into_error()))
}

pub fn scalar_to_json(v: &Scalar) -> serde_json::Value {
    use serde_json::Value;
    use Scalar::*;
    match v {
        Null => Value::Null,
        Bool(b) => Value::Bool(*b),
        I8(i) => Value::from(*i),
        I16(i) => Value::from(*i),
        I32(i) => Value::from(*i),
        I64(i) => Value::from(*i),
        U8(i) => Value::from(*i),
        U16(i) => Value::from(*i),
        U32(i) => Value::from(*i),
        U64(i) => Value::from(*i),
        F32(f) => Value::from(f64::from(*f)),
        F64(f) => Value::from(*f),
        // Decimals keep their exact text form.
        Decimal(d) => Value::String(d.to_string()),
        Str(s) => Value::String(s.clone()),
        Date(_) | Time(_) | DateTime(_) | Bin(_) | Guid(_) => Value::String(v.to_string()),
        Node(set) => Value::Array(
            set.rows
                .iter()
                .map(|r| json_object(&set.table, r))
                .collect(),
        ),
    }
}

pub fn json_object(table: &Table, row: &Row) -> serde_json::Value {
    let mut obj = serde_json::Map::with_capacity(row.len());
    for (col, value) in table.columns.iter().zip(row.values()) {
        obj.insert(col.qualified_name(), scalar_to_json(value));
    }
    serde_json::Value::Object(obj)
}

/// One array element, preceded by a comma unless it is the first.
pub fn json_element(table: &Table, row: &Row, first: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if !first {
        out.push(b',');
    }
    serde_json::to_writer(&mut out, &json_object(table, row))?;
    Ok(out)
}

/// Compact binary record: `u32` cell count, then one tagged cell per value.
/// Integers are little-endian; strings and bytes are `u32`-length prefixed.
pub fn binary_record(row: &Row, out: &mut Vec<u8>) -> Result<()> {
    put_len(row.len(), out)?;
    for v in row.values() {
        binary_cell(v, out)?;
    }
    Ok(())
}

/// Length prefixes are `u32`; anything longer cannot be framed.
fn put_len(len: usize, out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("length {len} does not fit a u32 prefix"),
        )
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_bytes(bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
    put_len(bytes.len(), out)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn binary_cell(v: &Scalar, out: &mut Vec<u8>) -> Result<()> {
    use Scalar::*;
    match v {
        Null => out.push(0),
        Bool(b) => {
            out.push(1);
            out.push(u8::from(*b));
        }
        I8(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        I16(i) => {
            out.push(3);
            out.extend_from_slice(&i.to_le_bytes());
        }
        I32(i) => {
            out.push(4);
            out.extend_from_slice(&i.to_le_bytes());
        }
        I64(i) => {
            out.push(5);
            out.extend_from_slice(&i.to_le_bytes());
        }
        U8(i) => {
            out.push(6);
            out.push(*i);
        }
        U16(i) => {
            out.push(7);
            out.extend_from_slice(&i.to_le_bytes());
        }
        U32(i) => {
            out.push(8);
            out.extend_from_slice(&i.to_le_bytes());
        }
        U64(i) => {
            out.push(9);
            out.extend_from_slice(&i.to_le_bytes());
        }
        F32(f) => {
            out.push(10);
            out.extend_from_slice(&f.to_le_bytes());
        }
        F64(f) => {
            out.push(11);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Decimal(d) => {
            out.push(12);
            out.extend_from_slice(&d.mantissa.to_le_bytes());
            out.push(d.scale);
        }
        Str(s) => {
            out.push(13);
            put_bytes(s.as_bytes(), out)?;
        }
        Date(d) => {
            out.push(14);
            out.extend_from_slice(&d.num_days_from_ce().to_le_bytes());
        }
        Time(t) => {
            out.push(15);
            out.extend_from_slice(&t.num_seconds_from_midnight().to_le_bytes());
            out.extend_from_slice(&t.nanosecond().to_le_bytes());
        }
        DateTime(dt) => {
            out.push(16);
            let utc = dt.and_utc();
            out.extend_from_slice(&utc.timestamp().to_le_bytes());
            out.extend_from_slice(&utc.timestamp_subsec_nanos().to_le_bytes());
        }
        Bin(bytes) => {
            out.push(17);
            put_bytes(bytes, out)?;
        }
        Guid(g) => {
            out.push(18);
            out.extend_from_slice(g.as_bytes());
        }
        Node(set) => {
            out.push(19);
            put_len(set.rows.len(), out)?;
            for r in &set.rows {
                binary_record(r, out)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpipe_core::schema::{Column, DataType};

    #[test]
    fn csv_quotes_fields_with_delimiters() {
        let row = Row::new(vec![Scalar::I32(1), Scalar::Str("a,b".into()), Scalar::Null]);
        assert_eq!(csv_record(&row, b',').unwrap(), b"1,\"a,b\",\n".to_vec());
    }

    #[test]
    fn binary_cells_are_tagged() {
        let mut out = Vec::new();
        binary_record(&Row::new(vec![Scalar::Null, Scalar::I16(-2), Scalar::Str("hi".into())]), &mut out)
            .unwrap();
        assert_eq!(
            out,
            vec![3, 0, 0, 0, 0, 3, 0xfe, 0xff, 13, 2, 0, 0, 0, b'h', b'i']
        );
    }

    #[test]
    fn oversized_length_prefix_is_an_error() {
        let mut out = Vec::new();
        put_len(u32::MAX as usize, &mut out).unwrap();
        assert_eq!(out, u32::MAX.to_le_bytes().to_vec());

        out.clear();
        if let Some(len) = (u32::MAX as usize).checked_add(1) {
            let err = put_len(len, &mut out).unwrap_err();
            assert!(matches!(err, crate::error::Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn json_uses_qualified_names() {
        let table = Table::new(
            "t",
            vec![Column::new("id", DataType::Int32).with_alias("o")],
        );
        let obj = json_object(&table, &Row::new(vec![Scalar::I32(7)]));
        assert_eq!(obj, serde_json::json!({ "o.id": 7 }));
    }
}
