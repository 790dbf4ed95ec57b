//! Dynamically-typed cell values.
//!
//! `Scalar` is a closed tagged union over the engine's semantic types. All
//! comparison and conversion dispatches explicitly on the tag; two values of
//! different variants are never silently coerced into each other.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::schema::{DataType, Table};

/// Fixed-point decimal: `mantissa * 10^-scale`.
///
/// Equality and ordering compare values, not representations: `1.50` equals
/// `1.5`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    pub mantissa: i128,
    pub scale: u8,
}

impl Decimal {
    pub const fn new(mantissa: i128, scale: u8) -> Self {
        Self { mantissa, scale }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(Error::Type(format!("'{text}' is not a decimal")));
        }
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return Err(Error::Type(format!("'{text}' is not a decimal")));
        }
        let scale = u8::try_from(frac_part.len())
            .map_err(|_| Error::Type(format!("'{text}' has too many fractional digits")))?;
        let joined = format!("{int_part}{frac_part}");
        let mantissa: i128 = if joined.is_empty() {
            0
        } else {
            joined
                .parse()
                .map_err(|_| Error::Type(format!("'{text}' overflows a decimal")))?
        };
        Ok(Self::new(if negative { -mantissa } else { mantissa }, scale))
    }

    fn rescaled(&self, scale: u8) -> Option<i128> {
        let factor = 10i128.checked_pow(u32::from(scale.checked_sub(self.scale)?))?;
        self.mantissa.checked_mul(factor)
    }

    /// Drop trailing fractional zeros so equal values share one representation.
    pub fn normalized(&self) -> Self {
        let mut out = *self;
        while out.scale > 0 && out.mantissa % 10 == 0 {
            out.mantissa /= 10;
            out.scale -= 1;
        }
        out
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(i32::from(self.scale))
    }

    /// Integer value when there is no fractional part.
    pub fn to_i128(&self) -> Option<i128> {
        let n = self.normalized();
        (n.scale == 0).then_some(n.mantissa)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        match (self.rescaled(scale), other.rescaled(scale)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.to_f64().total_cmp(&other.to_f64()),
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = usize::from(self.scale);
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

/// Materialized nested row-set carried by a node cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub table: Table,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(table: Table, rows: Vec<Row>) -> Self {
        Self { table, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Str(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Bin(Vec<u8>),
    Guid(Uuid),
    Node(Arc<RowSet>),
}

impl Scalar {
    /// Semantic type of this value; `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        use Scalar::*;
        Some(match self {
            Null => return None,
            Bool(_) => DataType::Boolean,
            I8(_) => DataType::Int8,
            I16(_) => DataType::Int16,
            I32(_) => DataType::Int32,
            I64(_) => DataType::Int64,
            U8(_) => DataType::UInt8,
            U16(_) => DataType::UInt16,
            U32(_) => DataType::UInt32,
            U64(_) => DataType::UInt64,
            F32(_) => DataType::Float32,
            F64(_) => DataType::Float64,
            Decimal(_) => DataType::Decimal,
            Str(_) => DataType::String,
            Date(_) => DataType::Date,
            Time(_) => DataType::Time,
            DateTime(_) => DataType::DateTime,
            Bin(_) => DataType::Binary,
            Guid(_) => DataType::Guid,
            Node(_) => DataType::Node,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// `Null` conforms to every type; other values only to their own.
    pub fn conforms_to(&self, data_type: DataType) -> bool {
        self.data_type().map_or(true, |dt| dt == data_type)
    }

    pub fn as_node(&self) -> Option<&Arc<RowSet>> {
        match self {
            Scalar::Node(set) => Some(set),
            _ => None,
        }
    }

    /// Natural order within one semantic type.
    ///
    /// `Null` sorts before every value. Floats use IEEE total ordering, text
    /// is ordinal, and booleans order `false < true`. Values of different
    /// types fail with `Error::Type`.
    pub fn try_cmp(&self, other: &Scalar) -> Result<Ordering> {
        use Scalar::*;
        Ok(match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (I8(a), I8(b)) => a.cmp(b),
            (I16(a), I16(b)) => a.cmp(b),
            (I32(a), I32(b)) => a.cmp(b),
            (I64(a), I64(b)) => a.cmp(b),
            (U8(a), U8(b)) => a.cmp(b),
            (U16(a), U16(b)) => a.cmp(b),
            (U32(a), U32(b)) => a.cmp(b),
            (U64(a), U64(b)) => a.cmp(b),
            (F32(a), F32(b)) => a.total_cmp(b),
            (F64(a), F64(b)) => a.total_cmp(b),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (Bin(a), Bin(b)) => a.cmp(b),
            (Guid(a), Guid(b)) => a.cmp(b),
            (Node(_), Node(_)) => {
                return Err(Error::Type("node values are not comparable".into()));
            }
            (a, b) => {
                return Err(Error::Type(format!(
                    "cannot compare {:?} with {:?}",
                    a.data_type(),
                    b.data_type()
                )));
            }
        })
    }

    /// Integer payload widened to i128, for range-checked conversions.
    pub fn as_i128(&self) -> Option<i128> {
        use Scalar::*;
        match self {
            I8(v) => Some(i128::from(*v)),
            I16(v) => Some(i128::from(*v)),
            I32(v) => Some(i128::from(*v)),
            I64(v) => Some(i128::from(*v)),
            U8(v) => Some(i128::from(*v)),
            U16(v) => Some(i128::from(*v)),
            U32(v) => Some(i128::from(*v)),
            U64(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::F32(v) => Some(f64::from(*v)),
            Scalar::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Explicit conversion to `target`. Never used implicitly by comparisons.
    pub fn cast_to(&self, target: DataType) -> Result<Scalar> {
        if self.conforms_to(target) {
            return Ok(self.clone());
        }
        let fail = || {
            Error::Type(format!(
                "cannot convert {:?} value '{}' to {:?}",
                self.data_type(),
                self,
                target
            ))
        };

        if target == DataType::String {
            return match self {
                Scalar::Node(_) => Err(fail()),
                other => Ok(Scalar::Str(other.to_string())),
            };
        }

        if let Some(v) = self.as_i128() {
            return match target {
                t if t.is_integer() => integer_as(v, t).ok_or_else(fail),
                DataType::Float32 => Ok(Scalar::F32(v as f32)),
                DataType::Float64 => Ok(Scalar::F64(v as f64)),
                DataType::Decimal => Ok(Scalar::Decimal(Decimal::new(v, 0))),
                DataType::Boolean => Ok(Scalar::Bool(v != 0)),
                _ => Err(fail()),
            };
        }

        match (self, target) {
            (Scalar::Bool(b), t) if t.is_integer() => {
                integer_as(i128::from(u8::from(*b)), t).ok_or_else(fail)
            }
            (Scalar::F32(v), DataType::Float64) => Ok(Scalar::F64(f64::from(*v))),
            (Scalar::F64(v), DataType::Float32) => Ok(Scalar::F32(*v as f32)),
            (Scalar::F32(_) | Scalar::F64(_), t) => {
                let v = self.as_f64().ok_or_else(fail)?;
                if t == DataType::Decimal {
                    return Decimal::parse(&v.to_string()).map(Scalar::Decimal);
                }
                if t.is_integer() && v.fract() == 0.0 && v.is_finite() {
                    return integer_as(v as i128, t).ok_or_else(fail);
                }
                Err(fail())
            }
            (Scalar::Decimal(d), DataType::Float64) => Ok(Scalar::F64(d.to_f64())),
            (Scalar::Decimal(d), DataType::Float32) => Ok(Scalar::F32(d.to_f64() as f32)),
            (Scalar::Decimal(d), t) if t.is_integer() => d
                .to_i128()
                .and_then(|v| integer_as(v, t))
                .ok_or_else(fail),
            (Scalar::Date(d), DataType::DateTime) => Ok(Scalar::DateTime(d.and_time(NaiveTime::MIN))),
            (Scalar::DateTime(dt), DataType::Date) => Ok(Scalar::Date(dt.date())),
            (Scalar::DateTime(dt), DataType::Time) => Ok(Scalar::Time(dt.time())),
            (Scalar::Str(s), t) => parse_str(s, t).ok_or_else(fail),
            _ => Err(fail()),
        }
    }

    /// Rough in-memory footprint, used for budget accounting.
    pub fn estimated_bytes(&self) -> usize {
        let heap = match self {
            Scalar::Str(s) => s.len(),
            Scalar::Bin(b) => b.len(),
            Scalar::Node(set) => set.rows.iter().map(Row::estimated_bytes).sum(),
            _ => 0,
        };
        std::mem::size_of::<Scalar>() + heap
    }
}

fn integer_as(v: i128, target: DataType) -> Option<Scalar> {
    Some(match target {
        DataType::Int8 => Scalar::I8(i8::try_from(v).ok()?),
        DataType::Int16 => Scalar::I16(i16::try_from(v).ok()?),
        DataType::Int32 => Scalar::I32(i32::try_from(v).ok()?),
        DataType::Int64 => Scalar::I64(i64::try_from(v).ok()?),
        DataType::UInt8 => Scalar::U8(u8::try_from(v).ok()?),
        DataType::UInt16 => Scalar::U16(u16::try_from(v).ok()?),
        DataType::UInt32 => Scalar::U32(u32::try_from(v).ok()?),
        DataType::UInt64 => Scalar::U64(u64::try_from(v).ok()?),
        _ => return None,
    })
}

fn parse_str(s: &str, target: DataType) -> Option<Scalar> {
    let t = s.trim();
    match target {
        dt if dt.is_integer() => integer_as(t.parse::<i128>().ok()?, dt),
        DataType::Float32 => t.parse().ok().map(Scalar::F32),
        DataType::Float64 => t.parse().ok().map(Scalar::F64),
        DataType::Decimal => Decimal::parse(t).ok().map(Scalar::Decimal),
        DataType::Boolean => match t.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Scalar::Bool(true)),
            "false" | "0" | "no" => Some(Scalar::Bool(false)),
            _ => None,
        },
        DataType::Date => NaiveDate::parse_from_str(t, "%Y-%m-%d").ok().map(Scalar::Date),
        DataType::Time => NaiveTime::parse_from_str(t, "%H:%M:%S%.f")
            .ok()
            .map(Scalar::Time),
        DataType::DateTime => NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
            .map(Scalar::DateTime),
        DataType::Guid => Uuid::parse_str(t).ok().map(Scalar::Guid),
        DataType::Binary => Some(Scalar::Bin(s.as_bytes().to_vec())),
        _ => None,
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Scalar::*;
        match self {
            Null => Ok(()),
            Bool(v) => write!(f, "{v}"),
            I8(v) => write!(f, "{v}"),
            I16(v) => write!(f, "{v}"),
            I32(v) => write!(f, "{v}"),
            I64(v) => write!(f, "{v}"),
            U8(v) => write!(f, "{v}"),
            U16(v) => write!(f, "{v}"),
            U32(v) => write!(f, "{v}"),
            U64(v) => write!(f, "{v}"),
            F32(v) => write!(f, "{v}"),
            F64(v) => write!(f, "{v}"),
            Decimal(v) => write!(f, "{v}"),
            Str(v) => f.write_str(v),
            Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Time(v) => write!(f, "{v}"),
            DateTime(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Bin(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Guid(v) => write!(f, "{}", v.hyphenated()),
            Node(set) => write!(f, "[{} rows]", set.len()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::I32(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::I64(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::F64(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(v: Option<T>) -> Self {
        v.map_or(Scalar::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_per_type() {
        assert_eq!(Scalar::I64(1).try_cmp(&Scalar::I64(2)).unwrap(), Ordering::Less);
        assert_eq!(
            Scalar::Str("b".into()).try_cmp(&Scalar::Str("a".into())).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Scalar::Bool(false).try_cmp(&Scalar::Bool(true)).unwrap(),
            Ordering::Less
        );
        let d1 = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        assert_eq!(
            Scalar::Date(d1).try_cmp(&Scalar::Date(d2)).unwrap(),
            Ordering::Less
        );
        assert_eq!(Scalar::Null.try_cmp(&Scalar::I32(0)).unwrap(), Ordering::Less);
    }

    #[test]
    fn mixed_types_do_not_compare() {
        assert!(Scalar::I32(1).try_cmp(&Scalar::I64(1)).is_err());
        assert!(Scalar::Str("1".into()).try_cmp(&Scalar::I64(1)).is_err());
    }

    #[test]
    fn decimals_compare_across_scales() {
        let a = Decimal::new(150, 2); // 1.50
        let b = Decimal::new(15, 1); // 1.5
        let c = Decimal::new(2, 0);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&c), Ordering::Less);
        assert_eq!(a, b);
        assert_eq!(Scalar::Decimal(a), Scalar::Decimal(b));
        assert_ne!(a, c);
        let n = a.normalized();
        assert_eq!((n.mantissa, n.scale), (15, 1));
        let parsed = Decimal::parse("-12.034").unwrap();
        assert_eq!((parsed.mantissa, parsed.scale), (-12034, 3));
        assert_eq!(Decimal::new(-12034, 3).to_string(), "-12.034");
        assert_eq!(Decimal::new(5, 3).to_string(), "0.005");
    }

    #[test]
    fn explicit_casts() {
        assert_eq!(
            Scalar::I32(7).cast_to(DataType::Int64).unwrap(),
            Scalar::I64(7)
        );
        assert!(Scalar::I64(300).cast_to(DataType::Int8).is_err());
        assert_eq!(
            Scalar::Str("42".into()).cast_to(DataType::UInt16).unwrap(),
            Scalar::U16(42)
        );
        assert_eq!(
            Scalar::Str("2024-02-29".into())
                .cast_to(DataType::Date)
                .unwrap(),
            Scalar::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(
            Scalar::F64(3.0).cast_to(DataType::Int32).unwrap(),
            Scalar::I32(3)
        );
        assert!(Scalar::F64(3.5).cast_to(DataType::Int32).is_err());
        assert_eq!(Scalar::Null.cast_to(DataType::Guid).unwrap(), Scalar::Null);
        assert_eq!(
            Scalar::I64(5).cast_to(DataType::String).unwrap(),
            Scalar::Str("5".into())
        );
    }
}
