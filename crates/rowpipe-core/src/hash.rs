//! Stable hashing of cell values and key tuples.
//!
//! Used by lookup indexes; equal values (per `Scalar::try_cmp`) hash equally
//! as long as they share a variant, which binding filters guarantees.

use blake3::Hasher;

use crate::types::Scalar;

fn tag(scalar: &Scalar) -> u8 {
    use Scalar::*;
    match scalar {
        Null => 0,
        Bool(_) => 1,
        I8(_) => 2,
        I16(_) => 3,
        I32(_) => 4,
        I64(_) => 5,
        U8(_) => 6,
        U16(_) => 7,
        U32(_) => 8,
        U64(_) => 9,
        F32(_) => 10,
        F64(_) => 11,
        Decimal(_) => 12,
        Str(_) => 13,
        Date(_) => 14,
        Time(_) => 15,
        DateTime(_) => 16,
        Bin(_) => 17,
        Guid(_) => 18,
        Node(_) => 19,
    }
}

/// Feed one value (type tag first) into `hasher`.
pub fn hash_scalar(scalar: &Scalar, hasher: &mut Hasher) {
    use Scalar::*;

    hasher.update(&[tag(scalar)]);
    match scalar {
        Null => {}
        Bool(b) => {
            hasher.update(&[u8::from(*b)]);
        }
        I8(v) => {
            hasher.update(&v.to_le_bytes());
        }
        I16(v) => {
            hasher.update(&v.to_le_bytes());
        }
        I32(v) => {
            hasher.update(&v.to_le_bytes());
        }
        I64(v) => {
            hasher.update(&v.to_le_bytes());
        }
        U8(v) => {
            hasher.update(&v.to_le_bytes());
        }
        U16(v) => {
            hasher.update(&v.to_le_bytes());
        }
        U32(v) => {
            hasher.update(&v.to_le_bytes());
        }
        U64(v) => {
            hasher.update(&v.to_le_bytes());
        }
        F32(v) => {
            hasher.update(&v.to_bits().to_le_bytes());
        }
        F64(v) => {
            hasher.update(&v.to_bits().to_le_bytes());
        }
        Decimal(d) => {
            let d = d.normalized();
            hasher.update(&d.mantissa.to_le_bytes());
            hasher.update(&[d.scale]);
        }
        Str(s) => {
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Date(d) => {
            hasher.update(d.to_string().as_bytes());
        }
        Time(t) => {
            hasher.update(t.to_string().as_bytes());
        }
        DateTime(dt) => {
            hasher.update(dt.to_string().as_bytes());
        }
        Bin(b) => {
            hasher.update(&(b.len() as u64).to_le_bytes());
            hasher.update(b);
        }
        Guid(g) => {
            hasher.update(g.as_bytes());
        }
        Node(set) => {
            hasher.update(&(set.len() as u64).to_le_bytes());
            for row in &set.rows {
                for v in row.values() {
                    hash_scalar(v, hasher);
                }
            }
        }
    }
}

/// 64-bit hash of a key tuple.
pub fn hash_key(values: &[Scalar]) -> u64 {
    let mut hasher = Hasher::new();
    for v in values {
        hash_scalar(v, &mut hasher);
    }
    let out = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&out.as_bytes()[..8]);
    u64::from_le_bytes(first)
}
