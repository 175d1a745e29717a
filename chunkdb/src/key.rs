//! Typed column values and their order-preserving 32-byte key encoding.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::error::ChunkDbError;

/// Width of every encoded index key.
pub const KEY_SIZE: usize = 32;

/// Value types a column can declare.
#[derive(Clone, Copy, Debug, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// 64-bit signed integer keys.
    Integer,
    /// 64-bit float keys.
    Float,
    /// UTF-8 text keys, truncated at 32 bytes.
    String,
}

impl ColumnType {
    /// Code byte stored in the table descriptor.
    pub(crate) fn code(self) -> u8 {
        match self {
            ColumnType::Integer => 1,
            ColumnType::Float => 2,
            ColumnType::String => 3,
        }
    }

    /// Inverse of [`code`](ColumnType::code).
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ColumnType::Integer),
            2 => Some(ColumnType::Float),
            3 => Some(ColumnType::String),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::String => write!(f, "string"),
        }
    }
}

/// A typed column value as it appears in a row.
///
/// Rows travel as JSON, so the serde form is untagged: JSON integers become
/// [`Value::Integer`], other numbers [`Value::Float`], strings
/// [`Value::Text`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A fixed-width 32-byte index key. Ordering is lexicographic on the bytes;
/// the encoder guarantees that matches the natural order of the source type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey([u8; KEY_SIZE]);

impl IndexKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        IndexKey(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Key bytes with the trailing zero padding removed, as stored in
    /// hash-trie leaves.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.0[..end]
    }

    /// Rebuild a key from its trimmed form by restoring the zero padding.
    pub(crate) fn from_trimmed(bytes: &[u8]) -> Self {
        let mut buf = [0u8; KEY_SIZE];
        let len = bytes.len().min(KEY_SIZE);
        buf[..len].copy_from_slice(&bytes[..len]);
        IndexKey(buf)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexKey({})", hex::encode(self.0))
    }
}

/// Encode `value` into a 32-byte key under `column_type`.
///
/// The encoding preserves order: `encode_key(t, a) < encode_key(t, b)`
/// lexicographically iff `a < b` under the natural order of `t`. Strings
/// longer than 32 bytes are truncated, so callers accept collision risk
/// beyond that length. Numeric values coerce across the two numeric column
/// types; any other mismatch is an error.
pub fn encode_key(column_type: ColumnType, value: &Value) -> Result<IndexKey> {
    let mut buf = [0u8; KEY_SIZE];
    match (column_type, value) {
        (ColumnType::Integer, Value::Integer(v)) => {
            buf[24..].copy_from_slice(&order_i64(*v));
        }
        (ColumnType::Integer, Value::Float(v)) => {
            buf[24..].copy_from_slice(&order_i64(*v as i64));
        }
        (ColumnType::Float, Value::Float(v)) => {
            buf[24..].copy_from_slice(&order_f64(*v));
        }
        (ColumnType::Float, Value::Integer(v)) => {
            buf[24..].copy_from_slice(&order_f64(*v as f64));
        }
        (ColumnType::String, Value::Text(s)) => {
            let bytes = s.as_bytes();
            let len = bytes.len().min(KEY_SIZE);
            buf[..len].copy_from_slice(&bytes[..len]);
        }
        (column_type, value) => {
            return Err(ChunkDbError::TypeMismatch(value.to_string(), column_type).into());
        }
    }
    Ok(IndexKey(buf))
}

// Sign-flipped big-endian so negative integers sort below positive ones.
fn order_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

// IEEE-754 total-order transform: flip every bit of a negative, only the
// sign bit of a non-negative.
fn order_f64(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let flipped = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    flipped.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cmp::Ordering;

    use rand::Rng;

    fn int_key(v: i64) -> IndexKey {
        encode_key(ColumnType::Integer, &Value::Integer(v)).expect("encodes")
    }

    fn float_key(v: f64) -> IndexKey {
        encode_key(ColumnType::Float, &Value::Float(v)).expect("encodes")
    }

    fn text_key(s: &str) -> IndexKey {
        encode_key(ColumnType::String, &Value::Text(s.to_string())).expect("encodes")
    }

    #[test]
    fn it_preserves_integer_order() {
        for _ in 0..1_000 {
            let a = rand::thread_rng().gen_range(i64::MIN..i64::MAX);
            let b = rand::thread_rng().gen_range(i64::MIN..i64::MAX);
            assert_eq!(a.cmp(&b), int_key(a).cmp(&int_key(b)), "{a} vs {b}");
        }
    }

    #[test]
    fn it_preserves_integer_order_at_boundaries() {
        let samples = [i64::MIN, i64::MIN + 1, -256, -1, 0, 1, 255, i64::MAX - 1, i64::MAX];
        for a in samples {
            for b in samples {
                assert_eq!(a.cmp(&b), int_key(a).cmp(&int_key(b)), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn it_preserves_float_order() {
        for _ in 0..1_000 {
            let a: f64 = rand::thread_rng().gen_range(-1e12..1e12);
            let b: f64 = rand::thread_rng().gen_range(-1e12..1e12);
            let expected = a.partial_cmp(&b).expect("finite");
            assert_eq!(expected, float_key(a).cmp(&float_key(b)), "{a} vs {b}");
        }
    }

    #[test]
    fn it_preserves_float_order_at_boundaries() {
        let samples = [
            f64::NEG_INFINITY,
            f64::MIN,
            -1.5,
            -f64::MIN_POSITIVE,
            0.0,
            f64::MIN_POSITIVE,
            1.5,
            f64::MAX,
            f64::INFINITY,
        ];
        for a in samples {
            for b in samples {
                let expected = a.partial_cmp(&b).expect("comparable");
                assert_eq!(expected, float_key(a).cmp(&float_key(b)), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn it_preserves_string_order() {
        let samples = ["", "a", "aa", "ab", "b", "zebra", "zebrab"];
        for a in samples {
            for b in samples {
                assert_eq!(a.cmp(b), text_key(a).cmp(&text_key(b)), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn it_truncates_long_strings() {
        let long_a = "a".repeat(40);
        let long_b = format!("{}b", "a".repeat(39));
        // Both truncate to 32 'a's: collision is accepted beyond 32 bytes.
        assert_eq!(Ordering::Equal, text_key(&long_a).cmp(&text_key(&long_b)));
        assert_eq!(text_key(&long_a).trimmed().len(), KEY_SIZE);
    }

    #[test]
    fn it_coerces_numeric_values() {
        let from_int = encode_key(ColumnType::Float, &Value::Integer(3)).expect("coerces");
        assert_eq!(from_int, float_key(3.0));
        let from_float = encode_key(ColumnType::Integer, &Value::Float(3.0)).expect("coerces");
        assert_eq!(from_float, int_key(3));
    }

    #[test]
    fn it_rejects_text_for_numeric_columns() {
        let err = encode_key(ColumnType::Integer, &Value::Text("three".to_string()))
            .expect_err("must not encode");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::TypeMismatch(_, ColumnType::Integer))
        ));
    }

    #[test]
    fn it_round_trips_trimmed_keys() {
        for key in [text_key(""), text_key("alice"), int_key(0), int_key(256), int_key(-7)] {
            assert_eq!(key, IndexKey::from_trimmed(key.trimmed()));
        }
    }
}
