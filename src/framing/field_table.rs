//! AMQP field tables.
//!
//! A field table is an ordered list of `shortstr` keys mapped to typed
//! values. Insertion order is preserved on the wire.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{put_long_bytes, put_short_str};
use crate::error::{AmqError, Result};

/// Deepest table nesting the encoder accepts.
pub const MAX_TABLE_DEPTH: usize = 16;

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t` boolean
    Bool(bool),
    /// `I` signed 32-bit integer
    I32(i32),
    /// `l` signed 64-bit integer
    I64(i64),
    /// `d` 64-bit float
    F64(f64),
    /// `D` decimal: scale then unscaled value
    Decimal {
        /// Number of decimal places
        scale: u8,
        /// Unscaled value
        value: i32,
    },
    /// `T` POSIX timestamp (seconds)
    Timestamp(u64),
    /// `S` long string
    LongString(String),
    /// `x` raw byte array
    Bytes(Bytes),
    /// `F` nested table
    Table(FieldTable),
    /// `V` no value
    Void,
}

impl FieldValue {
    fn type_tag(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::I32(_) => b'I',
            FieldValue::I64(_) => b'l',
            FieldValue::F64(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::LongString(_) => b'S',
            FieldValue::Bytes(_) => b'x',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
        }
    }

    fn encode(&self, buf: &mut BytesMut, depth: usize) -> Result<()> {
        buf.put_u8(self.type_tag());
        match self {
            FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
            FieldValue::I32(v) => buf.put_i32(*v),
            FieldValue::I64(v) => buf.put_i64(*v),
            FieldValue::F64(v) => buf.put_f64(*v),
            FieldValue::Decimal { scale, value } => {
                buf.put_u8(*scale);
                buf.put_i32(*value);
            },
            FieldValue::Timestamp(v) => buf.put_u64(*v),
            FieldValue::LongString(v) => put_long_bytes(buf, v.as_bytes())?,
            FieldValue::Bytes(v) => put_long_bytes(buf, v)?,
            FieldValue::Table(t) => t.encode_at(buf, depth + 1)?,
            FieldValue::Void => {},
        }
        Ok(())
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::LongString(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::LongString(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Ordered key to typed-value table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable {
    entries: Vec<(String, FieldValue)>,
}

impl FieldTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Replacing an existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder form of [`FieldTable::insert`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append the table (u32 length prefix, then entries) to `buf`.
    ///
    /// On error `buf` is left as it was.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        self.encode_at(buf, 1)
    }

    fn encode_at(&self, buf: &mut BytesMut, depth: usize) -> Result<()> {
        if depth > MAX_TABLE_DEPTH {
            return Err(AmqError::Encoding(format!(
                "field table nested deeper than {MAX_TABLE_DEPTH} levels"
            )));
        }

        let mut body = BytesMut::new();
        for (key, value) in &self.entries {
            if key.is_empty() {
                return Err(AmqError::Encoding("field table key is empty".to_string()));
            }
            put_short_str(&mut body, key)?;
            value.encode(&mut body, depth)?;
        }
        put_long_bytes(buf, &body)
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = FieldTable::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}
