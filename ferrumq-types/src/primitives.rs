//! Implements the AMQP field primitives: short strings, long strings and
//! field tables

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ensure, DecodeError};

/// A string of at most 255 UTF-8 octets, encoded as `u8 length || bytes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShortString(String);

impl ShortString {
    /// Wraps `value`, rejecting strings longer than 255 octets.
    pub fn new(value: impl Into<String>) -> Result<Self, ShortStringError> {
        let value = value.into();
        if value.len() > u8::MAX as usize {
            return Err(ShortStringError::TooLong(value.len()));
        }
        Ok(Self(value))
    }

    /// The string content.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Octets occupied on the wire: the length prefix plus the content.
    pub fn encoded_size(&self) -> usize {
        1 + self.0.len()
    }

    /// Writes `length || bytes` into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.0.len() as u8);
        dst.put_slice(self.0.as_bytes());
    }

    /// Reads `length || bytes` from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 1)?;
        let len = src.get_u8() as usize;
        ensure(src, len)?;
        let mut raw = vec![0u8; len];
        src.copy_to_slice(&mut raw);
        let value = String::from_utf8(raw).map_err(|_| DecodeError::BadUtf8)?;
        Ok(Self(value))
    }
}

impl std::fmt::Display for ShortString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ShortString {
    type Error = ShortStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Error constructing a [`ShortString`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShortStringError {
    /// The value exceeds the 255-octet limit
    #[error("Short string of {0} octets exceeds the 255 octet limit")]
    TooLong(usize),
}

/// A length-prefixed byte string, encoded as `u32 length || bytes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongString(Bytes);

impl LongString {
    /// Wraps raw bytes.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self(value.into())
    }

    /// The raw content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The content as UTF-8, if it is valid UTF-8.
    pub fn as_utf8(&self) -> Result<&str, DecodeError> {
        std::str::from_utf8(&self.0).map_err(|_| DecodeError::BadUtf8)
    }

    /// Octets occupied on the wire.
    pub fn encoded_size(&self) -> usize {
        4 + self.0.len()
    }

    /// Writes `length || bytes` into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.0.len() as u32);
        dst.put_slice(&self.0);
    }

    /// Reads `length || bytes` from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        let len = src.get_u32() as usize;
        ensure(src, len)?;
        Ok(Self(src.copy_to_bytes(len)))
    }
}

impl From<&str> for LongString {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<Vec<u8>> for LongString {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

/// A typed field table value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// `t` — boolean
    Bool(bool),

    /// `b` — signed 8-bit
    I8(i8),

    /// `B` — unsigned 8-bit
    U8(u8),

    /// `s` — signed 16-bit
    I16(i16),

    /// `u` — unsigned 16-bit
    U16(u16),

    /// `I` — signed 32-bit
    I32(i32),

    /// `i` — unsigned 32-bit
    U32(u32),

    /// `l` — signed 64-bit
    I64(i64),

    /// `f` — 32-bit float
    F32(f32),

    /// `d` — 64-bit float
    F64(f64),

    /// `D` — decimal: scale octet plus unscaled 32-bit value
    Decimal(u8, u32),

    /// `S` — long string
    LongString(LongString),

    /// `A` — field array
    Array(Vec<FieldValue>),

    /// `T` — timestamp, POSIX seconds
    Timestamp(u64),

    /// `F` — nested field table
    Table(FieldTable),

    /// `V` — no value
    Void,
}

impl FieldValue {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Bool(_) => b't',
            Self::I8(_) => b'b',
            Self::U8(_) => b'B',
            Self::I16(_) => b's',
            Self::U16(_) => b'u',
            Self::I32(_) => b'I',
            Self::U32(_) => b'i',
            Self::I64(_) => b'l',
            Self::F32(_) => b'f',
            Self::F64(_) => b'd',
            Self::Decimal(..) => b'D',
            Self::LongString(_) => b'S',
            Self::Array(_) => b'A',
            Self::Timestamp(_) => b'T',
            Self::Table(_) => b'F',
            Self::Void => b'V',
        }
    }

    /// Octets occupied on the wire, including the type tag.
    pub fn encoded_size(&self) -> usize {
        1 + match self {
            Self::Bool(_) | Self::I8(_) | Self::U8(_) => 1,
            Self::I16(_) | Self::U16(_) => 2,
            Self::I32(_) | Self::U32(_) | Self::F32(_) => 4,
            Self::I64(_) | Self::F64(_) | Self::Timestamp(_) => 8,
            Self::Decimal(..) => 5,
            Self::LongString(s) => s.encoded_size(),
            Self::Array(items) => 4 + items.iter().map(FieldValue::encoded_size).sum::<usize>(),
            Self::Table(table) => table.encoded_size(),
            Self::Void => 0,
        }
    }

    /// Writes the tagged value into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.type_tag());
        match self {
            Self::Bool(v) => dst.put_u8(*v as u8),
            Self::I8(v) => dst.put_i8(*v),
            Self::U8(v) => dst.put_u8(*v),
            Self::I16(v) => dst.put_i16(*v),
            Self::U16(v) => dst.put_u16(*v),
            Self::I32(v) => dst.put_i32(*v),
            Self::U32(v) => dst.put_u32(*v),
            Self::I64(v) => dst.put_i64(*v),
            Self::F32(v) => dst.put_f32(*v),
            Self::F64(v) => dst.put_f64(*v),
            Self::Decimal(scale, value) => {
                dst.put_u8(*scale);
                dst.put_u32(*value);
            }
            Self::LongString(v) => v.encode(dst),
            Self::Array(items) => {
                let len: usize = items.iter().map(FieldValue::encoded_size).sum();
                dst.put_u32(len as u32);
                for item in items {
                    item.encode(dst);
                }
            }
            Self::Timestamp(v) => dst.put_u64(*v),
            Self::Table(table) => table.encode(dst),
            Self::Void => {}
        }
    }

    /// Reads a tagged value from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 1)?;
        let tag = src.get_u8();
        let value = match tag {
            b't' => {
                ensure(src, 1)?;
                Self::Bool(src.get_u8() != 0)
            }
            b'b' => {
                ensure(src, 1)?;
                Self::I8(src.get_i8())
            }
            b'B' => {
                ensure(src, 1)?;
                Self::U8(src.get_u8())
            }
            b's' => {
                ensure(src, 2)?;
                Self::I16(src.get_i16())
            }
            b'u' => {
                ensure(src, 2)?;
                Self::U16(src.get_u16())
            }
            b'I' => {
                ensure(src, 4)?;
                Self::I32(src.get_i32())
            }
            b'i' => {
                ensure(src, 4)?;
                Self::U32(src.get_u32())
            }
            b'l' => {
                ensure(src, 8)?;
                Self::I64(src.get_i64())
            }
            b'f' => {
                ensure(src, 4)?;
                Self::F32(src.get_f32())
            }
            b'd' => {
                ensure(src, 8)?;
                Self::F64(src.get_f64())
            }
            b'D' => {
                ensure(src, 5)?;
                Self::Decimal(src.get_u8(), src.get_u32())
            }
            b'S' => Self::LongString(LongString::decode(src)?),
            b'A' => {
                ensure(src, 4)?;
                let len = src.get_u32() as usize;
                ensure(src, len)?;
                let mut inner = src.copy_to_bytes(len);
                let mut items = Vec::new();
                while inner.has_remaining() {
                    items.push(FieldValue::decode(&mut inner)?);
                }
                Self::Array(items)
            }
            b'T' => {
                ensure(src, 8)?;
                Self::Timestamp(src.get_u64())
            }
            b'F' => Self::Table(FieldTable::decode(src)?),
            b'V' => Self::Void,
            other => return Err(DecodeError::UnknownFieldType(other)),
        };
        Ok(value)
    }
}

/// A field table: `u32 byte-length || sequence of (name, tagged value)`.
///
/// Entries keep a stable (sorted) order so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(BTreeMap<ShortString, FieldValue>);

impl FieldTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous value under `name`.
    pub fn insert(&mut self, name: ShortString, value: FieldValue) {
        self.0.insert(name, value);
    }

    /// Looks an entry up by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v)
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Octets occupied on the wire, including the length prefix.
    pub fn encoded_size(&self) -> usize {
        4 + self
            .0
            .iter()
            .map(|(k, v)| k.encoded_size() + v.encoded_size())
            .sum::<usize>()
    }

    /// Writes the table into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32((self.encoded_size() - 4) as u32);
        for (name, value) in &self.0 {
            name.encode(dst);
            value.encode(dst);
        }
    }

    /// Reads a table from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        let len = src.get_u32() as usize;
        if src.remaining() < len {
            return Err(DecodeError::LengthOverrun);
        }
        let mut inner = src.copy_to_bytes(len);
        let mut table = Self::new();
        while inner.has_remaining() {
            let name = ShortString::decode(&mut inner)?;
            let value = FieldValue::decode(&mut inner)?;
            table.insert(name, value);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn shortstr(s: &str) -> ShortString {
        ShortString::new(s).unwrap()
    }

    #[test]
    fn short_string_round_trip() {
        let value = shortstr("amq.direct");
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        assert_eq!(buf.len(), value.encoded_size());
        let decoded = ShortString::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn short_string_rejects_over_255_octets() {
        let long = "x".repeat(256);
        assert_eq!(
            ShortString::new(long),
            Err(ShortStringError::TooLong(256))
        );
    }

    #[test]
    fn long_string_round_trip() {
        let value = LongString::from("\0guest\0guest");
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        let decoded = LongString::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn field_table_round_trip() {
        let mut nested = FieldTable::new();
        nested.insert(shortstr("x-retries"), FieldValue::I32(3));

        let mut table = FieldTable::new();
        table.insert(shortstr("product"), FieldValue::LongString("qpid".into()));
        table.insert(shortstr("qpid.message_compression_supported"), FieldValue::Bool(true));
        table.insert(shortstr("weights"), FieldValue::Array(vec![
            FieldValue::U8(1),
            FieldValue::Timestamp(1_234_567),
        ]));
        table.insert(shortstr("nested"), FieldValue::Table(nested));
        table.insert(shortstr("void"), FieldValue::Void);

        let mut buf = BytesMut::new();
        table.encode(&mut buf);
        assert_eq!(buf.len(), table.encoded_size());
        let decoded = FieldTable::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn table_length_overrun_is_detected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x10, 0x01]);
        assert_eq!(
            FieldTable::decode(&mut buf.freeze()),
            Err(DecodeError::LengthOverrun)
        );
    }

    #[test]
    fn unknown_type_tag_is_reported() {
        let mut buf = BytesMut::new();
        shortstr("k").encode(&mut buf);
        buf.extend_from_slice(&[b'Z', 0, 0]);
        let mut table = BytesMut::new();
        table.put_u32(buf.len() as u32);
        table.extend_from_slice(&buf);
        assert_eq!(
            FieldTable::decode(&mut table.freeze()),
            Err(DecodeError::UnknownFieldType(b'Z'))
        );
    }
}
