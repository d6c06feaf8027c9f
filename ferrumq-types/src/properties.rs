//! Implements the content header and its basic-class property list

use bytes::{Buf, BufMut};

use crate::constants::CLASS_BASIC;
use crate::error::{ensure, DecodeError};
use crate::primitives::{FieldTable, ShortString};

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;
const FLAG_CONTINUATION: u16 = 1;

/// The per-message properties carried by a basic-class content header.
///
/// Absent fields occupy no octets; presence is signalled by the 16-bit
/// property flag word.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<ShortString>,

    /// MIME content encoding; `"gzip"` marks compressed bodies
    pub content_encoding: Option<ShortString>,

    /// Application headers
    pub headers: Option<FieldTable>,

    /// 1 = non-persistent, 2 = persistent
    pub delivery_mode: Option<u8>,

    /// Priority, 0..=9
    pub priority: Option<u8>,

    /// Application correlation identifier
    pub correlation_id: Option<ShortString>,

    /// Address to reply to
    pub reply_to: Option<ShortString>,

    /// Message expiration specification
    pub expiration: Option<ShortString>,

    /// Application message identifier
    pub message_id: Option<ShortString>,

    /// Message timestamp, POSIX seconds
    pub timestamp: Option<u64>,

    /// Message type name
    pub message_type: Option<ShortString>,

    /// Creating user id
    pub user_id: Option<ShortString>,

    /// Creating application id
    pub app_id: Option<ShortString>,

    /// Intra-cluster routing identifier
    pub cluster_id: Option<ShortString>,
}

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if self.content_encoding.is_some() {
            flags |= FLAG_CONTENT_ENCODING;
        }
        if self.headers.is_some() {
            flags |= FLAG_HEADERS;
        }
        if self.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if self.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.expiration.is_some() {
            flags |= FLAG_EXPIRATION;
        }
        if self.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_TIMESTAMP;
        }
        if self.message_type.is_some() {
            flags |= FLAG_TYPE;
        }
        if self.user_id.is_some() {
            flags |= FLAG_USER_ID;
        }
        if self.app_id.is_some() {
            flags |= FLAG_APP_ID;
        }
        if self.cluster_id.is_some() {
            flags |= FLAG_CLUSTER_ID;
        }
        flags
    }

    /// Octets occupied on the wire: flag word plus present fields.
    pub fn encoded_size(&self) -> usize {
        let mut size = 2;
        let shortstr = |s: &Option<ShortString>| s.as_ref().map_or(0, ShortString::encoded_size);
        size += shortstr(&self.content_type);
        size += shortstr(&self.content_encoding);
        size += self.headers.as_ref().map_or(0, FieldTable::encoded_size);
        size += self.delivery_mode.map_or(0, |_| 1);
        size += self.priority.map_or(0, |_| 1);
        size += shortstr(&self.correlation_id);
        size += shortstr(&self.reply_to);
        size += shortstr(&self.expiration);
        size += shortstr(&self.message_id);
        size += self.timestamp.map_or(0, |_| 8);
        size += shortstr(&self.message_type);
        size += shortstr(&self.user_id);
        size += shortstr(&self.app_id);
        size += shortstr(&self.cluster_id);
        size
    }

    /// Writes the flag word and present fields into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            v.encode(dst);
        }
        if let Some(v) = &self.content_encoding {
            v.encode(dst);
        }
        if let Some(v) = &self.headers {
            v.encode(dst);
        }
        if let Some(v) = self.delivery_mode {
            dst.put_u8(v);
        }
        if let Some(v) = self.priority {
            dst.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            v.encode(dst);
        }
        if let Some(v) = &self.reply_to {
            v.encode(dst);
        }
        if let Some(v) = &self.expiration {
            v.encode(dst);
        }
        if let Some(v) = &self.message_id {
            v.encode(dst);
        }
        if let Some(v) = self.timestamp {
            dst.put_u64(v);
        }
        if let Some(v) = &self.message_type {
            v.encode(dst);
        }
        if let Some(v) = &self.user_id {
            v.encode(dst);
        }
        if let Some(v) = &self.app_id {
            v.encode(dst);
        }
        if let Some(v) = &self.cluster_id {
            v.encode(dst);
        }
    }

    /// Reads the flag word and the fields it announces from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        let flags = src.get_u16();
        if flags & FLAG_CONTINUATION != 0 {
            return Err(DecodeError::PropertyFlagContinuation);
        }

        let mut properties = Self::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            properties.content_type = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_HEADERS != 0 {
            properties.headers = Some(FieldTable::decode(src)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            ensure(src, 1)?;
            properties.delivery_mode = Some(src.get_u8());
        }
        if flags & FLAG_PRIORITY != 0 {
            ensure(src, 1)?;
            properties.priority = Some(src.get_u8());
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            properties.correlation_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            properties.reply_to = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            properties.expiration = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            properties.message_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            ensure(src, 8)?;
            properties.timestamp = Some(src.get_u64());
        }
        if flags & FLAG_TYPE != 0 {
            properties.message_type = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_USER_ID != 0 {
            properties.user_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_APP_ID != 0 {
            properties.app_id = Some(ShortString::decode(src)?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            properties.cluster_id = Some(ShortString::decode(src)?);
        }
        Ok(properties)
    }
}

/// A decoded content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Class the content belongs to; always the basic class here
    pub class_id: u16,

    /// Reserved weight field, zero on the wire
    pub weight: u16,

    /// Total size of the content body that follows, octets
    pub body_size: u64,

    /// The property list
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// A basic-class header declaring `body_size` octets of content.
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: CLASS_BASIC,
            weight: 0,
            body_size,
            properties,
        }
    }

    /// Octets occupied on the wire.
    pub fn encoded_size(&self) -> usize {
        2 + 2 + 8 + self.properties.encoded_size()
    }

    /// Writes the header payload into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.class_id);
        dst.put_u16(self.weight);
        dst.put_u64(self.body_size);
        self.properties.encode(dst);
    }

    /// Reads a header payload from `src`.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 12)?;
        let class_id = src.get_u16();
        let weight = src.get_u16();
        let body_size = src.get_u64();
        let properties = BasicProperties::decode(src)?;
        Ok(Self {
            class_id,
            weight,
            body_size,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::primitives::FieldValue;

    use super::*;

    fn shortstr(s: &str) -> ShortString {
        ShortString::new(s).unwrap()
    }

    #[test]
    fn empty_properties_are_a_bare_flag_word() {
        let properties = BasicProperties::default();
        let mut buf = BytesMut::new();
        properties.encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x00]);
        assert_eq!(properties.encoded_size(), 2);
    }

    #[test]
    fn properties_round_trip() {
        let mut headers = FieldTable::new();
        headers.insert(shortstr("x-origin"), FieldValue::LongString("test".into()));

        let properties = BasicProperties {
            content_type: Some(shortstr("application/json")),
            content_encoding: Some(shortstr("gzip")),
            headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(4),
            correlation_id: Some(shortstr("corr-1")),
            reply_to: Some(shortstr("reply-q")),
            expiration: Some(shortstr("60000")),
            message_id: Some(shortstr("msg-9")),
            timestamp: Some(1_700_000_000),
            message_type: Some(shortstr("event")),
            user_id: Some(shortstr("guest")),
            app_id: Some(shortstr("ferrumq-test")),
            cluster_id: None,
        };

        let mut buf = BytesMut::new();
        properties.encode(&mut buf);
        assert_eq!(buf.len(), properties.encoded_size());
        let decoded = BasicProperties::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, properties);
    }

    #[test]
    fn content_header_round_trip() {
        let header = ContentHeader::basic(
            1024,
            BasicProperties {
                delivery_mode: Some(1),
                ..Default::default()
            },
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.encoded_size());
        let decoded = ContentHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn continuation_bit_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0001);
        assert_eq!(
            BasicProperties::decode(&mut buf.freeze()),
            Err(DecodeError::PropertyFlagContinuation)
        );
    }
}
