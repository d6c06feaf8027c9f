//! Implements the durable per-message metadata envelope
//!
//! The layout is persisted by the message store and must remain stable:
//!
//! ```text
//! content_header_size : u32
//! content_header_body : bytes[content_header_size]
//! exchange            : short_string
//! routing_key         : short_string
//! flags               : u8   (bit0 mandatory, bit1 immediate)
//! arrival_time        : i64  (ms since epoch)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use ferrumq_types::error::ensure;
use ferrumq_types::primitives::ShortString;
use ferrumq_types::properties::ContentHeader;
use ferrumq_types::DecodeError;

const FLAG_MANDATORY: u8 = 1;
const FLAG_IMMEDIATE: u8 = 1 << 1;

/// Where and how a message was published.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePublishInfo {
    /// Exchange the message was published to
    pub exchange: ShortString,

    /// Routing key it was published with
    pub routing_key: ShortString,

    /// The publisher requires the message to be routable
    pub mandatory: bool,

    /// The publisher requires immediate consumption
    pub immediate: bool,
}

/// The durable metadata stored alongside a message body.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageMetadata {
    /// Publication coordinates
    pub publish_info: MessagePublishInfo,

    /// The content header received from the publisher
    pub content_header: ContentHeader,

    /// Arrival timestamp, milliseconds since the epoch
    pub arrival_time: i64,
}

impl MessageMetadata {
    /// Octets the encoded form occupies in the store.
    pub fn storable_size(&self) -> usize {
        self.content_header.encoded_size()
            + 4
            + self.publish_info.exchange.encoded_size()
            + self.publish_info.routing_key.encoded_size()
            + 1
            + 8
    }

    /// Writes the storage envelope into `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.content_header.encoded_size() as u32);
        self.content_header.encode(dst);
        self.publish_info.exchange.encode(dst);
        self.publish_info.routing_key.encode(dst);
        let mut flags = 0u8;
        if self.publish_info.mandatory {
            flags |= FLAG_MANDATORY;
        }
        if self.publish_info.immediate {
            flags |= FLAG_IMMEDIATE;
        }
        dst.put_u8(flags);
        dst.put_i64(self.arrival_time);
    }

    /// Encodes into a fresh buffer of exactly `storable_size` octets.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.storable_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Reads a storage envelope from `src`.
    ///
    /// A failure here is connection-scoped: the store handed back bytes
    /// this broker cannot interpret, and the surface tears the
    /// connection down.
    pub fn decode(src: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        let header_size = src.get_u32() as usize;
        if src.remaining() < header_size {
            return Err(DecodeError::LengthOverrun);
        }
        let mut header_bytes = src.copy_to_bytes(header_size);
        let content_header = ContentHeader::decode(&mut header_bytes)?;
        if header_bytes.has_remaining() {
            return Err(DecodeError::TrailingOctets(header_bytes.remaining()));
        }

        let exchange = ShortString::decode(src)?;
        let routing_key = ShortString::decode(src)?;
        ensure(src, 9)?;
        let flags = src.get_u8();
        let arrival_time = src.get_i64();

        Ok(Self {
            publish_info: MessagePublishInfo {
                exchange,
                routing_key,
                mandatory: flags & FLAG_MANDATORY != 0,
                immediate: flags & FLAG_IMMEDIATE != 0,
            },
            content_header,
            arrival_time,
        })
    }
}

/// A message resolved to its native 0-8/0-9 representation, ready for
/// delivery encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// The durable metadata
    pub metadata: MessageMetadata,

    /// The content body
    pub content: Bytes,
}
