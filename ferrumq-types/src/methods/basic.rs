//! Basic-class method bodies emitted on the delivery path

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ensure, DecodeError};
use crate::primitives::ShortString;

/// `Basic.Deliver` — pushes a message to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicDeliver {
    /// Tag of the consumer the message is for
    pub consumer_tag: ShortString,

    /// Server-assigned delivery tag, scoped to the channel
    pub delivery_tag: u64,

    /// True when the message was delivered before
    pub redelivered: bool,

    /// Exchange the message was published to
    pub exchange: ShortString,

    /// Routing key the message was published with
    pub routing_key: ShortString,
}

impl BasicDeliver {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.consumer_tag.encode(dst);
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.redelivered as u8);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let consumer_tag = ShortString::decode(src)?;
        ensure(src, 9)?;
        let delivery_tag = src.get_u64();
        let redelivered = src.get_u8() & 1 != 0;
        Ok(Self {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
        })
    }
}

/// `Basic.Get-Ok` — answers a synchronous `Basic.Get` with a message.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicGetOk {
    /// Server-assigned delivery tag, scoped to the channel
    pub delivery_tag: u64,

    /// True when the message was delivered before
    pub redelivered: bool,

    /// Exchange the message was published to
    pub exchange: ShortString,

    /// Routing key the message was published with
    pub routing_key: ShortString,

    /// Messages remaining in the queue
    pub message_count: u32,
}

impl BasicGetOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64(self.delivery_tag);
        dst.put_u8(self.redelivered as u8);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
        dst.put_u32(self.message_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 9)?;
        let delivery_tag = src.get_u64();
        let redelivered = src.get_u8() & 1 != 0;
        let exchange = ShortString::decode(src)?;
        let routing_key = ShortString::decode(src)?;
        ensure(src, 4)?;
        Ok(Self {
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
            message_count: src.get_u32(),
        })
    }
}

/// `Basic.Return` — bounces an unroutable mandatory or immediate message
/// back to its publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicReturn {
    /// Reply code explaining the bounce
    pub reply_code: u16,

    /// Human-readable reason
    pub reply_text: ShortString,

    /// Exchange the message was published to
    pub exchange: ShortString,

    /// Routing key the message was published with
    pub routing_key: ShortString,
}

impl BasicReturn {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.reply_code);
        self.reply_text.encode(dst);
        self.exchange.encode(dst);
        self.routing_key.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        Ok(Self {
            reply_code: src.get_u16(),
            reply_text: ShortString::decode(src)?,
            exchange: ShortString::decode(src)?,
            routing_key: ShortString::decode(src)?,
        })
    }
}

/// `Queue.Delete-Ok` — confirms a queue deletion.
///
/// Lives in the engine's catalogue because a compatibility knob forces it
/// to be sent even when the client set `nowait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDeleteOk {
    /// Messages discarded with the queue
    pub message_count: u32,
}

impl QueueDeleteOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.message_count);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 4)?;
        Ok(Self {
            message_count: src.get_u32(),
        })
    }
}
