//! Channel-class method bodies

use bytes::{Buf, BufMut, Bytes};

use crate::error::{ensure, DecodeError};
use crate::primitives::{LongString, ShortString};

/// `Channel.Open` — the client creates a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOpen {
    /// Reserved out-of-band settings string
    pub out_of_band: ShortString,
}

impl ChannelOpen {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.out_of_band.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            out_of_band: ShortString::decode(src)?,
        })
    }
}

/// `Channel.Open-Ok`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOpenOk {
    /// Reserved channel id string (absent on 0-8, empty on 0-9-1)
    pub channel_id: LongString,
}

impl ChannelOpenOk {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        self.channel_id.encode(dst);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            channel_id: LongString::decode(src)?,
        })
    }
}

/// `Channel.Flow` / `Channel.Flow-Ok` — both carry a single active bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFlow {
    /// True starts delivery, false pauses it
    pub active: bool,
}

impl ChannelFlow {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.active as u8);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 1)?;
        Ok(Self {
            active: src.get_u8() & 1 != 0,
        })
    }
}

/// `Channel.Close` — either peer closes a channel, citing the method
/// that provoked it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelClose {
    /// Reply code
    pub reply_code: u16,

    /// Human-readable reason
    pub reply_text: ShortString,

    /// Class id of the offending method, zero when none
    pub class_id: u16,

    /// Method id of the offending method, zero when none
    pub method_id: u16,
}

impl ChannelClose {
    pub(crate) fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.reply_code);
        self.reply_text.encode(dst);
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
    }

    pub(crate) fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure(src, 2)?;
        let reply_code = src.get_u16();
        let reply_text = ShortString::decode(src)?;
        ensure(src, 4)?;
        Ok(Self {
            reply_code,
            reply_text,
            class_id: src.get_u16(),
            method_id: src.get_u16(),
        })
    }
}
