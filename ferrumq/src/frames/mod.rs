//! Implements the frame envelope encoder and decoder

mod codec;
mod error;

pub use codec::{FrameCodec, FrameInput};
pub use error::FrameDecodeError;

use bytes::Bytes;
use ferrumq_types::methods::Method;
use ferrumq_types::properties::ContentHeader;

/// A decoded frame: the 16-bit channel it rides on and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpFrame {
    /// Channel number; zero is the connection's own channel
    pub channel: u16,

    /// The frame payload
    pub body: FrameBody,
}

impl AmqpFrame {
    /// Creates a frame.
    pub fn new(channel: u16, body: FrameBody) -> Self {
        Self { channel, body }
    }

    /// A method frame.
    pub fn method(channel: u16, method: Method) -> Self {
        Self::new(channel, FrameBody::Method(method))
    }

    /// The heartbeat frame; always on channel zero.
    pub fn heartbeat() -> Self {
        Self::new(0, FrameBody::Heartbeat)
    }
}

/// Frame payload variants, one per wire frame type.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Type 1: a decoded method
    Method(Method),

    /// Type 2: a content header announcing body octets to follow
    ContentHeader(ContentHeader),

    /// Type 3: a slice of content body
    ContentBody(Bytes),

    /// Type 8: an empty liveness probe
    Heartbeat,
}
