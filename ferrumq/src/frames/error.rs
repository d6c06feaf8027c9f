//! Implements framing errors

use ferrumq_types::DecodeError;

/// Error raised while decoding the frame envelope or a frame payload.
///
/// Every variant is connection-fatal: the engine answers with a framing
/// error close and tears the transport down.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// Socket failure surfaced through the codec
    #[error("IO error {0:?}")]
    Io(#[from] std::io::Error),

    /// The frame type octet is not method, header, body or heartbeat
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The announced payload size exceeds the negotiated maximum
    #[error("Frame payload of {size} octets exceeds the negotiated maximum of {max_frame_size}")]
    OversizedFrame {
        /// Announced payload size
        size: u32,
        /// Negotiated maximum frame size
        max_frame_size: u32,
    },

    /// The octet after the payload was not the 0xCE end marker
    #[error("Frame end marker missing, found {0:#04x}")]
    MissingFrameEnd(u8),

    /// A heartbeat frame arrived carrying payload octets
    #[error("Heartbeat frame with non-empty payload")]
    NonEmptyHeartbeat,

    /// A method or header payload failed to decode
    #[error(transparent)]
    Payload(#[from] DecodeError),
}
