//! Implements transport-level errors

use std::io;

use crate::frames::FrameDecodeError;

/// Error raised by the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket-level failure
    #[error("IO error {0:?}")]
    Io(#[from] io::Error),

    /// The inbound octet stream violated the framing rules
    #[error(transparent)]
    FrameDecode(#[from] FrameDecodeError),

    /// No traffic arrived within the read-idle deadline
    #[error("Read-idle timeout elapsed")]
    IdleTimeoutElapsed,
}
