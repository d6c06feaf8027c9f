//! Implements the engine's error taxonomy
//!
//! Three scopes, matching what each can take down: a
//! [`ConnectionException`] closes the whole connection with a
//! `Connection.Close` reply, a [`ChannelException`] closes one channel
//! with a `Channel.Close` reply, and an [`EngineError`] tears the
//! transport down without an orderly handshake.

use ferrumq_types::reply_code::ReplyCode;

use crate::transport::TransportError;

/// A connection-fatal protocol violation.
///
/// The offending (class, method) pair is attached by the dispatcher,
/// which records it before invoking any handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Connection exception {reply_code}: {message}")]
pub struct ConnectionException {
    /// Reply code for the `Connection.Close` frame
    pub reply_code: ReplyCode,

    /// Human-readable reason
    pub message: String,
}

impl ConnectionException {
    /// Creates an exception with `reply_code` and `message`.
    pub fn new(reply_code: ReplyCode, message: impl Into<String>) -> Self {
        Self {
            reply_code,
            message: message.into(),
        }
    }

    /// The out-of-state method reply mandated for every event a state
    /// does not accept.
    pub fn command_invalid() -> Self {
        Self::new(ReplyCode::CommandInvalid, "Command Invalid")
    }
}

/// A channel-fatal protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Channel exception {reply_code}: {message}")]
pub struct ChannelException {
    /// Reply code for the `Channel.Close` frame
    pub reply_code: ReplyCode,

    /// Human-readable reason
    pub message: String,
}

impl ChannelException {
    /// Creates an exception with `reply_code` and `message`.
    pub fn new(reply_code: ReplyCode, message: impl Into<String>) -> Self {
        Self {
            reply_code,
            message: message.into(),
        }
    }
}

/// A transport-scoped runtime failure: the connection is torn down
/// without an orderly close handshake.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Socket or framing failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message store failed while the virtual host was unavailable
    #[error("Store failure: {0}")]
    Store(String),

    /// The peer never answered `Connection.Close` within the timeout
    #[error("Close-Ok was not received within the timeout")]
    CloseOkTimedOut,
}
