//! Implements the reply codes carried by `Connection.Close` and
//! `Channel.Close`

use std::fmt;

/// A protocol reply code.
///
/// Soft errors (channel scope) close the channel they occurred on; hard
/// errors (connection scope) close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    /// Operation completed successfully; used on orderly close
    ReplySuccess,

    /// An operator closed the connection
    ConnectionForced,

    /// The requested path was malformed
    InvalidPath,

    /// The client lacks permission for the resource
    AccessRefused,

    /// The named entity does not exist
    NotFound,

    /// Another client holds an exclusive lock on the resource
    ResourceLocked,

    /// A precondition on the request failed
    PreconditionFailed,

    /// A malformed frame was received
    FrameError,

    /// A method argument failed to decode
    SyntaxError,

    /// A method arrived in a state where it is not legal
    CommandInvalid,

    /// A channel id was invalid, already in use or out of range
    ChannelError,

    /// A frame type arrived that the peer cannot accept now
    UnexpectedFrame,

    /// The peer ran out of a resource servicing the request
    ResourceError,

    /// The request violates a server policy
    NotAllowed,

    /// The method is valid but not implemented by this peer
    NotImplemented,

    /// The server failed internally
    InternalError,
}

impl ReplyCode {
    /// Numeric wire value.
    pub fn value(&self) -> u16 {
        match self {
            Self::ReplySuccess => 200,
            Self::ConnectionForced => 320,
            Self::InvalidPath => 402,
            Self::AccessRefused => 403,
            Self::NotFound => 404,
            Self::ResourceLocked => 405,
            Self::PreconditionFailed => 406,
            Self::FrameError => 501,
            Self::SyntaxError => 502,
            Self::CommandInvalid => 503,
            Self::ChannelError => 504,
            Self::UnexpectedFrame => 505,
            Self::ResourceError => 506,
            Self::NotAllowed => 530,
            Self::NotImplemented => 540,
            Self::InternalError => 541,
        }
    }

    /// Maps a wire value back to the reply code, if known.
    pub fn from_value(value: u16) -> Option<Self> {
        let code = match value {
            200 => Self::ReplySuccess,
            320 => Self::ConnectionForced,
            402 => Self::InvalidPath,
            403 => Self::AccessRefused,
            404 => Self::NotFound,
            405 => Self::ResourceLocked,
            406 => Self::PreconditionFailed,
            501 => Self::FrameError,
            502 => Self::SyntaxError,
            503 => Self::CommandInvalid,
            504 => Self::ChannelError,
            505 => Self::UnexpectedFrame,
            506 => Self::ResourceError,
            530 => Self::NotAllowed,
            540 => Self::NotImplemented,
            541 => Self::InternalError,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
