//! Implements errors raised while decoding wire data

/// Error raised while decoding field primitives, method arguments or
/// content header properties.
///
/// A decode failure is always connection-fatal for the peer that produced
/// the bytes; the engine maps it to a framing error reply.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the announced length was reached
    #[error("Buffer ran out before {0} more octets")]
    Incomplete(usize),

    /// A short string or long string carried invalid UTF-8
    #[error("Invalid UTF-8 in string field")]
    BadUtf8,

    /// A field table value carried an unrecognised type tag
    #[error("Unknown field table value type {0:#04x}")]
    UnknownFieldType(u8),

    /// A nested length field exceeded the bytes remaining in its container
    #[error("Length field overruns its enclosing buffer")]
    LengthOverrun,

    /// The property flag word carried the continuation bit, which the
    /// basic class never uses
    #[error("Unexpected property flag continuation")]
    PropertyFlagContinuation,

    /// Trailing octets remained after all arguments were consumed
    #[error("{0} trailing octets after method arguments")]
    TrailingOctets(usize),
}

/// Checks that `src` still holds at least `needed` octets.
pub fn ensure(src: &impl bytes::Buf, needed: usize) -> Result<(), DecodeError> {
    if src.remaining() < needed {
        Err(DecodeError::Incomplete(needed - src.remaining()))
    } else {
        Ok(())
    }
}
