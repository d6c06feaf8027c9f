//! Protocol-defined constants shared by the codec and the engine

/// The IANA assigned port number for AMQP over TCP.
pub const PORT: u16 = 5672;

/// The IANA assigned port number for AMQP over TLS (amqps).
pub const SECURE_PORT: u16 = 5671;

/// Frame type octet of a method frame.
pub const FRAME_METHOD: u8 = 1;

/// Frame type octet of a content header frame.
pub const FRAME_CONTENT_HEADER: u8 = 2;

/// Frame type octet of a content body frame.
pub const FRAME_CONTENT_BODY: u8 = 3;

/// Frame type octet of a heartbeat frame.
pub const FRAME_HEARTBEAT: u8 = 8;

/// The octet terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Size of the frame header preceding the payload: type (1) + channel (2)
/// + payload size (4).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Octets surrounding every frame payload: the 7-octet header plus the
/// end marker.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// The lower bound a peer may negotiate for the maximum frame size.
/// Both peers MUST accept frames of up to this size before tuning
/// completes.
pub const MIN_FRAME_SIZE: u32 = 4096;

/// Class id of the connection class.
pub const CLASS_CONNECTION: u16 = 10;

/// Class id of the channel class.
pub const CLASS_CHANNEL: u16 = 20;

/// Class id of the queue class.
pub const CLASS_QUEUE: u16 = 50;

/// Class id of the basic class.
pub const CLASS_BASIC: u16 = 60;
