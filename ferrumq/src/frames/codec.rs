//! Frame envelope codec: octets to [`FrameInput`] events and back

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use ferrumq_types::constants::{
    FRAME_CONTENT_BODY, FRAME_CONTENT_HEADER, FRAME_END, FRAME_HEADER_SIZE, FRAME_HEARTBEAT,
    FRAME_METHOD, FRAME_OVERHEAD, MIN_FRAME_SIZE,
};
use ferrumq_types::methods::MethodRegistry;
use ferrumq_types::properties::ContentHeader;
use ferrumq_types::{ProtocolHeader, ProtocolVersion};

use super::{AmqpFrame, FrameBody, FrameDecodeError};

/// One unit of decoded inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameInput {
    /// The 8-octet protocol header that opens the connection. `Err`
    /// carries the raw octets when the header is not an `AMQP` header
    /// for a supported version; the engine replies with its latest
    /// supported header and closes.
    ProtocolInitiation(Result<ProtocolVersion, [u8; 8]>),

    /// A regular frame.
    Frame(AmqpFrame),
}

#[derive(Debug)]
enum DecoderState {
    /// Expecting the 8-octet protocol header
    ProtocolInitiation,

    /// Expecting a frame header
    FrameHeader,

    /// Frame header consumed; expecting `size` payload octets plus the
    /// end marker
    FramePayload { kind: u8, channel: u16, size: u32 },
}

/// Stateful encoder/decoder of the frame envelope.
///
/// Starts in protocol-initiation mode; after the first 8 octets every
/// subsequent octet is framed traffic. The engine mutates the negotiated
/// version and maximum frame size after `Tune-Ok`.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecoderState,
    registry: MethodRegistry,
    max_frame_size: u32,
}

impl FrameCodec {
    /// A codec in protocol-initiation mode accepting frames up to
    /// `max_frame_size` octets of payload.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            state: DecoderState::ProtocolInitiation,
            registry: MethodRegistry::new(ProtocolVersion::latest()),
            max_frame_size,
        }
    }

    /// A codec already past protocol initiation, decoding framed
    /// traffic for `version`.
    pub fn framed(max_frame_size: u32, version: ProtocolVersion) -> Self {
        Self {
            state: DecoderState::FrameHeader,
            registry: MethodRegistry::new(version),
            max_frame_size,
        }
    }

    /// The negotiated protocol version currently decoded against.
    pub fn version(&self) -> ProtocolVersion {
        self.registry.version()
    }

    /// Selects the method registry for `version`; called when protocol
    /// initiation succeeds.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.registry = MethodRegistry::new(version);
    }

    /// The current inbound payload-size bound.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Updates the payload-size bound; called after `Tune-Ok`.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size.max(MIN_FRAME_SIZE);
    }

    /// Total octets frame overhead adds around a payload.
    pub fn encoded_frame_size(payload_len: usize) -> usize {
        payload_len + FRAME_OVERHEAD
    }

    fn decode_payload(
        &mut self,
        kind: u8,
        channel: u16,
        mut payload: Bytes,
    ) -> Result<AmqpFrame, FrameDecodeError> {
        let body = match kind {
            FRAME_METHOD => FrameBody::Method(self.registry.decode(&mut payload)?),
            FRAME_CONTENT_HEADER => FrameBody::ContentHeader(ContentHeader::decode(&mut payload)?),
            FRAME_CONTENT_BODY => FrameBody::ContentBody(payload),
            FRAME_HEARTBEAT => {
                if !payload.is_empty() {
                    return Err(FrameDecodeError::NonEmptyHeartbeat);
                }
                FrameBody::Heartbeat
            }
            other => return Err(FrameDecodeError::UnknownFrameType(other)),
        };
        Ok(AmqpFrame { channel, body })
    }
}

impl Decoder for FrameCodec {
    type Item = FrameInput;
    type Error = FrameDecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecoderState::ProtocolInitiation => {
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    let mut octets = [0u8; 8];
                    octets.copy_from_slice(&src.split_to(8));
                    self.state = DecoderState::FrameHeader;
                    let result = ProtocolHeader::try_from(octets)
                        .ok()
                        .and_then(|header| header.version())
                        .ok_or(octets);
                    return Ok(Some(FrameInput::ProtocolInitiation(result)));
                }
                DecoderState::FrameHeader => {
                    if src.len() < FRAME_HEADER_SIZE {
                        return Ok(None);
                    }
                    let kind = src[0];
                    let channel = u16::from_be_bytes([src[1], src[2]]);
                    let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);
                    if size > self.max_frame_size {
                        return Err(FrameDecodeError::OversizedFrame {
                            size,
                            max_frame_size: self.max_frame_size,
                        });
                    }
                    src.advance(FRAME_HEADER_SIZE);
                    self.state = DecoderState::FramePayload {
                        kind,
                        channel,
                        size,
                    };
                }
                DecoderState::FramePayload {
                    kind,
                    channel,
                    size,
                } => {
                    let needed = size as usize + 1;
                    if src.len() < needed {
                        src.reserve(needed - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(size as usize).freeze();
                    let marker = src.get_u8();
                    if marker != FRAME_END {
                        return Err(FrameDecodeError::MissingFrameEnd(marker));
                    }
                    self.state = DecoderState::FrameHeader;
                    let frame = self.decode_payload(kind, channel, payload)?;
                    return Ok(Some(FrameInput::Frame(frame)));
                }
            }
        }
    }
}

impl Encoder<AmqpFrame> for FrameCodec {
    type Error = FrameDecodeError;

    fn encode(&mut self, item: AmqpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match item.body {
            FrameBody::Method(method) => {
                let mut payload = BytesMut::new();
                self.registry.encode(&method, &mut payload);
                (FRAME_METHOD, payload.freeze())
            }
            FrameBody::ContentHeader(header) => {
                let mut payload = BytesMut::with_capacity(header.encoded_size());
                header.encode(&mut payload);
                (FRAME_CONTENT_HEADER, payload.freeze())
            }
            FrameBody::ContentBody(payload) => (FRAME_CONTENT_BODY, payload),
            FrameBody::Heartbeat => (FRAME_HEARTBEAT, Bytes::new()),
        };

        dst.reserve(Self::encoded_frame_size(payload.len()));
        dst.put_u8(kind);
        dst.put_u16(item.channel);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ferrumq_types::methods::{ConnectionTune, Method};
    use ferrumq_types::properties::BasicProperties;

    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::framed(MIN_FRAME_SIZE, ProtocolVersion::latest())
    }

    #[test]
    fn protocol_initiation_is_consumed_first() {
        let mut codec = FrameCodec::new(MIN_FRAME_SIZE);
        let mut src = BytesMut::from(&b"AMQP\x00\x00\x09\x01"[..]);
        let input = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            input,
            FrameInput::ProtocolInitiation(Ok(ProtocolVersion::V0_9_1))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn unsupported_initiation_carries_the_octets() {
        let mut codec = FrameCodec::new(MIN_FRAME_SIZE);
        let mut src = BytesMut::from(&b"AMQP\x00\x00\x0a\x00"[..]);
        let input = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            input,
            FrameInput::ProtocolInitiation(Err(*b"AMQP\x00\x00\x0a\x00"))
        );
    }

    #[test]
    fn partial_initiation_waits_for_more_octets() {
        let mut codec = FrameCodec::new(MIN_FRAME_SIZE);
        let mut src = BytesMut::from(&b"AMQ"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn frame_round_trip() {
        let mut codec = codec();
        let frame = AmqpFrame::method(
            0,
            Method::ConnectionTuneOk(ConnectionTune {
                channel_max: 256,
                frame_max: 65536,
                heartbeat: 60,
            }),
        );

        let mut wire = BytesMut::new();
        codec.encode(frame.clone(), &mut wire).unwrap();
        assert_eq!(*wire.last().unwrap(), FRAME_END);

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, FrameInput::Frame(frame));
    }

    #[test]
    fn content_frames_round_trip_with_channel_preserved() {
        let mut codec = codec();
        let header = AmqpFrame::new(
            3,
            FrameBody::ContentHeader(ContentHeader::basic(5, BasicProperties::default())),
        );
        let body = AmqpFrame::new(3, FrameBody::ContentBody(Bytes::from_static(b"Hello")));

        let mut wire = BytesMut::new();
        codec.encode(header.clone(), &mut wire).unwrap();
        codec.encode(body.clone(), &mut wire).unwrap();

        assert_eq!(codec.decode(&mut wire).unwrap(), Some(FrameInput::Frame(header)));
        assert_eq!(codec.decode(&mut wire).unwrap(), Some(FrameInput::Frame(body)));
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn heartbeat_round_trip() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        codec.encode(AmqpFrame::heartbeat(), &mut wire).unwrap();
        assert_eq!(&wire[..], &[8, 0, 0, 0, 0, 0, 0, FRAME_END]);
        assert_eq!(
            codec.decode(&mut wire).unwrap(),
            Some(FrameInput::Frame(AmqpFrame::heartbeat()))
        );
    }

    #[test]
    fn oversized_payload_is_a_framing_error() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        wire.put_u8(FRAME_CONTENT_BODY);
        wire.put_u16(1);
        wire.put_u32(MIN_FRAME_SIZE + 1);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(FrameDecodeError::OversizedFrame { size, .. }) if size == MIN_FRAME_SIZE + 1
        ));
    }

    #[test]
    fn missing_end_marker_is_a_framing_error() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        wire.put_u8(FRAME_HEARTBEAT);
        wire.put_u16(0);
        wire.put_u32(0);
        wire.put_u8(0x00); // should be 0xCE
        assert!(matches!(
            codec.decode(&mut wire),
            Err(FrameDecodeError::MissingFrameEnd(0x00))
        ));
    }

    #[test]
    fn unknown_frame_type_is_a_framing_error() {
        let mut codec = codec();
        let mut wire = BytesMut::new();
        wire.put_u8(9);
        wire.put_u16(0);
        wire.put_u32(0);
        wire.put_u8(FRAME_END);
        assert!(matches!(
            codec.decode(&mut wire),
            Err(FrameDecodeError::UnknownFrameType(9))
        ));
    }

    #[test]
    fn split_frame_is_reassembled_across_reads() {
        let mut codec = codec();
        let mut whole = BytesMut::new();
        codec
            .encode(
                AmqpFrame::new(2, FrameBody::ContentBody(Bytes::from_static(b"abcdef"))),
                &mut whole,
            )
            .unwrap();

        let mut first = BytesMut::from(&whole[..5]);
        assert!(codec.decode(&mut first).unwrap().is_none());
        first.extend_from_slice(&whole[5..]);
        let decoded = codec.decode(&mut first).unwrap().unwrap();
        match decoded {
            FrameInput::Frame(AmqpFrame {
                channel: 2,
                body: FrameBody::ContentBody(bytes),
            }) => assert_eq!(&bytes[..], b"abcdef"),
            other => panic!("unexpected input {other:?}"),
        }
    }
}
