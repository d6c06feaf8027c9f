//! Implements the outbound delivery encoder
//!
//! A delivery is a composite of a basic-class method, a content header
//! and body frames chunked to the negotiated frame size. When client and
//! store disagree about compression the encoder bridges: gzip content is
//! inflated for clients without compression support, and large plain
//! content is deflated for clients that advertise it.

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use ferrumq_types::constants::FRAME_OVERHEAD;
use ferrumq_types::methods::{BasicDeliver, BasicGetOk, BasicReturn, Method, MethodRegistry};
use ferrumq_types::primitives::ShortString;
use ferrumq_types::properties::ContentHeader;

use crate::frames::{AmqpFrame, FrameBody, FrameCodec};
use crate::message::StoredMessage;

/// The `content-encoding` value that marks compressed bodies.
pub const GZIP_ENCODING: &str = "gzip";

/// Which basic-class body fronts the delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryKind {
    /// `Basic.Deliver` to a consumer
    Deliver {
        /// Consumer tag the delivery is addressed to
        consumer_tag: ShortString,

        /// Channel-scoped delivery tag
        delivery_tag: u64,

        /// True when previously delivered
        redelivered: bool,
    },

    /// `Basic.Get-Ok` answering a synchronous get
    GetOk {
        /// Channel-scoped delivery tag
        delivery_tag: u64,

        /// True when previously delivered
        redelivered: bool,

        /// Messages left in the queue
        message_count: u32,
    },

    /// `Basic.Return` bouncing an unroutable message
    Return {
        /// Reply code explaining the bounce
        reply_code: u16,

        /// Human-readable reason
        reply_text: ShortString,
    },
}

/// An encoded delivery: the frames to write and the octets they occupy
/// on the wire.
#[derive(Debug)]
pub struct EncodedDelivery {
    /// Method, header and body frames in write order
    pub frames: Vec<AmqpFrame>,

    /// Total octets including frame overheads
    pub bytes_written: usize,
}

/// Per-connection delivery encoder, parameterised by the negotiated
/// frame size and the client's compression capability.
#[derive(Debug)]
pub struct DeliveryEncoder {
    registry: MethodRegistry,
    max_frame_size: u32,
    client_supports_compression: bool,
    compression_enabled: bool,
    compression_threshold: usize,
}

impl DeliveryEncoder {
    /// Creates an encoder.
    pub fn new(
        registry: MethodRegistry,
        max_frame_size: u32,
        client_supports_compression: bool,
        compression_enabled: bool,
        compression_threshold: usize,
    ) -> Self {
        Self {
            registry,
            max_frame_size,
            client_supports_compression,
            compression_enabled,
            compression_threshold,
        }
    }

    /// Updates the frame size bound after `Tune-Ok`.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    /// Largest body chunk a single frame can carry.
    fn max_chunk(&self) -> usize {
        self.max_frame_size as usize - FRAME_OVERHEAD
    }

    /// Builds the composite delivery for `message` on `channel`.
    ///
    /// The returned frames are written as one batch so the method,
    /// header and first chunk reach the socket together.
    pub fn write_delivery(
        &self,
        channel: u16,
        kind: DeliveryKind,
        message: &StoredMessage,
    ) -> EncodedDelivery {
        let (header, content) = self.bridge_compression(message);

        let publish_info = &message.metadata.publish_info;
        let method = match kind {
            DeliveryKind::Deliver {
                consumer_tag,
                delivery_tag,
                redelivered,
            } => Method::BasicDeliver(BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange: publish_info.exchange.clone(),
                routing_key: publish_info.routing_key.clone(),
            }),
            DeliveryKind::GetOk {
                delivery_tag,
                redelivered,
                message_count,
            } => Method::BasicGetOk(BasicGetOk {
                delivery_tag,
                redelivered,
                exchange: publish_info.exchange.clone(),
                routing_key: publish_info.routing_key.clone(),
                message_count,
            }),
            DeliveryKind::Return {
                reply_code,
                reply_text,
            } => Method::BasicReturn(BasicReturn {
                reply_code,
                reply_text,
                exchange: publish_info.exchange.clone(),
                routing_key: publish_info.routing_key.clone(),
            }),
        };

        let mut bytes_written = 0;
        let mut scratch = BytesMut::new();
        self.registry.encode(&method, &mut scratch);
        bytes_written += FrameCodec::encoded_frame_size(scratch.len());
        bytes_written += FrameCodec::encoded_frame_size(header.encoded_size());

        let mut frames = Vec::with_capacity(2 + content.len() / self.max_chunk().max(1));
        frames.push(AmqpFrame::method(channel, method));
        frames.push(AmqpFrame::new(channel, FrameBody::ContentHeader(header)));

        let mut rest = content;
        while !rest.is_empty() {
            let take = rest.len().min(self.max_chunk());
            let chunk = rest.split_to(take);
            bytes_written += FrameCodec::encoded_frame_size(chunk.len());
            frames.push(AmqpFrame::new(channel, FrameBody::ContentBody(chunk)));
        }

        EncodedDelivery {
            frames,
            bytes_written,
        }
    }

    /// Decides whether to inflate, deflate or pass content through, and
    /// produces the header to send. The stored header is never mutated;
    /// a bridged delivery sends a copy.
    fn bridge_compression(&self, message: &StoredMessage) -> (ContentHeader, Bytes) {
        let stored_header = &message.metadata.content_header;
        let gzipped = stored_header
            .properties
            .content_encoding
            .as_ref()
            .map(|encoding| encoding.as_str() == GZIP_ENCODING)
            .unwrap_or(false);

        if gzipped && !self.client_supports_compression {
            match inflate(&message.content) {
                Ok(inflated) => {
                    let mut header = stored_header.clone();
                    header.properties.content_encoding = None;
                    header.body_size = inflated.len() as u64;
                    return (header, inflated);
                }
                Err(error) => {
                    debug!(?error, "Inflation failed, passing gzip content through");
                }
            }
        } else if !gzipped
            && self.compression_enabled
            && self.client_supports_compression
            && stored_header.properties.content_encoding.is_none()
            && message.content.len() > self.compression_threshold
        {
            match deflate(&message.content) {
                Ok(deflated) => {
                    let mut header = stored_header.clone();
                    header.properties.content_encoding = ShortString::new(GZIP_ENCODING).ok();
                    header.body_size = deflated.len() as u64;
                    return (header, deflated);
                }
                Err(error) => {
                    debug!(?error, "Deflation failed, sending content uncompressed");
                }
            }
        }

        (stored_header.clone(), message.content.clone())
    }
}

/// Decompresses a gzip stream.
pub fn inflate(content: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(content);
    let mut inflated = Vec::new();
    decoder.read_to_end(&mut inflated)?;
    Ok(Bytes::from(inflated))
}

/// Compresses into a gzip stream.
pub fn deflate(content: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    Ok(Bytes::from(encoder.finish()?))
}

#[cfg(test)]
mod tests {
    use ferrumq_types::constants::MIN_FRAME_SIZE;
    use ferrumq_types::properties::BasicProperties;
    use ferrumq_types::ProtocolVersion;

    use crate::message::{MessageMetadata, MessagePublishInfo};

    use super::*;

    fn shortstr(s: &str) -> ShortString {
        ShortString::new(s).unwrap()
    }

    fn stored(content: Bytes, content_encoding: Option<&str>) -> StoredMessage {
        StoredMessage {
            metadata: MessageMetadata {
                publish_info: MessagePublishInfo {
                    exchange: shortstr("amq.direct"),
                    routing_key: shortstr("key"),
                    mandatory: false,
                    immediate: false,
                },
                content_header: ContentHeader::basic(
                    content.len() as u64,
                    BasicProperties {
                        content_encoding: content_encoding.map(|e| shortstr(e)),
                        ..Default::default()
                    },
                ),
                arrival_time: 0,
            },
            content,
        }
    }

    fn encoder(max_frame_size: u32, client_supports_compression: bool) -> DeliveryEncoder {
        DeliveryEncoder::new(
            MethodRegistry::new(ProtocolVersion::V0_9_1),
            max_frame_size,
            client_supports_compression,
            true,
            128,
        )
    }

    fn deliver_kind() -> DeliveryKind {
        DeliveryKind::Deliver {
            consumer_tag: shortstr("ctag"),
            delivery_tag: 1,
            redelivered: false,
        }
    }

    fn body_chunks(frames: &[AmqpFrame]) -> Vec<&Bytes> {
        frames
            .iter()
            .filter_map(|frame| match &frame.body {
                FrameBody::ContentBody(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chunk_count_matches_the_negotiated_frame_size() {
        let max = MIN_FRAME_SIZE;
        let chunk = max as usize - FRAME_OVERHEAD;
        // a client without compression support keeps bodies unchanged
        for body_size in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk + 17] {
            let message = stored(Bytes::from(vec![0x5A; body_size]), None);
            let encoded = encoder(max, false).write_delivery(1, deliver_kind(), &message);

            let chunks = body_chunks(&encoded.frames);
            assert_eq!(chunks.len(), body_size.div_ceil(chunk), "body_size {body_size}");
            assert_eq!(
                chunks.iter().map(|c| c.len()).sum::<usize>(),
                body_size,
                "body_size {body_size}"
            );
            assert!(chunks.iter().all(|c| c.len() <= chunk));
        }
    }

    #[test]
    fn bytes_written_accounts_for_every_frame() {
        let message = stored(Bytes::from_static(b"hello"), None);
        let encoded = encoder(MIN_FRAME_SIZE, false).write_delivery(1, deliver_kind(), &message);
        assert_eq!(encoded.frames.len(), 3);

        // re-encode through the frame codec and compare octet counts
        let mut codec = FrameCodec::new(MIN_FRAME_SIZE);
        let mut wire = BytesMut::new();
        for frame in &encoded.frames {
            use tokio_util::codec::Encoder;
            codec.encode(frame.clone(), &mut wire).unwrap();
        }
        assert_eq!(wire.len(), encoded.bytes_written);
    }

    #[test]
    fn gzip_content_is_inflated_for_legacy_clients() {
        let plain = b"Hello".as_slice();
        let message = stored(deflate(plain).unwrap(), Some(GZIP_ENCODING));
        let encoded = encoder(MIN_FRAME_SIZE, false).write_delivery(1, deliver_kind(), &message);

        let header = match &encoded.frames[1].body {
            FrameBody::ContentHeader(header) => header,
            other => panic!("expected header frame, got {other:?}"),
        };
        assert_eq!(header.properties.content_encoding, None);
        assert_eq!(header.body_size, plain.len() as u64);
        assert_eq!(&body_chunks(&encoded.frames)[0][..], plain);
    }

    #[test]
    fn large_plain_content_is_deflated_for_capable_clients() {
        let body = Bytes::from(vec![b'a'; 4096]);
        let message = stored(body.clone(), None);
        let encoded = encoder(MIN_FRAME_SIZE, true).write_delivery(1, deliver_kind(), &message);

        let header = match &encoded.frames[1].body {
            FrameBody::ContentHeader(header) => header,
            other => panic!("expected header frame, got {other:?}"),
        };
        assert_eq!(
            header.properties.content_encoding.as_ref().map(|e| e.as_str()),
            Some(GZIP_ENCODING)
        );
        let sent: Vec<u8> = body_chunks(&encoded.frames)
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        assert!(sent.len() < body.len());
        assert_eq!(inflate(&sent).unwrap(), body);
    }

    #[test]
    fn already_compressed_content_is_never_double_compressed() {
        let gzipped = deflate(&vec![b'a'; 4096]).unwrap();
        let message = stored(gzipped.clone(), Some(GZIP_ENCODING));
        let encoded = encoder(MIN_FRAME_SIZE, true).write_delivery(1, deliver_kind(), &message);

        let header = match &encoded.frames[1].body {
            FrameBody::ContentHeader(header) => header,
            other => panic!("expected header frame, got {other:?}"),
        };
        // the stored encoding is preserved, exactly once
        assert_eq!(
            header.properties.content_encoding.as_ref().map(|e| e.as_str()),
            Some(GZIP_ENCODING)
        );
        assert_eq!(
            body_chunks(&encoded.frames)
                .iter()
                .map(|c| c.len())
                .sum::<usize>(),
            gzipped.len()
        );
    }

    #[test]
    fn small_content_stays_uncompressed() {
        let message = stored(Bytes::from_static(b"tiny"), None);
        let encoded = encoder(MIN_FRAME_SIZE, true).write_delivery(1, deliver_kind(), &message);
        let header = match &encoded.frames[1].body {
            FrameBody::ContentHeader(header) => header,
            other => panic!("expected header frame, got {other:?}"),
        };
        assert_eq!(header.properties.content_encoding, None);
    }

    #[test]
    fn bodyless_delivery_is_a_method_header_pair() {
        let message = stored(Bytes::new(), None);
        let encoded = encoder(MIN_FRAME_SIZE, true).write_delivery(
            1,
            DeliveryKind::GetOk {
                delivery_tag: 9,
                redelivered: true,
                message_count: 4,
            },
            &message,
        );
        assert_eq!(encoded.frames.len(), 2);
    }
}
