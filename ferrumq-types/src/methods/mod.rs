//! Implements the method catalogue and the per-version registry that
//! decodes and encodes method frame payloads

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{CLASS_BASIC, CLASS_CHANNEL, CLASS_CONNECTION, CLASS_QUEUE};
use crate::error::{ensure, DecodeError};
use crate::version::ProtocolVersion;

mod basic;
mod channel;
mod connection;

pub use basic::{BasicDeliver, BasicGetOk, BasicReturn, QueueDeleteOk};
pub use channel::{ChannelClose, ChannelFlow, ChannelOpen, ChannelOpenOk};
pub use connection::{
    ConnectionClose, ConnectionOpen, ConnectionOpenOk, ConnectionSecure, ConnectionSecureOk,
    ConnectionStart, ConnectionStartOk, ConnectionTune,
};

const METHOD_CONNECTION_START: u16 = 10;
const METHOD_CONNECTION_START_OK: u16 = 11;
const METHOD_CONNECTION_SECURE: u16 = 20;
const METHOD_CONNECTION_SECURE_OK: u16 = 21;
const METHOD_CONNECTION_TUNE: u16 = 30;
const METHOD_CONNECTION_TUNE_OK: u16 = 31;
const METHOD_CONNECTION_OPEN: u16 = 40;
const METHOD_CONNECTION_OPEN_OK: u16 = 41;

const METHOD_CHANNEL_OPEN: u16 = 10;
const METHOD_CHANNEL_OPEN_OK: u16 = 11;
const METHOD_CHANNEL_FLOW: u16 = 20;
const METHOD_CHANNEL_FLOW_OK: u16 = 21;
const METHOD_CHANNEL_CLOSE: u16 = 40;
const METHOD_CHANNEL_CLOSE_OK: u16 = 41;

const METHOD_QUEUE_DELETE_OK: u16 = 41;

const METHOD_BASIC_RETURN: u16 = 50;
const METHOD_BASIC_DELIVER: u16 = 60;
const METHOD_BASIC_GET_OK: u16 = 71;

/// A decoded method frame payload.
///
/// The engine's catalogue covers the connection and channel lifecycle
/// plus the outbound delivery bodies; every other (class, method) pair is
/// carried opaquely as [`Method::Raw`] and interpreted by the channel it
/// is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// `Connection.Start`
    ConnectionStart(ConnectionStart),

    /// `Connection.Start-Ok`
    ConnectionStartOk(ConnectionStartOk),

    /// `Connection.Secure`
    ConnectionSecure(ConnectionSecure),

    /// `Connection.Secure-Ok`
    ConnectionSecureOk(ConnectionSecureOk),

    /// `Connection.Tune`
    ConnectionTune(ConnectionTune),

    /// `Connection.Tune-Ok`
    ConnectionTuneOk(ConnectionTune),

    /// `Connection.Open`
    ConnectionOpen(ConnectionOpen),

    /// `Connection.Open-Ok`
    ConnectionOpenOk(ConnectionOpenOk),

    /// `Connection.Close`
    ConnectionClose(ConnectionClose),

    /// `Connection.Close-Ok`
    ConnectionCloseOk,

    /// `Channel.Open`
    ChannelOpen(ChannelOpen),

    /// `Channel.Open-Ok`
    ChannelOpenOk(ChannelOpenOk),

    /// `Channel.Flow`
    ChannelFlow(ChannelFlow),

    /// `Channel.Flow-Ok`
    ChannelFlowOk(ChannelFlow),

    /// `Channel.Close`
    ChannelClose(ChannelClose),

    /// `Channel.Close-Ok`
    ChannelCloseOk,

    /// `Basic.Deliver`
    BasicDeliver(BasicDeliver),

    /// `Basic.Get-Ok`
    BasicGetOk(BasicGetOk),

    /// `Basic.Return`
    BasicReturn(BasicReturn),

    /// `Queue.Delete-Ok`
    QueueDeleteOk(QueueDeleteOk),

    /// Any method outside the engine's catalogue, forwarded opaquely
    Raw {
        /// Class id
        class_id: u16,

        /// Method id
        method_id: u16,

        /// Undecoded argument octets
        arguments: Bytes,
    },
}

impl Method {
    /// Class id of the method.
    pub fn class_id(&self) -> u16 {
        match self {
            Self::ConnectionStart(_)
            | Self::ConnectionStartOk(_)
            | Self::ConnectionSecure(_)
            | Self::ConnectionSecureOk(_)
            | Self::ConnectionTune(_)
            | Self::ConnectionTuneOk(_)
            | Self::ConnectionOpen(_)
            | Self::ConnectionOpenOk(_)
            | Self::ConnectionClose(_)
            | Self::ConnectionCloseOk => CLASS_CONNECTION,
            Self::ChannelOpen(_)
            | Self::ChannelOpenOk(_)
            | Self::ChannelFlow(_)
            | Self::ChannelFlowOk(_)
            | Self::ChannelClose(_)
            | Self::ChannelCloseOk => CLASS_CHANNEL,
            Self::BasicDeliver(_) | Self::BasicGetOk(_) | Self::BasicReturn(_) => CLASS_BASIC,
            Self::QueueDeleteOk(_) => CLASS_QUEUE,
            Self::Raw { class_id, .. } => *class_id,
        }
    }

    /// Method id under `version`. Only the connection-class close pair
    /// varies across versions.
    pub fn method_id(&self, version: ProtocolVersion) -> u16 {
        let (close_id, close_ok_id) = connection_close_ids(version);
        match self {
            Self::ConnectionStart(_) => METHOD_CONNECTION_START,
            Self::ConnectionStartOk(_) => METHOD_CONNECTION_START_OK,
            Self::ConnectionSecure(_) => METHOD_CONNECTION_SECURE,
            Self::ConnectionSecureOk(_) => METHOD_CONNECTION_SECURE_OK,
            Self::ConnectionTune(_) => METHOD_CONNECTION_TUNE,
            Self::ConnectionTuneOk(_) => METHOD_CONNECTION_TUNE_OK,
            Self::ConnectionOpen(_) => METHOD_CONNECTION_OPEN,
            Self::ConnectionOpenOk(_) => METHOD_CONNECTION_OPEN_OK,
            Self::ConnectionClose(_) => close_id,
            Self::ConnectionCloseOk => close_ok_id,
            Self::ChannelOpen(_) => METHOD_CHANNEL_OPEN,
            Self::ChannelOpenOk(_) => METHOD_CHANNEL_OPEN_OK,
            Self::ChannelFlow(_) => METHOD_CHANNEL_FLOW,
            Self::ChannelFlowOk(_) => METHOD_CHANNEL_FLOW_OK,
            Self::ChannelClose(_) => METHOD_CHANNEL_CLOSE,
            Self::ChannelCloseOk => METHOD_CHANNEL_CLOSE_OK,
            Self::BasicDeliver(_) => METHOD_BASIC_DELIVER,
            Self::BasicGetOk(_) => METHOD_BASIC_GET_OK,
            Self::BasicReturn(_) => METHOD_BASIC_RETURN,
            Self::QueueDeleteOk(_) => METHOD_QUEUE_DELETE_OK,
            Self::Raw { method_id, .. } => *method_id,
        }
    }
}

/// `Connection.Close` / `Close-Ok` method ids under `version`: AMQP 0-8
/// numbered them (60, 61); 0-9 and 0-9-1 renumbered to (50, 51).
pub fn connection_close_ids(version: ProtocolVersion) -> (u16, u16) {
    match version {
        ProtocolVersion::V0_8 => (60, 61),
        ProtocolVersion::V0_9 | ProtocolVersion::V0_9_1 => (50, 51),
    }
}

/// Decodes and encodes method payloads for one negotiated protocol
/// version.
///
/// One registry instance exists per connection, created when version
/// negotiation succeeds.
#[derive(Debug, Clone, Copy)]
pub struct MethodRegistry {
    version: ProtocolVersion,
}

impl MethodRegistry {
    /// Registry for `version`.
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    /// The version this registry serves.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Decodes a method frame payload: `class u16 || method u16 ||
    /// arguments`.
    ///
    /// Catalogue methods must consume their argument octets exactly;
    /// anything else in a known class is a decode error, while methods
    /// outside the catalogue pass through as [`Method::Raw`].
    pub fn decode(&self, src: &mut Bytes) -> Result<Method, DecodeError> {
        ensure(src, 4)?;
        let class_id = src.get_u16();
        let method_id = src.get_u16();
        self.decode_arguments(class_id, method_id, src)
    }

    fn decode_arguments(
        &self,
        class_id: u16,
        method_id: u16,
        src: &mut Bytes,
    ) -> Result<Method, DecodeError> {
        let (close_id, close_ok_id) = connection_close_ids(self.version);
        let key = packed_key(class_id, method_id);

        let method = match key {
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_START) => {
                Method::ConnectionStart(ConnectionStart::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_START_OK) => {
                Method::ConnectionStartOk(ConnectionStartOk::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_SECURE) => {
                Method::ConnectionSecure(ConnectionSecure::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_SECURE_OK) => {
                Method::ConnectionSecureOk(ConnectionSecureOk::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_TUNE) => {
                Method::ConnectionTune(ConnectionTune::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_TUNE_OK) => {
                Method::ConnectionTuneOk(ConnectionTune::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_OPEN) => {
                Method::ConnectionOpen(ConnectionOpen::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, METHOD_CONNECTION_OPEN_OK) => {
                Method::ConnectionOpenOk(ConnectionOpenOk::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, close_id) => {
                Method::ConnectionClose(ConnectionClose::decode(src)?)
            }
            k if k == packed_key(CLASS_CONNECTION, close_ok_id) => Method::ConnectionCloseOk,
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_OPEN) => {
                Method::ChannelOpen(ChannelOpen::decode(src)?)
            }
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_OPEN_OK) => {
                Method::ChannelOpenOk(ChannelOpenOk::decode(src)?)
            }
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_FLOW) => {
                Method::ChannelFlow(ChannelFlow::decode(src)?)
            }
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_FLOW_OK) => {
                Method::ChannelFlowOk(ChannelFlow::decode(src)?)
            }
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_CLOSE) => {
                Method::ChannelClose(ChannelClose::decode(src)?)
            }
            k if k == packed_key(CLASS_CHANNEL, METHOD_CHANNEL_CLOSE_OK) => Method::ChannelCloseOk,
            k if k == packed_key(CLASS_BASIC, METHOD_BASIC_DELIVER) => {
                Method::BasicDeliver(BasicDeliver::decode(src)?)
            }
            k if k == packed_key(CLASS_BASIC, METHOD_BASIC_GET_OK) => {
                Method::BasicGetOk(BasicGetOk::decode(src)?)
            }
            k if k == packed_key(CLASS_BASIC, METHOD_BASIC_RETURN) => {
                Method::BasicReturn(BasicReturn::decode(src)?)
            }
            k if k == packed_key(CLASS_QUEUE, METHOD_QUEUE_DELETE_OK) => {
                Method::QueueDeleteOk(QueueDeleteOk::decode(src)?)
            }
            _ => {
                let arguments = src.split_off(0);
                return Ok(Method::Raw {
                    class_id,
                    method_id,
                    arguments,
                });
            }
        };

        if src.has_remaining() {
            return Err(DecodeError::TrailingOctets(src.remaining()));
        }
        Ok(method)
    }

    /// Encodes a method into a frame payload: `class u16 || method u16 ||
    /// arguments`.
    pub fn encode(&self, method: &Method, dst: &mut BytesMut) {
        dst.put_u16(method.class_id());
        dst.put_u16(method.method_id(self.version));
        match method {
            Method::ConnectionStart(body) => body.encode(dst),
            Method::ConnectionStartOk(body) => body.encode(dst),
            Method::ConnectionSecure(body) => body.encode(dst),
            Method::ConnectionSecureOk(body) => body.encode(dst),
            Method::ConnectionTune(body) | Method::ConnectionTuneOk(body) => body.encode(dst),
            Method::ConnectionOpen(body) => body.encode(dst),
            Method::ConnectionOpenOk(body) => body.encode(dst),
            Method::ConnectionClose(body) => body.encode(dst),
            Method::ConnectionCloseOk => {}
            Method::ChannelOpen(body) => body.encode(dst),
            Method::ChannelOpenOk(body) => body.encode(dst),
            Method::ChannelFlow(body) | Method::ChannelFlowOk(body) => body.encode(dst),
            Method::ChannelClose(body) => body.encode(dst),
            Method::ChannelCloseOk => {}
            Method::BasicDeliver(body) => body.encode(dst),
            Method::BasicGetOk(body) => body.encode(dst),
            Method::BasicReturn(body) => body.encode(dst),
            Method::QueueDeleteOk(body) => body.encode(dst),
            Method::Raw { arguments, .. } => dst.put_slice(arguments),
        }
    }
}

fn packed_key(class_id: u16, method_id: u16) -> u32 {
    ((class_id as u32) << 16) | method_id as u32
}

#[cfg(test)]
mod tests {
    use crate::primitives::{FieldTable, FieldValue, ShortString};

    use super::*;

    fn shortstr(s: &str) -> ShortString {
        ShortString::new(s).unwrap()
    }

    fn round_trip(registry: &MethodRegistry, method: Method) -> Method {
        let mut buf = BytesMut::new();
        registry.encode(&method, &mut buf);
        registry.decode(&mut buf.freeze()).unwrap()
    }

    #[test]
    fn connection_start_round_trips() {
        let registry = MethodRegistry::new(ProtocolVersion::V0_9_1);
        let mut server_properties = FieldTable::new();
        server_properties.insert(shortstr("product"), FieldValue::LongString("ferrumq".into()));
        let method = Method::ConnectionStart(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties,
            mechanisms: "PLAIN ANONYMOUS".into(),
            locales: "en_US".into(),
        });
        assert_eq!(round_trip(&registry, method.clone()), method);
    }

    #[test]
    fn tune_and_open_round_trip() {
        let registry = MethodRegistry::new(ProtocolVersion::V0_9_1);
        let tune = Method::ConnectionTune(ConnectionTune {
            channel_max: 256,
            frame_max: 65536,
            heartbeat: 60,
        });
        assert_eq!(round_trip(&registry, tune.clone()), tune);

        let open = Method::ConnectionOpen(ConnectionOpen {
            virtual_host: shortstr("/"),
            capabilities: ShortString::default(),
            insist: false,
        });
        assert_eq!(round_trip(&registry, open.clone()), open);
    }

    #[test]
    fn connection_close_ids_follow_the_version() {
        let close = Method::ConnectionClose(ConnectionClose {
            reply_code: 320,
            reply_text: shortstr("shutting down"),
            class_id: 0,
            method_id: 0,
        });

        assert_eq!(close.method_id(ProtocolVersion::V0_8), 60);
        assert_eq!(close.method_id(ProtocolVersion::V0_9), 50);
        assert_eq!(close.method_id(ProtocolVersion::V0_9_1), 50);
        assert_eq!(Method::ConnectionCloseOk.method_id(ProtocolVersion::V0_8), 61);

        // A 0-8 registry must accept the 0-8 numbering and reproduce it
        let registry = MethodRegistry::new(ProtocolVersion::V0_8);
        let decoded = round_trip(&registry, close.clone());
        assert_eq!(decoded, close);

        let mut buf = BytesMut::new();
        registry.encode(&close, &mut buf);
        assert_eq!(&buf[..4], &[0x00, 0x0A, 0x00, 0x3C]);
    }

    #[test]
    fn basic_deliver_round_trips() {
        let registry = MethodRegistry::new(ProtocolVersion::V0_9_1);
        let method = Method::BasicDeliver(BasicDeliver {
            consumer_tag: shortstr("ctag-1"),
            delivery_tag: 7,
            redelivered: true,
            exchange: shortstr("amq.topic"),
            routing_key: shortstr("a.b.c"),
        });
        assert_eq!(round_trip(&registry, method.clone()), method);
    }

    #[test]
    fn uncatalogued_methods_pass_through_raw() {
        let registry = MethodRegistry::new(ProtocolVersion::V0_9_1);
        // Basic.Publish (60, 40) is not interpreted by the engine
        let mut buf = BytesMut::new();
        buf.put_u16(60);
        buf.put_u16(40);
        buf.put_slice(&[0x00, 0x00, 0x01, b'x']);
        let method = registry.decode(&mut buf.freeze()).unwrap();
        match method {
            Method::Raw {
                class_id,
                method_id,
                ref arguments,
            } => {
                assert_eq!((class_id, method_id), (60, 40));
                assert_eq!(&arguments[..], &[0x00, 0x00, 0x01, b'x']);
            }
            other => panic!("expected raw method, got {other:?}"),
        }
        // and it re-encodes byte-identically
        let mut out = BytesMut::new();
        registry.encode(&method, &mut out);
        assert_eq!(&out[..], &[0x00, 0x3C, 0x00, 0x28, 0x00, 0x00, 0x01, b'x']);
    }

    #[test]
    fn trailing_octets_fail_catalogue_decode() {
        let registry = MethodRegistry::new(ProtocolVersion::V0_9_1);
        let mut buf = BytesMut::new();
        registry.encode(
            &Method::ConnectionTuneOk(ConnectionTune {
                channel_max: 0,
                frame_max: 0,
                heartbeat: 0,
            }),
            &mut buf,
        );
        buf.put_u8(0xFF);
        assert_eq!(
            registry.decode(&mut buf.freeze()),
            Err(DecodeError::TrailingOctets(1))
        );
    }
}
