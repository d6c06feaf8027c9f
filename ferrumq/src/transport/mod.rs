//! Implements the framed transport over an accepted stream
//!
//! The transport is the codec plus the read-idle deadline: a `Stream` of
//! [`FrameInput`] events and a `Sink` of [`AmqpFrame`]s. Writes are
//! buffered by the underlying `Framed` and flushed explicitly by the
//! engine, which gives the deferred/batched flush the engine relies on.

use std::task::Poll;
use std::time::Duration;

use futures_util::{Future, Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use ferrumq_types::{ProtocolHeader, ProtocolVersion};

use crate::frames::{AmqpFrame, FrameCodec, FrameInput};
use crate::util::IdleTimeout;

mod error;
pub use error::TransportError;

pin_project! {
    /// Frame transport over any accepted byte stream.
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        framed: Framed<Io, FrameCodec>,

        #[pin]
        idle_timeout: Option<IdleTimeout>,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Binds to an accepted stream; the codec starts in
    /// protocol-initiation mode.
    pub fn bind(io: Io, max_frame_size: u32) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_frame_size)),
            idle_timeout: None,
        }
    }

    /// Selects the negotiated protocol version.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.framed.codec_mut().set_version(version);
    }

    /// Updates the inbound payload-size bound after `Tune-Ok`.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.framed.codec_mut().set_max_frame_size(max_frame_size);
    }

    /// Arms (or, with a zero duration, disarms) the read-idle deadline.
    pub fn set_read_idle_timeout(&mut self, duration: Duration) {
        self.idle_timeout = if duration.is_zero() {
            None
        } else {
            Some(IdleTimeout::new(duration))
        };
    }

    /// Queues the raw 8-octet protocol header for writing. Used for the
    /// version-mismatch reply, which is not a frame.
    pub fn send_protocol_header(&mut self, header: ProtocolHeader) {
        let octets: [u8; 8] = header.into();
        self.framed.write_buffer_mut().extend_from_slice(&octets);
    }

    /// Consumes the transport, returning the underlying stream.
    pub fn into_inner(self) -> Io {
        self.framed.into_inner()
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<FrameInput, TransportError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed.poll_next(cx) {
            Poll::Ready(next) => {
                if let Some(mut delay) = this.idle_timeout.as_pin_mut() {
                    delay.reset();
                }
                // socket failures keep their own identity instead of
                // masquerading as framing violations
                Poll::Ready(next.map(|item| item.map_err(map_codec_error)))
            }
            Poll::Pending => {
                if let Some(delay) = this.idle_timeout.as_pin_mut() {
                    match delay.poll(cx) {
                        Poll::Ready(_elapsed) => {
                            return Poll::Ready(Some(Err(TransportError::IdleTimeoutElapsed)))
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Poll::Pending
            }
        }
    }
}

fn map_codec_error(error: crate::frames::FrameDecodeError) -> TransportError {
    match error {
        crate::frames::FrameDecodeError::Io(io) => TransportError::Io(io),
        other => TransportError::FrameDecode(other),
    }
}

impl<Io> Sink<AmqpFrame> for Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_ready(cx).map_err(map_codec_error)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: AmqpFrame) -> Result<(), Self::Error> {
        self.project().framed.start_send(item).map_err(map_codec_error)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_flush(cx).map_err(map_codec_error)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed.poll_close(cx).map_err(map_codec_error)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_test::io::Builder;

    use ferrumq_types::constants::MIN_FRAME_SIZE;
    use ferrumq_types::methods::{ConnectionTune, Method};

    use super::*;

    #[tokio::test]
    async fn protocol_initiation_then_frames() {
        let mock = Builder::new()
            .read(b"AMQP\x00\x00\x09\x01")
            // Connection.Tune-Ok(0, 0, 0): 12 payload octets
            .read(&[
                1, 0, 0, 0, 0, 0, 12, 0, 10, 0, 31, 0, 0, 0, 0, 0, 0, 0, 0, 0xCE,
            ])
            .build();

        let mut transport = Transport::bind(mock, MIN_FRAME_SIZE);
        let initiation = transport.next().await.unwrap().unwrap();
        assert_eq!(
            initiation,
            FrameInput::ProtocolInitiation(Ok(ProtocolVersion::V0_9_1))
        );

        let frame = transport.next().await.unwrap().unwrap();
        assert_eq!(
            frame,
            FrameInput::Frame(AmqpFrame::method(
                0,
                Method::ConnectionTuneOk(ConnectionTune {
                    channel_max: 0,
                    frame_max: 0,
                    heartbeat: 0,
                })
            ))
        );
    }

    #[tokio::test]
    async fn heartbeat_write_is_wire_exact() {
        let mock = Builder::new()
            .write(&[8, 0, 0, 0, 0, 0, 0, 0xCE])
            .build();
        let mut transport = Transport::bind(mock, MIN_FRAME_SIZE);
        transport.send(AmqpFrame::heartbeat()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn read_idle_deadline_fires() {
        let mock = Builder::new()
            .wait(Duration::from_secs(60))
            .read(b"AMQP\x00\x00\x09\x01")
            .build();
        let mut transport = Transport::bind(mock, MIN_FRAME_SIZE);
        transport.set_read_idle_timeout(Duration::from_secs(2));

        match transport.next().await.unwrap() {
            Err(TransportError::IdleTimeoutElapsed) => {}
            other => panic!("expected idle timeout, got {other:?}"),
        }
    }
}
