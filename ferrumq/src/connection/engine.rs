//! Implements the connection event loop
//!
//! One engine per accepted socket. All decoding, state transitions,
//! frame writes and the pending-work drain happen on this task; other
//! tasks hand work over through the [`WorkNotifier`].

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use ferrumq_types::constants::MIN_FRAME_SIZE;

use crate::channel::AmqpChannel;
use crate::contract::ConnectionContext;
use crate::error::EngineError;
use crate::frames::AmqpFrame;
use crate::logging;
use crate::notify::WorkNotifier;
use crate::transport::{Transport, TransportError};
use crate::util::Running;

use super::heartbeat::HeartBeat;
use super::{AmqpConnection, ConnectionState, IoDirective, CLOSE_OK_TIMEOUT};

const HOUSEKEEPING_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Drives one [`AmqpConnection`] over a socket.
pub struct ConnectionEngine<Io> {
    transport: Transport<Io>,
    connection: AmqpConnection,
    notifier: Arc<WorkNotifier<AmqpConnection>>,
    wakeup: Arc<tokio::sync::Notify>,
    heartbeat: HeartBeat,
    close_deadline: Option<tokio::time::Instant>,
}

impl<Io> std::fmt::Debug for ConnectionEngine<Io> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("connection", &self.connection)
            .finish()
    }
}

impl<Io> ConnectionEngine<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Binds an engine to an accepted stream.
    ///
    /// Until tuning completes both peers are bound to frames of
    /// [`MIN_FRAME_SIZE`] octets.
    pub fn new(io: Io, context: ConnectionContext) -> Self {
        let notifier = Arc::new(WorkNotifier::new());
        let wakeup = Arc::new(tokio::sync::Notify::new());
        {
            let wakeup = Arc::clone(&wakeup);
            notifier.set_work_listener(Box::new(move || wakeup.notify_one()));
        }
        Self {
            transport: Transport::bind(io, MIN_FRAME_SIZE),
            connection: AmqpConnection::new(context),
            notifier,
            wakeup,
            heartbeat: HeartBeat::never(),
            close_deadline: None,
        }
    }

    /// The notifier producers use to hand work onto this engine.
    pub fn notifier(&self) -> Arc<WorkNotifier<AmqpConnection>> {
        Arc::clone(&self.notifier)
    }

    /// The sans-IO endpoint, for inspection.
    pub fn connection(&self) -> &AmqpConnection {
        &self.connection
    }

    /// Spawns the event loop on the runtime.
    pub fn spawn(self) -> JoinHandle<Result<(), EngineError>> {
        tokio::spawn(self.event_loop())
    }

    /// Runs the connection to completion.
    #[instrument(name = "Connection::event_loop", skip(self), fields(remote_addr = %self.connection.remote_addr()))]
    pub async fn event_loop(mut self) -> Result<(), EngineError> {
        self.notifier.bind_io_task();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut outcome = Ok(());
        loop {
            let result = tokio::select! {
                incoming = self.transport.next() => self.on_incoming(incoming).await,
                Some(()) = self.heartbeat.next() => self.on_heartbeat().await,
                _ = self.wakeup.notified() => self.on_work().await,
                _ = housekeeping.tick() => self.on_housekeeping().await,
            };

            let running = match result {
                Ok(running) => running,
                Err(error) => {
                    error!(?error, "Engine error");
                    self.connection.transport_failed();
                    outcome = Err(error);
                    Running::Stop
                }
            };

            match running {
                Running::Continue => {}
                Running::Stop => break,
            }
        }

        debug!("Stopped");
        outcome
    }

    /// Handles inbound traffic. Frames already buffered by the
    /// transport are drained in the same batch so channels observe the
    /// inbound-buffer boundary, then `receive_complete` runs exactly
    /// once per touched channel and the queued output flushes as one
    /// write.
    async fn on_incoming(
        &mut self,
        incoming: Option<Result<crate::frames::FrameInput, TransportError>>,
    ) -> Result<Running, EngineError> {
        let mut next = incoming;
        loop {
            match next {
                Some(Ok(input)) => self.connection.received(input),
                Some(Err(TransportError::IdleTimeoutElapsed)) => {
                    logging::connection_idle_close(self.connection.remote_addr());
                    self.connection.transport_failed();
                    return Ok(Running::Stop);
                }
                Some(Err(TransportError::FrameDecode(error))) => {
                    if self.connection.is_closing() {
                        // the stream is unreadable and the close reply
                        // is already on the wire
                        self.connection.transport_failed();
                        return Ok(Running::Stop);
                    }
                    debug!(?error, "Frame decoding failed");
                    self.connection.request_close(
                        ferrumq_types::reply_code::ReplyCode::FrameError,
                        &error.to_string(),
                    );
                    break;
                }
                Some(Err(TransportError::Io(error))) => {
                    return Err(EngineError::Transport(TransportError::Io(error)));
                }
                None => {
                    if self.connection.state() == ConnectionState::Closed {
                        return Ok(Running::Stop);
                    }
                    self.connection.transport_failed();
                    return Ok(Running::Stop);
                }
            }

            // drain whatever the read already buffered, without waiting
            match self.transport.next().now_or_never() {
                Some(more) => next = more,
                None => break,
            }
        }

        self.connection.receive_complete();
        self.pump_output().await
    }

    async fn on_heartbeat(&mut self) -> Result<Running, EngineError> {
        match self.connection.state() {
            ConnectionState::Closed => return Ok(Running::Stop),
            ConnectionState::Open | ConnectionState::AwaitOpen => {
                self.transport.send(AmqpFrame::heartbeat()).await?;
            }
            _ => {}
        }
        Ok(Running::Continue)
    }

    /// Drains pending work: channels in round-robin order until each
    /// reports no more, then the async task queue, then one flush.
    async fn on_work(&mut self) -> Result<Running, EngineError> {
        if !self.notifier.is_io_task() {
            return Ok(Running::Continue);
        }
        self.notifier.clear_work();

        let mut rotation: VecDeque<Arc<dyn AmqpChannel>> = VecDeque::new();
        self.connection
            .channels()
            .for_each(|_, channel| rotation.push_back(Arc::clone(channel)));
        while let Some(channel) = rotation.pop_front() {
            if channel.process_pending() {
                rotation.push_back(channel);
            }
        }

        while let Some(task) = self.notifier.pop_task() {
            task(&mut self.connection);
        }

        self.pump_output().await
    }

    async fn on_housekeeping(&mut self) -> Result<Running, EngineError> {
        if let Some(deadline) = self.close_deadline {
            if tokio::time::Instant::now() >= deadline {
                debug!("Close-Ok timeout elapsed, dropping transport");
                self.connection.transport_failed();
                return Err(EngineError::CloseOkTimedOut);
            }
        }
        if self.connection.channels().has_stale_closing(CLOSE_OK_TIMEOUT) {
            debug!("Channel Close-Ok timeout elapsed, dropping transport");
            self.connection.transport_failed();
            return Ok(Running::Stop);
        }
        Ok(Running::Continue)
    }

    /// Applies queued transport directives, writes queued frames and
    /// flushes once.
    async fn pump_output(&mut self) -> Result<Running, EngineError> {
        let mut close_after_flush = false;
        for directive in self.connection.take_directives() {
            match directive {
                IoDirective::SetVersion(version) => self.transport.set_version(version),
                IoDirective::SetMaxFrameSize(size) => self.transport.set_max_frame_size(size),
                IoDirective::SendProtocolHeader(header) => {
                    self.transport.send_protocol_header(header)
                }
                IoDirective::InstallHeartbeat {
                    write_delay,
                    read_idle,
                } => {
                    self.heartbeat = HeartBeat::new(write_delay);
                    self.transport.set_read_idle_timeout(read_idle);
                }
                IoDirective::AwaitCloseOk => {
                    self.close_deadline =
                        Some(tokio::time::Instant::now() + CLOSE_OK_TIMEOUT);
                }
                IoDirective::CloseAfterFlush => close_after_flush = true,
            }
        }

        for frame in self.connection.take_outbound() {
            self.transport.feed(frame).await.map_err(EngineError::from)?;
        }
        self.transport.flush().await.map_err(EngineError::from)?;

        if close_after_flush {
            let _ = self.transport.close().await;
            return Ok(Running::Stop);
        }
        Ok(Running::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::{Decoder, Encoder};

    use ferrumq_types::methods::{
        ConnectionClose, ConnectionOpen, ConnectionStartOk, ConnectionTune, Method,
    };
    use ferrumq_types::primitives::{FieldTable, LongString, ShortString};
    use ferrumq_types::reply_code::ReplyCode;
    use ferrumq_types::ProtocolVersion;

    use crate::channel::tests::RecordingChannel;
    use crate::channel::{AmqpChannel, ChannelFactory};
    use crate::contract::tests::{StubVirtualHost, StubVirtualHostRegistry};
    use crate::contract::{BrokerConfig, ConnectionContext, PortConfig, VirtualHost};
    use crate::frames::{AmqpFrame, FrameBody, FrameCodec, FrameInput};
    use crate::sasl::PlainAuthenticationProvider;

    use super::*;

    struct TestChannelFactory;

    impl ChannelFactory for TestChannelFactory {
        fn create_channel(
            &self,
            _id: u16,
            _virtual_host: &Arc<dyn VirtualHost>,
        ) -> Arc<dyn AmqpChannel> {
            Arc::new(RecordingChannel::default())
        }
    }

    fn context() -> ConnectionContext {
        ConnectionContext {
            broker: BrokerConfig {
                session_count_limit: 256,
                heart_beat_delay: 60,
                network_buffer_size: 65536 + 8,
                ..Default::default()
            },
            port: PortConfig::default(),
            auth: Arc::new(PlainAuthenticationProvider::new().with_user("guest", "guest")),
            vhosts: Arc::new(StubVirtualHostRegistry {
                hosts: vec![Arc::new(StubVirtualHost::active(""))],
            }),
            channel_factory: Arc::new(TestChannelFactory),
            remote_addr: "127.0.0.1:49152".parse().unwrap(),
        }
    }

    /// A scripted client on the far end of a duplex pipe.
    struct TestClient {
        io: DuplexStream,
        codec: FrameCodec,
        inbound: BytesMut,
    }

    impl TestClient {
        fn new(io: DuplexStream) -> Self {
            Self {
                io,
                codec: FrameCodec::framed(65536, ProtocolVersion::V0_9_1),
                inbound: BytesMut::new(),
            }
        }

        async fn send_method(&mut self, channel: u16, method: Method) {
            let mut wire = BytesMut::new();
            self.codec
                .encode(AmqpFrame::method(channel, method), &mut wire)
                .unwrap();
            self.io.write_all(&wire).await.unwrap();
        }

        async fn read_method(&mut self) -> (u16, Method) {
            loop {
                if let Some(input) = self.codec.decode(&mut self.inbound).unwrap() {
                    match input {
                        FrameInput::Frame(AmqpFrame {
                            channel,
                            body: FrameBody::Method(method),
                        }) => return (channel, method),
                        other => panic!("expected a method frame, got {other:?}"),
                    }
                }
                let read = self.io.read_buf(&mut self.inbound).await.unwrap();
                assert!(read > 0, "server hung up mid-frame");
            }
        }
    }

    fn shortstr(s: &str) -> ShortString {
        ShortString::new(s).unwrap()
    }

    #[tokio::test]
    async fn handshake_and_orderly_close_over_a_socket() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let engine = ConnectionEngine::new(server_io, context());
        let handle = engine.spawn();

        let mut client = TestClient::new(client_io);
        client.io.write_all(b"AMQP\x00\x00\x09\x01").await.unwrap();

        let (channel, start) = client.read_method().await;
        assert_eq!(channel, 0);
        let start = match start {
            Method::ConnectionStart(start) => start,
            other => panic!("expected Connection.Start, got {other:?}"),
        };
        assert_eq!((start.version_major, start.version_minor), (0, 9));
        assert_eq!(start.locales, LongString::from("en_US"));

        client
            .send_method(
                0,
                Method::ConnectionStartOk(ConnectionStartOk {
                    client_properties: FieldTable::new(),
                    mechanism: shortstr("PLAIN"),
                    response: LongString::from("\0guest\0guest"),
                    locale: shortstr("en_US"),
                }),
            )
            .await;

        let (_, tune) = client.read_method().await;
        let tune = match tune {
            Method::ConnectionTune(tune) => tune,
            other => panic!("expected Connection.Tune, got {other:?}"),
        };
        assert_eq!(tune.channel_max, 256);
        assert_eq!(tune.frame_max, 65536);
        assert_eq!(tune.heartbeat, 60);

        client
            .send_method(
                0,
                Method::ConnectionTuneOk(ConnectionTune {
                    channel_max: 256,
                    frame_max: 65536,
                    heartbeat: 0,
                }),
            )
            .await;
        client
            .send_method(
                0,
                Method::ConnectionOpen(ConnectionOpen {
                    virtual_host: shortstr("/"),
                    capabilities: ShortString::default(),
                    insist: false,
                }),
            )
            .await;

        let (_, open_ok) = client.read_method().await;
        assert!(matches!(open_ok, Method::ConnectionOpenOk(_)));

        client
            .send_method(
                0,
                Method::ConnectionClose(ConnectionClose {
                    reply_code: ReplyCode::ReplySuccess.value(),
                    reply_text: shortstr("done"),
                    class_id: 0,
                    method_id: 0,
                }),
            )
            .await;
        let (_, close_ok) = client.read_method().await;
        assert!(matches!(close_ok, Method::ConnectionCloseOk));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_echoes_the_supported_header_and_hangs_up() {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let engine = ConnectionEngine::new(server_io, context());
        let handle = engine.spawn();

        let mut client_io = client_io;
        client_io.write_all(b"AMQP\x00\x00\x0a\x00").await.unwrap();

        let mut reply = [0u8; 8];
        client_io.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"AMQP\x00\x00\x09\x01");

        // nothing follows; the server closed the transport
        let mut rest = Vec::new();
        client_io.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_work_is_flushed_by_the_notifier() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let engine = ConnectionEngine::new(server_io, context());
        let notifier = engine.notifier();
        let handle = engine.spawn();

        let mut client = TestClient::new(client_io);
        client.io.write_all(b"AMQP\x00\x00\x09\x01").await.unwrap();
        let _ = client.read_method().await; // Start

        // a producer asks the engine to close from another task
        notifier.enqueue(Box::new(|connection| {
            connection.request_close(ReplyCode::ConnectionForced, "management close");
        }));

        let (_, close) = client.read_method().await;
        match close {
            Method::ConnectionClose(close) => {
                assert_eq!(close.reply_code, ReplyCode::ConnectionForced.value());
                assert_eq!(close.reply_text.as_str(), "management close");
            }
            other => panic!("expected Connection.Close, got {other:?}"),
        }

        client.send_method(0, Method::ConnectionCloseOk).await;
        handle.await.unwrap().unwrap();
    }
}
