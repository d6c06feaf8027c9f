//! Implements the per-connection protocol state machine
//!
//! [`AmqpConnection`] is the sans-IO endpoint: it consumes decoded
//! [`FrameInput`] events, walks the handshake, multiplexes channels and
//! queues outbound frames plus [`IoDirective`]s for the engine to apply
//! to the transport. [`engine::ConnectionEngine`] drives it over a
//! socket.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use ferrumq_types::constants::{CLASS_CONNECTION, MIN_FRAME_SIZE};
use ferrumq_types::methods::{
    ChannelClose, ChannelOpenOk, ConnectionClose, ConnectionOpen, ConnectionOpenOk,
    ConnectionSecure, ConnectionStart, ConnectionStartOk, ConnectionTune, Method, MethodRegistry,
};
use ferrumq_types::primitives::{FieldTable, FieldValue, LongString, ShortString};
use ferrumq_types::properties::ContentHeader;
use ferrumq_types::reply_code::ReplyCode;
use ferrumq_types::{ProtocolHeader, ProtocolVersion};

use crate::channel::{AmqpChannel, ChannelFrame, ChannelLookup, ChannelRegistry};
use crate::contract::ConnectionContext;
use crate::delivery::{DeliveryEncoder, DeliveryKind};
use crate::error::{ChannelException, ConnectionException};
use crate::frames::{AmqpFrame, FrameBody, FrameInput};
use crate::logging;
use crate::message::StoredMessage;
use crate::sasl::{SaslOutcome, SaslServer, Subject};

pub mod engine;
pub mod heartbeat;

/// Reads idle for this many heartbeat periods close the connection.
pub const HEARTBEAT_TIMEOUT_FACTOR: u32 = 2;

/// How long a close handshake may dangle before the socket is dropped.
pub const CLOSE_OK_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handshake and lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Expecting the protocol header
    Init,

    /// `Connection.Start` sent
    AwaitStartOk,

    /// `Connection.Secure` sent
    AwaitSecureOk,

    /// `Connection.Tune` sent
    AwaitTuneOk,

    /// Tuning done, expecting `Connection.Open`
    AwaitOpen,

    /// Attached to a virtual host; channels multiplex freely
    Open,

    /// The close handshake finished or the transport died
    Closed,
}

/// Side effects the engine must apply to the transport after a batch of
/// inputs has been processed.
#[derive(Debug, PartialEq)]
pub enum IoDirective {
    /// Switch the codec to the negotiated version
    SetVersion(ProtocolVersion),

    /// Update the codec's inbound frame-size bound
    SetMaxFrameSize(u32),

    /// Write the raw 8-octet header (version-mismatch reply)
    SendProtocolHeader(ProtocolHeader),

    /// Arm the heartbeat ticker and the read-idle deadline
    InstallHeartbeat {
        /// Send a heartbeat after this long without writes
        write_delay: Duration,

        /// Close the connection after this long without reads
        read_idle: Duration,
    },

    /// `Connection.Close` was sent; drop the socket if `Close-Ok` does
    /// not arrive within [`CLOSE_OK_TIMEOUT`]
    AwaitCloseOk,

    /// Flush the write buffer, then drop the transport
    CloseAfterFlush,
}

/// Client properties recorded at `Start-Ok`.
#[derive(Debug, Default, Clone)]
pub struct ClientProperties {
    /// Client product name
    pub product: Option<String>,

    /// Client product version
    pub version: Option<String>,

    /// The client understands gzip message bodies
    pub supports_compression: bool,

    /// The client wants unroutable mandatory publishes to bounce
    pub close_when_no_route: Option<bool>,
}

/// The sans-IO connection endpoint.
pub struct AmqpConnection {
    context: ConnectionContext,
    state: ConnectionState,
    registry: MethodRegistry,
    channels: ChannelRegistry,
    sasl_server: Option<Box<dyn SaslServer>>,
    authorized_subject: Option<Subject>,
    max_frame_size: u32,
    heartbeat_delay: u16,
    virtual_host: Option<Arc<dyn crate::contract::VirtualHost>>,
    client_properties: ClientProperties,
    send_queue_delete_ok_regardless: bool,
    orderly_close: AtomicBool,
    transport_blocked: AtomicBool,
    close_sent: bool,
    close_ok_sent: AtomicBool,
    current_class_id: u16,
    current_method_id: u16,
    touched: Vec<(u16, Arc<dyn AmqpChannel>)>,
    touched_ids: HashSet<u16>,
    outbound: Vec<AmqpFrame>,
    directives: Vec<IoDirective>,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("state", &self.state)
            .field("remote_addr", &self.context.remote_addr)
            .field("channels", &self.channels)
            .finish()
    }
}

fn reply_text(message: &str) -> ShortString {
    let mut end = message.len().min(255);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    ShortString::new(&message[..end]).unwrap_or_default()
}

impl AmqpConnection {
    /// An endpoint in the initial state, expecting the protocol header.
    pub fn new(context: ConnectionContext) -> Self {
        let max_channel_id = context.broker.session_count_limit;
        Self {
            context,
            state: ConnectionState::Init,
            registry: MethodRegistry::new(ProtocolVersion::latest()),
            channels: ChannelRegistry::new(max_channel_id),
            sasl_server: None,
            authorized_subject: None,
            max_frame_size: MIN_FRAME_SIZE,
            heartbeat_delay: 0,
            virtual_host: None,
            client_properties: ClientProperties::default(),
            send_queue_delete_ok_regardless: false,
            orderly_close: AtomicBool::new(false),
            transport_blocked: AtomicBool::new(false),
            close_sent: false,
            close_ok_sent: AtomicBool::new(false),
            current_class_id: 0,
            current_method_id: 0,
            touched: Vec::new(),
            touched_ids: HashSet::new(),
            outbound: Vec::new(),
            directives: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The authenticated subject, once SASL succeeded.
    pub fn authorized_subject(&self) -> Option<&Subject> {
        self.authorized_subject.as_ref()
    }

    /// Client properties recorded at `Start-Ok`.
    pub fn client_properties(&self) -> &ClientProperties {
        &self.client_properties
    }

    /// True when channels must answer `Queue.Delete` even under
    /// `nowait` (pre-0.32 client workaround).
    pub fn send_queue_delete_ok_regardless(&self) -> bool {
        self.send_queue_delete_ok_regardless
    }

    /// The negotiated heartbeat delay, seconds; zero when disabled.
    pub fn heartbeat_delay(&self) -> u16 {
        self.heartbeat_delay
    }

    /// Whether unroutable mandatory publishes bounce: the client's
    /// stated preference, falling back to the broker's setting.
    pub fn close_when_no_route(&self) -> bool {
        self.client_properties
            .close_when_no_route
            .unwrap_or(self.context.broker.close_when_no_route)
    }

    /// The channel registry.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Frames queued for the wire, in order.
    pub fn take_outbound(&mut self) -> Vec<AmqpFrame> {
        std::mem::take(&mut self.outbound)
    }

    /// Transport side effects queued by the last inputs.
    pub fn take_directives(&mut self) -> Vec<IoDirective> {
        std::mem::take(&mut self.directives)
    }

    /// Feeds one decoded input through the state machine.
    pub fn received(&mut self, input: FrameInput) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match input {
            FrameInput::ProtocolInitiation(result) => self.receive_protocol_initiation(result),
            FrameInput::Frame(frame) => self.receive_frame(frame),
        }
    }

    /// Completes the current inbound buffer: every channel touched since
    /// the last call gets exactly one `receive_complete()`. The first
    /// failure is kept and handled after all channels were visited.
    pub fn receive_complete(&mut self) {
        let touched = std::mem::take(&mut self.touched);
        self.touched_ids.clear();
        let mut first_failure: Option<(u16, ChannelException)> = None;
        for (id, channel) in touched {
            if let Err(exception) = channel.receive_complete() {
                if first_failure.is_none() {
                    first_failure = Some((id, exception));
                }
            }
        }
        if let Some((id, exception)) = first_failure {
            self.channel_exception(id, exception);
        }
    }

    /* ---------------------------- handshake ---------------------------- */

    fn receive_protocol_initiation(&mut self, result: Result<ProtocolVersion, [u8; 8]>) {
        match result {
            Ok(version) if self.state == ConnectionState::Init => {
                self.registry = MethodRegistry::new(version);
                self.directives.push(IoDirective::SetVersion(version));
                self.send_connection_start(version);
                self.state = ConnectionState::AwaitStartOk;
            }
            Ok(_) | Err(_) => {
                // unsupported version or garbage: advertise the latest
                // supported header and hang up
                debug!(remote_addr = %self.context.remote_addr, "Unsupported protocol initiation");
                self.directives
                    .push(IoDirective::SendProtocolHeader(ProtocolHeader::latest()));
                self.mark_closed();
            }
        }
    }

    fn send_connection_start(&mut self, version: ProtocolVersion) {
        let broker = &self.context.broker;
        let mut server_properties = FieldTable::new();
        let mut put = |name: &str, value: FieldValue| {
            if let Ok(name) = ShortString::new(name) {
                server_properties.insert(name, value);
            }
        };
        put("product", FieldValue::LongString(broker.product.as_str().into()));
        put("version", FieldValue::LongString(broker.version.as_str().into()));
        put("qpid.build", FieldValue::LongString(broker.build.as_str().into()));
        put(
            "qpid.instance_name",
            FieldValue::LongString(broker.instance_name.as_str().into()),
        );
        put(
            "qpid.close_when_no_route",
            FieldValue::Bool(broker.close_when_no_route),
        );
        put(
            "qpid.message_compression_supported",
            FieldValue::Bool(broker.message_compression_enabled),
        );
        put("qpid.confirmed_publish_supported", FieldValue::Bool(true));
        put(
            "qpid.virtualhost_properties_supported",
            FieldValue::Bool(broker.virtualhost_properties_supported),
        );

        let mechanisms = self.context.auth.mechanisms().join(" ");
        self.outbound.push(AmqpFrame::method(
            0,
            Method::ConnectionStart(ConnectionStart {
                version_major: version.major(),
                version_minor: version.minor(),
                server_properties,
                mechanisms: mechanisms.as_str().into(),
                locales: "en_US".into(),
            }),
        ));
    }

    fn receive_start_ok(&mut self, body: ConnectionStartOk) {
        self.record_client_properties(&body.client_properties);

        let mechanism = body.mechanism.as_str().to_string();
        match self.context.auth.create_sasl_server(&mechanism) {
            Some(server) => {
                self.sasl_server = Some(server);
                self.continue_sasl(body.response);
            }
            None => self.connection_exception(ConnectionException::new(
                ReplyCode::NotAllowed,
                format!("Unknown authentication mechanism: {mechanism}"),
            )),
        }
    }

    fn receive_secure_ok(&mut self, response: LongString) {
        self.continue_sasl(response);
    }

    /// Runs one SASL round. The server slot is taken exactly once, on
    /// the terminal outcome; a challenge puts it back.
    fn continue_sasl(&mut self, response: LongString) {
        let Some(mut server) = self.sasl_server.take() else {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        };
        match server.respond(response.as_bytes()) {
            SaslOutcome::Success(subject) => {
                debug!(principal = %subject.principal, "Authentication succeeded");
                self.authorized_subject = Some(subject);
                self.send_connection_tune();
                self.state = ConnectionState::AwaitTuneOk;
            }
            SaslOutcome::Challenge(challenge) => {
                self.sasl_server = Some(server);
                self.outbound.push(AmqpFrame::method(
                    0,
                    Method::ConnectionSecure(ConnectionSecure {
                        challenge: LongString::new(challenge),
                    }),
                ));
                self.state = ConnectionState::AwaitSecureOk;
            }
            SaslOutcome::Failure => {
                self.connection_exception(ConnectionException::new(
                    ReplyCode::NotAllowed,
                    "Authentication failed",
                ));
            }
        }
    }

    fn record_client_properties(&mut self, table: &FieldTable) {
        let string_of = |value: &FieldValue| match value {
            FieldValue::LongString(s) => s.as_utf8().ok().map(str::to_string),
            _ => None,
        };
        let bool_of = |value: &FieldValue| match value {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        };

        self.client_properties.product = table.get("product").and_then(string_of);
        self.client_properties.version = table.get("version").and_then(string_of);
        self.client_properties.supports_compression = table
            .get("qpid.message_compression_supported")
            .and_then(bool_of)
            .unwrap_or(false);
        self.client_properties.close_when_no_route =
            table.get("qpid.close_when_no_route").and_then(bool_of);

        // Pre-0.32 qpid clients block on Queue.Delete-Ok even with
        // nowait set; matching clients always get the reply.
        if let Some(regex) = &self
            .context
            .port
            .send_queue_delete_ok_regardless_client_ver_regexp
        {
            let product_matches = self
                .client_properties
                .product
                .as_deref()
                .map(|product| {
                    product.eq_ignore_ascii_case("qpid") || product.eq_ignore_ascii_case("unknown")
                })
                .unwrap_or(false);
            let version_matches = self
                .client_properties
                .version
                .as_deref()
                .map(|version| regex.is_match(version))
                .unwrap_or(false);
            self.send_queue_delete_ok_regardless = product_matches && version_matches;
        }
    }

    fn send_connection_tune(&mut self) {
        let broker = &self.context.broker;
        self.outbound.push(AmqpFrame::method(
            0,
            Method::ConnectionTune(ConnectionTune {
                channel_max: broker.session_count_limit,
                frame_max: broker.default_frame_max(),
                heartbeat: broker.heart_beat_delay,
            }),
        ));
    }

    fn receive_tune_ok(&mut self, body: ConnectionTune) {
        let broker_frame_max = self.context.broker.default_frame_max();
        if body.frame_max < MIN_FRAME_SIZE {
            self.connection_exception(ConnectionException::new(
                ReplyCode::SyntaxError,
                format!(
                    "Attempt to set max frame size to {} which is smaller than the specification defined minimum: {}",
                    body.frame_max, MIN_FRAME_SIZE
                ),
            ));
            return;
        }
        if body.frame_max > broker_frame_max {
            self.connection_exception(ConnectionException::new(
                ReplyCode::SyntaxError,
                format!(
                    "Attempt to set max frame size to {} which is larger than the broker will allow: {}",
                    body.frame_max, broker_frame_max
                ),
            ));
            return;
        }

        self.max_frame_size = body.frame_max;
        self.directives
            .push(IoDirective::SetMaxFrameSize(body.frame_max));

        // zero means "no preference"; either way the client cannot
        // exceed the session limit the broker advertised in Tune
        let limit = self.context.broker.session_count_limit;
        let channel_max = if body.channel_max == 0 || body.channel_max > limit {
            limit
        } else {
            body.channel_max
        };
        self.channels.set_max_channel_id(channel_max);

        self.heartbeat_delay = body.heartbeat;
        if body.heartbeat > 0 {
            let delay = Duration::from_secs(body.heartbeat as u64);
            self.directives.push(IoDirective::InstallHeartbeat {
                write_delay: delay,
                read_idle: delay * HEARTBEAT_TIMEOUT_FACTOR,
            });
        }
        self.state = ConnectionState::AwaitOpen;
    }

    fn receive_open(&mut self, body: ConnectionOpen) {
        let name = body
            .virtual_host
            .as_str()
            .strip_prefix('/')
            .unwrap_or(body.virtual_host.as_str())
            .to_string();

        let Some(virtual_host) = self.context.vhosts.virtual_host(&name) else {
            self.connection_exception(ConnectionException::new(
                ReplyCode::NotFound,
                format!("Unknown virtual host: '{name}'"),
            ));
            return;
        };

        if !virtual_host.is_active() {
            let message = match &self.context.broker.redirect_host {
                Some(redirect) => {
                    format!("Virtual host '{name}' is not active; redirect to {redirect}")
                }
                None => format!("Virtual host '{name}' is not active"),
            };
            self.connection_exception(ConnectionException::new(
                ReplyCode::ConnectionForced,
                message,
            ));
            return;
        }

        let subject = self.authorized_subject.clone();
        if let Some(subject) = &subject {
            if let Err(refused) = virtual_host.authorise_create_connection(subject) {
                self.connection_exception(ConnectionException::new(
                    ReplyCode::AccessRefused,
                    refused.to_string(),
                ));
                return;
            }
        }

        self.virtual_host = Some(virtual_host);
        self.outbound.push(AmqpFrame::method(
            0,
            Method::ConnectionOpenOk(ConnectionOpenOk::default()),
        ));
        self.state = ConnectionState::Open;
        logging::connection_open(
            self.context.remote_addr,
            subject.as_ref().map(|s| s.principal.as_str()).unwrap_or(""),
            &name,
        );
    }

    /* ---------------------------- dispatch ----------------------------- */

    fn receive_frame(&mut self, frame: AmqpFrame) {
        match frame.body {
            FrameBody::Method(method) => self.dispatch_method(frame.channel, method),
            FrameBody::ContentHeader(header) => self.dispatch_content_header(frame.channel, header),
            FrameBody::ContentBody(bytes) => self.dispatch_content_body(frame.channel, bytes),
            FrameBody::Heartbeat => {
                if frame.channel != 0 {
                    self.connection_exception(ConnectionException::new(
                        ReplyCode::FrameError,
                        format!("Heartbeat frame received on channel {}", frame.channel),
                    ));
                }
                // liveness only otherwise; the transport already reset
                // its read deadline
            }
        }
    }

    fn dispatch_method(&mut self, channel: u16, method: Method) {
        self.current_class_id = method.class_id();
        self.current_method_id = method.method_id(self.registry.version());

        // once a close is in flight only the close handshake is heard
        if self.is_closing() {
            match method {
                Method::ConnectionClose(_) | Method::ConnectionCloseOk => {}
                _ => return,
            }
        }

        if channel == 0 {
            if method.class_id() == CLASS_CONNECTION {
                self.dispatch_connection_method(method);
            } else {
                self.connection_exception(ConnectionException::command_invalid());
            }
            return;
        }

        if method.class_id() == CLASS_CONNECTION {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        }
        if self.state != ConnectionState::Open {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        }

        match method {
            Method::ChannelOpen(_) => self.receive_channel_open(channel),
            Method::ChannelClose(body) => self.receive_channel_close(channel, body),
            Method::ChannelCloseOk => self.receive_channel_close_ok(channel),
            other => self.forward_to_channel(channel, ChannelFrame::Method(other)),
        }
    }

    fn dispatch_connection_method(&mut self, method: Method) {
        use ConnectionState::*;
        match (self.state, method) {
            (AwaitStartOk, Method::ConnectionStartOk(body)) => self.receive_start_ok(body),
            (AwaitSecureOk, Method::ConnectionSecureOk(body)) => {
                self.receive_secure_ok(body.response)
            }
            (AwaitTuneOk, Method::ConnectionTuneOk(body)) => self.receive_tune_ok(body),
            (AwaitOpen, Method::ConnectionOpen(body)) => self.receive_open(body),
            (_, Method::ConnectionClose(body)) => self.receive_connection_close(body),
            (_, Method::ConnectionCloseOk) => self.receive_connection_close_ok(),
            (_, _) => self.connection_exception(ConnectionException::command_invalid()),
        }
    }

    fn receive_channel_open(&mut self, channel: u16) {
        let Some(virtual_host) = self.virtual_host.clone() else {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        };
        let new_channel = self
            .context
            .channel_factory
            .create_channel(channel, &virtual_host);
        match self.channels.open(channel, new_channel) {
            Ok(()) => self.outbound.push(AmqpFrame::method(
                channel,
                Method::ChannelOpenOk(ChannelOpenOk::default()),
            )),
            Err(exception) => self.connection_exception(exception),
        }
    }

    fn receive_channel_close(&mut self, channel: u16, _body: ChannelClose) {
        match self.channels.get(channel) {
            ChannelLookup::Open(_) => {
                if let Some(closed) = self.channels.remove(channel) {
                    closed.close(ReplyCode::ReplySuccess, "Channel closed by client");
                }
                self.outbound
                    .push(AmqpFrame::method(channel, Method::ChannelCloseOk));
            }
            // a close crossing our close: answer and let the closing
            // entry finish its handshake
            ChannelLookup::Closing => self
                .outbound
                .push(AmqpFrame::method(channel, Method::ChannelCloseOk)),
            ChannelLookup::Missing => self.unknown_channel(channel),
        }
    }

    fn receive_channel_close_ok(&mut self, channel: u16) {
        if !self.channels.close_ok(channel) {
            self.connection_exception(ConnectionException::command_invalid());
        }
    }

    fn dispatch_content_header(&mut self, channel: u16, header: ContentHeader) {
        if self.is_closing() {
            return;
        }
        if channel == 0 || self.state != ConnectionState::Open {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        }
        let max_message_size = self.context.port.max_message_size;
        if max_message_size > 0 && header.body_size > max_message_size {
            self.channel_exception(
                channel,
                ChannelException::new(
                    ReplyCode::ResourceError,
                    format!(
                        "Message size of {} octets exceeds the maximum of {} octets",
                        header.body_size, max_message_size
                    ),
                ),
            );
            return;
        }
        self.forward_to_channel(channel, ChannelFrame::ContentHeader(header));
    }

    fn dispatch_content_body(&mut self, channel: u16, bytes: bytes::Bytes) {
        if self.is_closing() {
            return;
        }
        if channel == 0 || self.state != ConnectionState::Open {
            self.connection_exception(ConnectionException::command_invalid());
            return;
        }
        if tracing::enabled!(tracing::Level::TRACE) {
            let preview = bytes.len().min(self.context.port.debug_binary_data_length);
            tracing::trace!(channel, len = bytes.len(), data = ?&bytes[..preview], "Content body");
        }
        self.forward_to_channel(channel, ChannelFrame::ContentBody(bytes));
    }

    fn forward_to_channel(&mut self, channel: u16, frame: ChannelFrame) {
        match self.channels.get(channel) {
            ChannelLookup::Open(target) => {
                if self.touched_ids.insert(channel) {
                    self.touched.push((channel, Arc::clone(&target)));
                }
                if let Err(exception) = target.receive(frame) {
                    self.channel_exception(channel, exception);
                }
            }
            ChannelLookup::Closing => {
                // the channel is half closed; traffic in flight is
                // discarded until Close-Ok arrives
                debug!(channel, "Discarding frame for closing channel");
            }
            ChannelLookup::Missing => self.unknown_channel(channel),
        }
    }

    fn unknown_channel(&mut self, channel: u16) {
        self.connection_exception(ConnectionException::new(
            ReplyCode::ChannelError,
            format!("Unknown channel id: {channel}"),
        ));
    }

    /// Closes one channel with a `Channel.Close` reply citing the
    /// method being processed; the channel then awaits `Close-Ok`.
    fn channel_exception(&mut self, channel: u16, exception: ChannelException) {
        debug!(channel, ?exception, "Channel exception");
        if let Some(closed) = self.channels.mark_awaiting_close_ok(channel) {
            closed.close(exception.reply_code, &exception.message);
        }
        self.outbound.push(AmqpFrame::method(
            channel,
            Method::ChannelClose(ChannelClose {
                reply_code: exception.reply_code.value(),
                reply_text: reply_text(&exception.message),
                class_id: self.current_class_id,
                method_id: self.current_method_id,
            }),
        ));
    }

    /* ---------------------------- deliveries --------------------------- */

    /// Queues a message delivery on `channel`; returns the octets the
    /// frames occupy on the wire.
    pub fn write_delivery(
        &mut self,
        channel: u16,
        kind: DeliveryKind,
        message: &StoredMessage,
    ) -> usize {
        let encoder = DeliveryEncoder::new(
            self.registry,
            self.max_frame_size,
            self.client_properties.supports_compression,
            self.context.broker.message_compression_enabled,
            self.context.port.message_compression_threshold,
        );
        let encoded = encoder.write_delivery(channel, kind, message);
        self.outbound.extend(encoded.frames);
        encoded.bytes_written
    }

    /* ----------------------------- teardown ---------------------------- */

    /// Suspends delivery on every channel (flow control event).
    pub fn block(&mut self) {
        self.channels.block_all();
    }

    /// Resumes delivery on every channel.
    pub fn unblock(&mut self) {
        self.channels.unblock_all();
    }

    /// Records transport writability and notifies every channel.
    pub fn set_transport_blocked(&self, blocked: bool) {
        self.transport_blocked.store(blocked, Ordering::SeqCst);
        self.channels
            .for_each(|_, channel| channel.transport_state_changed());
    }

    /// True while the transport cannot accept writes.
    pub fn transport_blocked(&self) -> bool {
        self.transport_blocked.load(Ordering::SeqCst)
    }

    /// True once either side initiated an orderly close.
    pub fn is_closing(&self) -> bool {
        self.orderly_close.load(Ordering::SeqCst)
    }

    /// Requests an orderly local close (management action, store
    /// failure escalation). Once-only; later calls are no-ops.
    pub fn request_close(&mut self, reply_code: ReplyCode, message: &str) {
        self.send_connection_close(reply_code, message);
    }

    fn begin_orderly_close(&self) -> bool {
        self.orderly_close
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn close_all_channels(&mut self, cause: ReplyCode, message: &str) {
        for (_, channel) in self.channels.drain() {
            channel.close(cause, message);
        }
    }

    fn connection_exception(&mut self, exception: ConnectionException) {
        debug!(?exception, "Connection exception");
        self.send_connection_close(exception.reply_code, &exception.message);
    }

    fn send_connection_close(&mut self, reply_code: ReplyCode, message: &str) {
        if !self.begin_orderly_close() {
            return;
        }
        self.receive_complete();
        self.close_all_channels(reply_code, message);
        self.outbound.push(AmqpFrame::method(
            0,
            Method::ConnectionClose(ConnectionClose {
                reply_code: reply_code.value(),
                reply_text: reply_text(message),
                class_id: self.current_class_id,
                method_id: self.current_method_id,
            }),
        ));
        self.close_sent = true;
        self.directives.push(IoDirective::AwaitCloseOk);
    }

    fn receive_connection_close(&mut self, _body: ConnectionClose) {
        if self.begin_orderly_close() {
            self.receive_complete();
            self.close_all_channels(ReplyCode::ReplySuccess, "Connection closed by peer");
        }
        if self
            .close_ok_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.outbound
                .push(AmqpFrame::method(0, Method::ConnectionCloseOk));
        }
        logging::connection_close(self.context.remote_addr);
        self.mark_closed();
    }

    fn receive_connection_close_ok(&mut self) {
        if self.close_sent {
            logging::connection_close(self.context.remote_addr);
            self.mark_closed();
        } else {
            debug!("Unsolicited Connection.Close-Ok ignored");
        }
    }

    fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.directives.push(IoDirective::CloseAfterFlush);
    }

    /// Tears state down after a transport failure; no frames are
    /// written.
    pub fn transport_failed(&mut self) {
        let orderly = self.is_closing();
        self.begin_orderly_close();
        self.close_all_channels(ReplyCode::ConnectionForced, "Transport failed");
        if orderly {
            logging::connection_close(self.context.remote_addr);
        } else {
            logging::connection_dropped(self.context.remote_addr);
        }
        self.state = ConnectionState::Closed;
    }

    /// The remote peer's address.
    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.context.remote_addr
    }
}
