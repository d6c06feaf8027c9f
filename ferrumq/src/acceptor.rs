//! Implements the per-port accept loop
//!
//! The acceptor gates sockets through the admission controller, spawns
//! one [`ConnectionEngine`] per accepted connection and supports
//! drain-and-stop. TLS setup is the caller's concern: anything that
//! reads and writes bytes can be handed to [`spawn_connection`]
//! (`PortAcceptor::spawn_connection`).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::admission::{AdmissionDecision, ConnectionAdmission};
use crate::channel::ChannelFactory;
use crate::connection::engine::ConnectionEngine;
use crate::contract::{BrokerConfig, ConnectionContext, PortConfig, VirtualHostRegistry};
use crate::logging;
use crate::sasl::AuthenticationProvider;

/// Accepts connections on one port and runs an engine per socket.
pub struct PortAcceptor {
    broker: BrokerConfig,
    port: PortConfig,
    auth: Arc<dyn AuthenticationProvider>,
    vhosts: Arc<dyn VirtualHostRegistry>,
    channel_factory: Arc<dyn ChannelFactory>,
    admission: Arc<ConnectionAdmission>,
}

impl std::fmt::Debug for PortAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAcceptor")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("admission", &self.admission)
            .finish()
    }
}

impl PortAcceptor {
    /// Builds an acceptor; the admission controller is sized from the
    /// port configuration.
    pub fn new(
        broker: BrokerConfig,
        port: PortConfig,
        auth: Arc<dyn AuthenticationProvider>,
        vhosts: Arc<dyn VirtualHostRegistry>,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> Self {
        let admission = Arc::new(ConnectionAdmission::new(
            port.max_open_connections,
            port.open_connections_warn_percent,
        ));
        Self {
            broker,
            port,
            auth,
            vhosts,
            channel_factory,
            admission,
        }
    }

    /// The port's admission controller.
    pub fn admission(&self) -> Arc<ConnectionAdmission> {
        Arc::clone(&self.admission)
    }

    /// Runs the accept loop until the listener fails or the port is
    /// drained via [`drain`](Self::drain).
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(0);
        logging::broker_listening("TCP", local_port);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            match self.admission.can_accept(remote_addr) {
                AdmissionDecision::Accept => {
                    self.spawn_connection(stream, remote_addr);
                }
                AdmissionDecision::RejectedClosed if self.admission.count() == 0 => {
                    // drained and latched closed: stop accepting
                    drop(stream);
                    logging::broker_shutting_down("TCP", local_port);
                    return Ok(());
                }
                AdmissionDecision::RejectedClosed | AdmissionDecision::RejectedTooMany => {
                    // rejection already logged by the admission
                    // controller; drop the socket before any handshake
                    drop(stream);
                }
            }
        }
    }

    /// Spawns an engine for an accepted stream, holding an admission
    /// slot for its lifetime.
    pub fn spawn_connection<Io>(&self, io: Io, remote_addr: SocketAddr) -> JoinHandle<()>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let context = ConnectionContext {
            broker: self.broker.clone(),
            port: self.port.clone(),
            auth: Arc::clone(&self.auth),
            vhosts: Arc::clone(&self.vhosts),
            channel_factory: Arc::clone(&self.channel_factory),
            remote_addr,
        };
        self.admission.increment();
        let admission = Arc::clone(&self.admission);
        let engine = ConnectionEngine::new(io, context);
        tokio::spawn(async move {
            if let Err(error) = engine.event_loop().await {
                debug!(?error, %remote_addr, "Connection finished with error");
            }
            admission.decrement();
        })
    }

    /// Latches the port closed and waits until every connection is
    /// gone.
    pub async fn drain(&self, local_port: u16) {
        self.admission.begin_close();
        self.admission.wait_drained().await;
        logging::broker_shutting_down("TCP", local_port);
    }
}
