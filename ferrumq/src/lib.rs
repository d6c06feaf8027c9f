#![deny(missing_docs, missing_debug_implementations)]

//! The per-connection protocol engine of an AMQP 0-8/0-9/0-9-1 message
//! broker, based on tokio.
//!
//! One [`connection::engine::ConnectionEngine`] owns a single accepted
//! client stream: it decodes framed traffic into protocol methods,
//! drives the connection-lifecycle handshake (version negotiation, SASL
//! authentication, tuning, virtual-host attach), multiplexes channels,
//! frames outbound replies and message deliveries (bridging gzip
//! content for clients of differing capability), enforces resource
//! bounds and performs orderly or forced teardown.
//!
//! The broker's model tree, the message store and the queue/exchange
//! fabric are external collaborators reached through the traits in
//! [`contract`], [`sasl`] and [`channel`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use ferrumq::acceptor::PortAcceptor;
//!
//! let acceptor = Arc::new(PortAcceptor::new(
//!     broker_config,
//!     port_config,
//!     auth_provider,
//!     virtual_hosts,
//!     channel_factory,
//! ));
//! let listener = TcpListener::bind("0.0.0.0:5672").await?;
//! acceptor.run(listener).await?;
//! ```

pub mod acceptor;
pub mod admission;
pub mod channel;
pub mod connection;
pub mod contract;
pub mod delivery;
pub mod error;
pub mod frames;
pub mod logging;
pub mod message;
pub mod notify;
pub mod sasl;
pub mod transport;

pub(crate) mod util;

pub use connection::engine::ConnectionEngine;
pub use connection::{AmqpConnection, ConnectionState};
pub use error::{ChannelException, ConnectionException, EngineError};
