//! Implements the operational event log lines
//!
//! Each function emits one structured event under a stable symbolic
//! name. Monitoring pipelines key on the `event` field; the remaining
//! fields are the event's semantic payload.

use std::net::SocketAddr;

use tracing::{info, warn};

/// `CONNECTION.OPEN` — a connection finished its handshake.
pub fn connection_open(remote_addr: SocketAddr, principal: &str, virtual_host: &str) {
    info!(
        event = "CONNECTION.OPEN",
        %remote_addr,
        principal,
        virtual_host,
        "Connection open"
    );
}

/// `CONNECTION.CLOSE` — a connection closed in an orderly fashion.
pub fn connection_close(remote_addr: SocketAddr) {
    info!(event = "CONNECTION.CLOSE", %remote_addr, "Connection close");
}

/// `CONNECTION.DROPPED` — the peer vanished without a close handshake.
pub fn connection_dropped(remote_addr: SocketAddr) {
    info!(event = "CONNECTION.DROPPED", %remote_addr, "Connection dropped");
}

/// `CONNECTION.IDLE_CLOSE` — no traffic within the heartbeat deadline.
pub fn connection_idle_close(remote_addr: SocketAddr) {
    info!(event = "CONNECTION.IDLE_CLOSE", %remote_addr, "Connection idle, closing");
}

/// `PORT.CONNECTION_COUNT_WARN` — the port crossed its warning line.
pub fn connection_count_warn(current: usize, warn_percent: u32, max: usize) {
    warn!(
        event = "PORT.CONNECTION_COUNT_WARN",
        current,
        warn_percent,
        max,
        "Connection count passed {warn_percent}% of the maximum {max}"
    );
}

/// `PORT.CONNECTION_REJECTED_CLOSED` — refused because the port drains.
pub fn connection_rejected_closed(remote_addr: SocketAddr) {
    warn!(
        event = "PORT.CONNECTION_REJECTED_CLOSED",
        %remote_addr,
        "Connection rejected, port is closing"
    );
}

/// `PORT.CONNECTION_REJECTED_TOO_MANY` — refused at the connection cap.
pub fn connection_rejected_too_many(remote_addr: SocketAddr, max: usize) {
    warn!(
        event = "PORT.CONNECTION_REJECTED_TOO_MANY",
        %remote_addr,
        max,
        "Connection rejected, maximum of {max} connections reached"
    );
}

/// `BROKER.LISTENING` — a port began accepting connections.
pub fn broker_listening(transport: &str, port: u16) {
    info!(event = "BROKER.LISTENING", transport, port, "Listening");
}

/// `BROKER.SHUTTING_DOWN` — a port stopped accepting connections.
pub fn broker_shutting_down(transport: &str, port: u16) {
    info!(event = "BROKER.SHUTTING_DOWN", transport, port, "Shutting down");
}
