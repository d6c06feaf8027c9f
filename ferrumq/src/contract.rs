//! Implements the contracts the engine consumes from the broker model
//!
//! The broker's configuration tree, virtual-host fabric and
//! authentication providers live outside the engine; the engine only
//! sees the values and capabilities collected here.

use std::net::SocketAddr;
use std::sync::Arc;

use regex::Regex;

use ferrumq_types::constants::FRAME_OVERHEAD;

use crate::sasl::{AuthenticationProvider, Subject};

/// Broker-wide configuration values the engine consumes.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Product name advertised in `Connection.Start`
    pub product: String,

    /// Product version advertised in `Connection.Start`
    pub version: String,

    /// Build identifier advertised as `qpid.build`
    pub build: String,

    /// Broker instance name advertised as `qpid.instance_name`
    pub instance_name: String,

    /// Channel cap offered in `Connection.Tune`
    pub session_count_limit: u16,

    /// Heartbeat delay offered in `Connection.Tune`, seconds; zero
    /// disables heartbeats
    pub heart_beat_delay: u16,

    /// Whether unroutable mandatory messages bounce the publisher
    pub close_when_no_route: bool,

    /// Whether the delivery path may deflate outbound content
    pub message_compression_enabled: bool,

    /// Whether the virtual-host properties extension is advertised
    pub virtualhost_properties_supported: bool,

    /// Transport buffer size, octets; bounds the offered frame max
    pub network_buffer_size: u32,

    /// Host to redirect clients to when the virtual host is not active
    pub redirect_host: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            product: "ferrumq".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: "unknown".to_string(),
            instance_name: "default".to_string(),
            session_count_limit: 256,
            heart_beat_delay: 0,
            close_when_no_route: false,
            message_compression_enabled: true,
            virtualhost_properties_supported: true,
            network_buffer_size: 256 * 1024,
            redirect_host: None,
        }
    }
}

impl BrokerConfig {
    /// The frame max offered in `Connection.Tune`.
    ///
    /// Deliberately `network_buffer_size - FRAME_OVERHEAD`, not the full
    /// buffer size: old clients are known to send payloads equal to the
    /// negotiated frame max, and the whole frame must still fit the
    /// network buffer. Review before changing; on-the-wire behaviour
    /// depends on it.
    pub fn default_frame_max(&self) -> u32 {
        self.network_buffer_size - FRAME_OVERHEAD as u32
    }
}

/// Per-port configuration values the engine consumes.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Largest message body accepted from publishers, octets; zero is
    /// unlimited
    pub max_message_size: u64,

    /// Connection cap for the port; zero is unlimited
    pub max_open_connections: u32,

    /// Percentage of the cap at which a warning is logged
    pub open_connections_warn_percent: u32,

    /// Octets of binary content included in debug logs
    pub debug_binary_data_length: usize,

    /// Clients whose version matches always receive `Queue.Delete-Ok`,
    /// regardless of `nowait`; `None` disables the workaround
    pub send_queue_delete_ok_regardless_client_ver_regexp: Option<Regex>,

    /// Bodies above this size are eligible for outbound deflation,
    /// octets
    pub message_compression_threshold: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024 * 1024,
            max_open_connections: 0,
            open_connections_warn_percent: 80,
            debug_binary_data_length: 80,
            send_queue_delete_ok_regardless_client_ver_regexp: None,
            message_compression_threshold: 102400,
        }
    }
}

/// Refusal raised when a subject may not create a connection on a
/// virtual host.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Access refused: {0}")]
pub struct AccessRefused(
    /// Reason for the refusal
    pub String,
);

/// A virtual host as seen from the engine.
pub trait VirtualHost: Send + Sync {
    /// The virtual host name.
    fn name(&self) -> &str;

    /// True while the host accepts new connections.
    fn is_active(&self) -> bool;

    /// Authorises `subject` to attach a connection.
    fn authorise_create_connection(&self, subject: &Subject) -> Result<(), AccessRefused>;
}

/// Resolves virtual host names for `Connection.Open`.
pub trait VirtualHostRegistry: Send + Sync {
    /// Looks up a virtual host by name (leading `/` already stripped).
    fn virtual_host(&self, name: &str) -> Option<Arc<dyn VirtualHost>>;
}

/// Everything a single connection's engine needs from its surroundings.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Broker-wide configuration
    pub broker: BrokerConfig,

    /// Port configuration
    pub port: PortConfig,

    /// The port's authentication provider
    pub auth: Arc<dyn AuthenticationProvider>,

    /// Virtual host resolution
    pub vhosts: Arc<dyn VirtualHostRegistry>,

    /// Creates channels on `Channel.Open`
    pub channel_factory: Arc<dyn crate::channel::ChannelFactory>,

    /// The peer's address, for logging
    pub remote_addr: SocketAddr,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A virtual host stub with a switchable active flag and an
    /// optional principal deny-list.
    #[derive(Debug)]
    pub(crate) struct StubVirtualHost {
        pub name: String,
        pub active: bool,
        pub denied_principals: Vec<String>,
    }

    impl StubVirtualHost {
        pub fn active(name: &str) -> Self {
            Self {
                name: name.to_string(),
                active: true,
                denied_principals: Vec::new(),
            }
        }
    }

    impl VirtualHost for StubVirtualHost {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn authorise_create_connection(&self, subject: &Subject) -> Result<(), AccessRefused> {
            if self.denied_principals.contains(&subject.principal) {
                Err(AccessRefused(format!(
                    "{} may not connect to {}",
                    subject.principal, self.name
                )))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct StubVirtualHostRegistry {
        pub hosts: Vec<Arc<StubVirtualHost>>,
    }

    impl VirtualHostRegistry for StubVirtualHostRegistry {
        fn virtual_host(&self, name: &str) -> Option<Arc<dyn VirtualHost>> {
            self.hosts
                .iter()
                .find(|host| host.name == name)
                .map(|host| Arc::clone(host) as Arc<dyn VirtualHost>)
        }
    }

    #[test]
    fn default_frame_max_leaves_room_for_the_envelope() {
        let config = BrokerConfig::default();
        assert_eq!(
            config.default_frame_max(),
            config.network_buffer_size - 8
        );
    }
}
