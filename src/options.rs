use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use ipnet::IpNet;
use tokio_rustls::rustls;

use crate::{
    http::MAX_REQUEST_SIZE,
    registry::{ClientRegistry, MemoryDriver, StorageDriver},
};

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// The default maximum payload size for a single frame: 1 MiB.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The default maximum size of a reassembled message: 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Policy-file port when the server listens on port 80.
pub const POLICY_PORT: u16 = 843;

/// Policy-file port for every other server port.
pub const POLICY_PORT_ALT: u16 = 8843;

/// Configuration of a [`Server`](crate::Server).
///
/// Every field left unset falls back to the documented default.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use yawss::Options;
///
/// let options = Options::default()
///     .with_port(9000)
///     .with_max_payload_read(64 * 1024)
///     .with_handshake_timeout(Duration::from_secs(5))
///     .without_policy_server();
/// ```
#[derive(Clone, Default)]
pub struct Options {
    /// Address to listen on. Default: `0.0.0.0`.
    pub address: Option<IpAddr>,

    /// Port to listen on. Default: [`DEFAULT_PORT`]. Port `0` picks a free one.
    pub port: Option<u16>,

    /// When set, every accepted connection goes through a TLS handshake first.
    pub tls: Option<Arc<rustls::ServerConfig>>,

    /// Domain allowed by the policy file. Default: every domain (`*`).
    pub http_host: Option<String>,

    /// Port of the policy-file listener.
    ///
    /// Default: [`POLICY_PORT`] when the server listens on port 80, [`POLICY_PORT_ALT`]
    /// otherwise.
    pub policy_port: Option<u16>,

    /// Turns the policy-file listener off.
    pub disable_policy_server: bool,

    /// Maximum size of the upgrade request header block. Default: [`MAX_REQUEST_SIZE`].
    pub max_request_size: Option<usize>,

    /// Maximum payload of a single inbound frame. Larger frames close the connection with
    /// `1009`. Default: [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled message. Default: [`MAX_MESSAGE_SIZE`].
    pub max_message_size: Option<usize>,

    /// Proxies allowed to report the client address through forwarding headers.
    pub trusted_proxies: Vec<IpNet>,

    /// Time a client has to complete its upgrade request. Default: unlimited.
    pub handshake_timeout: Option<Duration>,

    /// TTL handed to the storage driver for every client.
    pub client_ttl: Option<Duration>,

    /// Where clients are registered. Default: [`MemoryDriver`].
    pub storage: Option<Arc<dyn StorageDriver>>,
}

impl Options {
    pub fn with_address(self, address: IpAddr) -> Self {
        Self {
            address: Some(address),
            ..self
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self
        }
    }

    /// Serves `wss://` using `config`.
    pub fn with_tls(self, config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            tls: Some(config),
            ..self
        }
    }

    pub fn with_http_host(self, host: impl Into<String>) -> Self {
        Self {
            http_host: Some(host.into()),
            ..self
        }
    }

    pub fn with_policy_port(self, port: u16) -> Self {
        Self {
            policy_port: Some(port),
            disable_policy_server: false,
            ..self
        }
    }

    pub fn without_policy_server(self) -> Self {
        Self {
            disable_policy_server: true,
            ..self
        }
    }

    /// Sets the cap on the upgrade request. Requests over it are answered with `413`.
    pub fn with_max_request_size(self, size: usize) -> Self {
        Self {
            max_request_size: Some(size),
            ..self
        }
    }

    /// Sets the maximum allowed payload size for a single inbound frame.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    pub fn with_trusted_proxies(self, proxies: Vec<IpNet>) -> Self {
        Self {
            trusted_proxies: proxies,
            ..self
        }
    }

    /// Closes connections whose upgrade request is not complete after `timeout` with
    /// `408 Request Timeout`.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_client_ttl(self, ttl: Duration) -> Self {
        Self {
            client_ttl: Some(ttl),
            ..self
        }
    }

    pub fn with_storage(self, storage: Arc<dyn StorageDriver>) -> Self {
        Self {
            storage: Some(storage),
            ..self
        }
    }

    pub(crate) fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(
            self.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port.unwrap_or(DEFAULT_PORT),
        )
    }

    /// `None` when the policy listener is disabled.
    pub(crate) fn policy_addr(&self) -> Option<SocketAddr> {
        if self.disable_policy_server {
            return None;
        }

        let bind = self.bind_addr();
        let port = self.policy_port.unwrap_or(if bind.port() == 80 {
            POLICY_PORT
        } else {
            POLICY_PORT_ALT
        });
        Some(SocketAddr::new(bind.ip(), port))
    }

    pub(crate) fn registry(&self) -> ClientRegistry {
        let driver = self
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryDriver::new()));
        ClientRegistry::new(driver).with_ttl(self.client_ttl)
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            max_request_size: self.max_request_size.unwrap_or(MAX_REQUEST_SIZE),
            max_payload_read: self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ),
            max_message_size: self.max_message_size.unwrap_or(MAX_MESSAGE_SIZE),
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// Per-connection limits, resolved from [`Options`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_request_size: usize,
    pub max_payload_read: usize,
    pub max_message_size: usize,
    pub handshake_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Options::default().limits()
    }
}
