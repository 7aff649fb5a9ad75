//! Collaborator interfaces.
//!
//! The connection core never touches sockets, discovery broadcasts or relay
//! protocols directly. It consumes them through these traits so the link
//! layer can be swapped (UDP, DTLS, in-process) without touching the state
//! machines.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::Error;
use crate::transport::TransportError;

/// Host/port pair a channel can be attempted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IP literal.
    pub host: String,
    /// UDP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// What the local side presents when establishing a channel.
#[derive(Debug, Clone, Default)]
pub struct LocalIdentity {
    /// Hex fingerprint of the client's public key.
    pub fingerprint: String,
    /// Application name, if configured.
    pub app_name: Option<String>,
    /// Application version, if configured.
    pub app_version: Option<String>,
}

/// An established, authenticated datagram path to a peer.
///
/// Produced by a [`SecureChannel`] or a [`RelayService`]. Datagrams may be
/// lost, duplicated or reordered; the stream engine repairs that.
#[async_trait]
pub trait Link: Send + Sync + fmt::Debug {
    /// Send one datagram.
    async fn send(&self, datagram: Bytes) -> Result<(), TransportError>;

    /// Receive the next datagram.
    ///
    /// Only one receive loop calls this per link. Returns
    /// [`TransportError::Closed`] once the link is gone.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Hex fingerprint the peer authenticated with.
    fn peer_fingerprint(&self) -> String;

    /// Tear the link down. Pending and future `recv` calls fail.
    fn close(&self);
}

/// Shared handle to a link.
pub type SharedLink = Arc<dyn Link>;

/// Establishes authenticated encrypted paths to endpoints.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Establish a path to `endpoint`, presenting `identity`.
    async fn establish(
        &self,
        endpoint: &Endpoint,
        identity: &LocalIdentity,
    ) -> Result<SharedLink, TransportError>;
}

/// A device found by local discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Address the device answered from.
    pub endpoint: Endpoint,
    /// Product id the device announced.
    pub product_id: String,
    /// Device id the device announced.
    pub device_id: String,
}

/// Local network discovery.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Find a device matching the ids.
    ///
    /// Returns [`Error::NotFound`] when no device answers.
    async fn lookup(&self, product_id: &str, device_id: &str) -> Result<DiscoveredDevice, Error>;
}

/// Parameters for a relay-mediated session.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Rendezvous server url.
    pub server_url: String,
    /// Key identifying the client application at the server.
    pub server_key: String,
    /// Optional bearer token for the server.
    pub server_jwt_token: Option<String>,
    /// Target product id.
    pub product_id: String,
    /// Target device id.
    pub device_id: String,
    /// Local identity.
    pub identity: LocalIdentity,
}

/// Outcome of a successful relay negotiation.
#[derive(Debug, Clone)]
pub struct RelaySession {
    /// Relayed path to the device.
    pub link: SharedLink,
    /// Endpoints the device announced for a peer-to-peer upgrade.
    pub peer_candidates: Vec<Endpoint>,
}

/// Relay/rendezvous service.
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Negotiate a mediated session with the device.
    async fn open(&self, request: &RelayRequest) -> Result<RelaySession, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 5592).to_string(), "10.0.0.1:5592");
        assert_eq!(Endpoint::new("::1", 5592).to_string(), "[::1]:5592");
    }

    #[test]
    fn test_endpoint_from_socket_addr() {
        let addr: std::net::SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("127.0.0.1", 4000));
    }
}
