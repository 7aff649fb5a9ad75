//! UDP secure channel.
//!
//! Opens a connected UDP socket per endpoint and exchanges hello frames so
//! each side learns the other's fingerprint. Payload encryption is the job of
//! whatever [`SecureChannel`] wraps this one in production.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::error::{TransportError, TransportResult};
use super::frame::Frame;
use crate::core::constants::{MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use crate::core::{Endpoint, LocalIdentity, Link, SecureChannel, SharedLink};

/// Default wait for each hello answer.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_millis(500);

/// Default hello transmissions before giving up.
pub const DEFAULT_HELLO_ATTEMPTS: u32 = 4;

/// [`SecureChannel`] over plain UDP.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    hello_timeout: Duration,
    hello_attempts: u32,
}

impl Default for UdpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpChannel {
    /// Create a channel with default handshake timing.
    pub fn new() -> Self {
        Self {
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
            hello_attempts: DEFAULT_HELLO_ATTEMPTS,
        }
    }

    /// Set the wait for each hello answer.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Set how many hellos are sent before giving up.
    pub fn hello_attempts(mut self, attempts: u32) -> Self {
        self.hello_attempts = attempts.max(1);
        self
    }

    async fn resolve(endpoint: &Endpoint) -> TransportResult<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|_| TransportError::Unreachable(endpoint.to_string()))?;
        addrs
            .next()
            .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))
    }

    async fn handshake(&self, socket: &UdpSocket, identity: &LocalIdentity) -> TransportResult<String> {
        let hello = Frame::Hello {
            version: PROTOCOL_VERSION,
            fingerprint: identity.fingerprint.clone(),
        }
        .encode();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        for attempt in 1..=self.hello_attempts {
            socket.send(&hello).await?;
            tracing::trace!(attempt, "hello sent");

            let deadline = tokio::time::Instant::now() + self.hello_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let len = match timeout(remaining, socket.recv(&mut buf)).await {
                    Ok(Ok(len)) => len,
                    // ICMP port unreachable shows up as a refused recv.
                    Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        return Err(TransportError::Unreachable(e.to_string()));
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => break,
                };
                match Frame::decode(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(Frame::HelloAck {
                        version,
                        fingerprint,
                    }) => {
                        if version != PROTOCOL_VERSION {
                            return Err(TransportError::UnsupportedVersion(version));
                        }
                        return Ok(fingerprint);
                    }
                    Ok(other) => {
                        tracing::trace!(frame = ?other.frame_type(), "ignoring frame during handshake");
                    }
                    Err(e) => {
                        tracing::trace!(error = %e, "dropping malformed datagram");
                    }
                }
            }
        }

        Err(TransportError::Timeout)
    }
}

#[async_trait]
impl SecureChannel for UdpChannel {
    async fn establish(
        &self,
        endpoint: &Endpoint,
        identity: &LocalIdentity,
    ) -> TransportResult<SharedLink> {
        let peer = Self::resolve(endpoint).await?;
        let bind: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().map_err(io::Error::other)?
        } else {
            "[::]:0".parse().map_err(io::Error::other)?
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;

        let peer_fingerprint = self.handshake(&socket, identity).await?;
        tracing::debug!(%peer, "udp channel established");

        Ok(Arc::new(UdpLink {
            socket: Arc::new(socket),
            peer,
            peer_fingerprint,
            closed: CancellationToken::new(),
        }))
    }
}

/// Connected UDP socket carrying frames to one peer.
#[derive(Debug)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    peer_fingerprint: String,
    closed: CancellationToken,
}

impl UdpLink {
    /// Address of the peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Local socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Link for UdpLink {
    async fn send(&self, datagram: Bytes) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.socket.send(&datagram).await?;
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            received = self.socket.recv(&mut buf) => {
                let len = received?;
                buf.truncate(len);
                Ok(Bytes::from(buf))
            }
        }
    }

    fn peer_fingerprint(&self) -> String {
        self.peer_fingerprint.clone()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            fingerprint: "aa".repeat(32),
            ..Default::default()
        }
    }

    async fn spawn_responder(version: u8) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                match Frame::decode(Bytes::copy_from_slice(&buf[..len])).unwrap() {
                    Frame::Hello { .. } => {
                        let ack = Frame::HelloAck {
                            version,
                            fingerprint: "bb".repeat(32),
                        };
                        socket.send_to(&ack.encode(), from).await.unwrap();
                    }
                    other => {
                        // Echo everything else back.
                        socket.send_to(&other.encode(), from).await.unwrap();
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_establish_and_exchange() {
        let addr = spawn_responder(PROTOCOL_VERSION).await;
        let link = UdpChannel::new()
            .establish(&Endpoint::from(addr), &identity())
            .await
            .unwrap();
        assert_eq!(link.peer_fingerprint(), "bb".repeat(32));

        let frame = Frame::StreamRst { stream_id: 4 };
        link.send(frame.encode()).await.unwrap();
        let echoed = Frame::decode(link.recv().await.unwrap()).unwrap();
        assert_eq!(echoed, frame);
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let addr = spawn_responder(PROTOCOL_VERSION + 1).await;
        let result = UdpChannel::new()
            .establish(&Endpoint::from(addr), &identity())
            .await;
        assert!(matches!(result, Err(TransportError::UnsupportedVersion(_))));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let result = UdpChannel::new()
            .hello_timeout(Duration::from_millis(20))
            .hello_attempts(2)
            .establish(&Endpoint::from(addr), &identity())
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_closed_link_fails_recv() {
        let addr = spawn_responder(PROTOCOL_VERSION).await;
        let link = UdpChannel::new()
            .establish(&Endpoint::from(addr), &identity())
            .await
            .unwrap();
        link.close();
        assert!(matches!(link.recv().await, Err(TransportError::Closed)));
        assert!(matches!(
            link.send(Frame::Close.encode()).await,
            Err(TransportError::Closed)
        ));
    }
}
