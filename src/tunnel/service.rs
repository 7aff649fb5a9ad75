//! Device end of a TCP tunnel.

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::bridge;
use super::header::{TunnelStatus, TunnelTarget};
use crate::device::StreamHandler;
use crate::stream::Stream;

/// Stream handler that connects tunnel streams to their TCP target.
///
/// Register it on [`TUNNEL_STREAM_PORT`](crate::core::constants::TUNNEL_STREAM_PORT).
/// Without [`allow`](TunnelService::allow) entries every target is accepted.
#[derive(Debug, Clone, Default)]
pub struct TunnelService {
    allowed: Vec<TunnelTarget>,
}

impl TunnelService {
    /// Service that tunnels to any target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict tunnels to the listed targets.
    pub fn allow(mut self, host: &str, port: u16) -> Self {
        self.allowed.push(TunnelTarget {
            host: host.to_string(),
            port,
        });
        self
    }

    fn permits(&self, target: &TunnelTarget) -> bool {
        self.allowed.is_empty() || self.allowed.contains(target)
    }

    async fn decline(stream: &Stream, status: TunnelStatus) {
        if let Err(e) = stream.write(vec![status as u8]).outcome().await {
            tracing::debug!(stream = stream.id(), error = %e, "tunnel status not sent");
            return;
        }
        if let Err(e) = stream.close().outcome().await {
            tracing::debug!(stream = stream.id(), error = %e, "tunnel close failed");
        }
    }
}

#[async_trait]
impl StreamHandler for TunnelService {
    async fn handle(&self, stream: Stream) {
        let target = match TunnelTarget::read_from(&stream).await {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(stream = stream.id(), error = %e, "bad tunnel header");
                return;
            }
        };
        if !self.permits(&target) {
            tracing::info!(stream = stream.id(), %target, "tunnel target refused");
            Self::decline(&stream, TunnelStatus::Refused).await;
            return;
        }

        let socket = match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::info!(stream = stream.id(), %target, error = %e, "tunnel target unreachable");
                Self::decline(&stream, TunnelStatus::Unreachable).await;
                return;
            }
        };
        if let Err(e) = stream
            .write(vec![TunnelStatus::Connected as u8])
            .outcome()
            .await
        {
            tracing::debug!(stream = stream.id(), error = %e, "tunnel status not sent");
            return;
        }

        tracing::debug!(stream = stream.id(), %target, "tunnel connected");
        if let Err(e) = bridge(&stream, socket).await {
            tracing::debug!(stream = stream.id(), %target, error = %e, "tunnel ended");
        }
    }
}
