//! Direct candidate attempts.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{ChannelKind, EstablishedChannel};
use crate::core::{Endpoint, Error, LocalIdentity, Result, SecureChannel};
use crate::transport::TransportError;

/// Direct candidates arrive on `candidates` until the sender is dropped.
pub(crate) struct DirectAttempt {
    pub(crate) channel: Arc<dyn SecureChannel>,
    pub(crate) candidates: mpsc::UnboundedReceiver<Endpoint>,
}

/// Establish a channel straight to `endpoint`.
///
/// With `expected_peer` set, a link to any other fingerprint is closed and
/// the attempt fails.
pub(crate) async fn attempt_direct(
    channel: Arc<dyn SecureChannel>,
    kind: ChannelKind,
    endpoint: Endpoint,
    identity: LocalIdentity,
    expected_peer: Option<String>,
) -> Result<EstablishedChannel> {
    let link = channel.establish(&endpoint, &identity).await?;

    if let Some(expected) = expected_peer {
        let actual = link.peer_fingerprint();
        if actual != expected {
            tracing::debug!(%endpoint, %actual, %expected, "candidate answered with another identity");
            link.close();
            return Err(Error::from(TransportError::HandshakeFailed(
                "peer fingerprint mismatch".into(),
            )));
        }
    }

    tracing::debug!(%endpoint, ?kind, "direct channel established");
    Ok(EstablishedChannel {
        kind,
        link,
        peer_candidates: Vec::new(),
    })
}
