//! Relay-mediated attempt.

use std::sync::Arc;

use super::{ChannelKind, EstablishedChannel};
use crate::core::{RelayRequest, RelayService, Result};

/// Negotiate a session through the relay service.
#[derive(Clone)]
pub(crate) struct RelayAttempt {
    pub(crate) service: Arc<dyn RelayService>,
    pub(crate) request: RelayRequest,
}

impl RelayAttempt {
    pub(crate) async fn run(self) -> Result<EstablishedChannel> {
        let session = self.service.open(&self.request).await?;
        tracing::debug!(
            server = %self.request.server_url,
            candidates = session.peer_candidates.len(),
            "relay session opened"
        );
        Ok(EstablishedChannel {
            kind: ChannelKind::Relay,
            link: session.link,
            peer_candidates: session.peer_candidates,
        })
    }
}
