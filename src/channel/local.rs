//! Local discovery attempt.

use std::sync::Arc;

use super::{ChannelKind, EstablishedChannel};
use crate::core::{Discovery, LocalIdentity, Result, SecureChannel};

/// Look the device up on the local network, then establish a channel to it.
#[derive(Clone)]
pub(crate) struct LocalAttempt {
    pub(crate) discovery: Arc<dyn Discovery>,
    pub(crate) channel: Arc<dyn SecureChannel>,
    pub(crate) product_id: String,
    pub(crate) device_id: String,
}

impl LocalAttempt {
    pub(crate) async fn run(self, identity: LocalIdentity) -> Result<EstablishedChannel> {
        let found = self.discovery.lookup(&self.product_id, &self.device_id).await?;
        tracing::debug!(endpoint = %found.endpoint, "device discovered locally");

        let link = self.channel.establish(&found.endpoint, &identity).await?;
        Ok(EstablishedChannel {
            kind: ChannelKind::Local,
            link,
            peer_candidates: Vec::new(),
        })
    }
}
