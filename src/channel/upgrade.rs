//! Relay to peer-to-peer upgrade.

use std::sync::Arc;
use std::time::Duration;

use super::arbiter::Race;
use super::direct::attempt_direct;
use super::{ChannelKind, ChannelObserver};
use crate::core::{Endpoint, LocalIdentity, SecureChannel, SharedLink};

/// Candidates to try once a relay session is up.
pub(crate) struct UpgradePlan {
    pub(crate) channel: Arc<dyn SecureChannel>,
    pub(crate) candidates: Vec<Endpoint>,
    pub(crate) identity: LocalIdentity,
    /// Fingerprint the relay session authenticated; candidates must match.
    pub(crate) device_fingerprint: String,
    pub(crate) channel_timeout: Duration,
}

/// Try every candidate at once. Returns the first link that reaches the same
/// device, or `None` when all failed.
pub(crate) async fn upgrade(plan: UpgradePlan, observer: Arc<dyn ChannelObserver>) -> Option<SharedLink> {
    let mut attempts = Race::new(observer, plan.channel_timeout);
    for endpoint in plan.candidates {
        let attempt = attempt_direct(
            Arc::clone(&plan.channel),
            ChannelKind::PeerToPeer,
            endpoint.clone(),
            plan.identity.clone(),
            Some(plan.device_fingerprint.clone()),
        );
        attempts.spawn(ChannelKind::PeerToPeer, Some(endpoint), attempt);
    }

    while let Some(joined) = attempts.next().await {
        if let Some(winner) = joined {
            attempts.abandon();
            return Some(winner.link);
        }
    }
    tracing::debug!("no peer-to-peer candidate reachable");
    None
}

#[cfg(all(test, feature = "device"))]
mod tests {
    use super::*;
    use crate::core::{Error, Result};
    use crate::device::DeviceHost;
    use crate::transport::memory::MemoryNetwork;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<Option<Result<()>>>>);

    impl ChannelObserver for Outcomes {
        fn attempt_started(&self, _kind: ChannelKind, _endpoint: Option<Endpoint>) -> usize {
            let mut outcomes = self.0.lock();
            outcomes.push(None);
            outcomes.len() - 1
        }

        fn attempt_finished(&self, index: usize, outcome: Result<()>) {
            self.0.lock()[index] = Some(outcome);
        }
    }

    fn plan(network: Arc<MemoryNetwork>, candidates: Vec<Endpoint>, device: &DeviceHost) -> UpgradePlan {
        UpgradePlan {
            channel: network,
            candidates,
            identity: LocalIdentity::default(),
            device_fingerprint: device.fingerprint(),
            channel_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_upgrade_finds_device() {
        let network = Arc::new(MemoryNetwork::new());
        let device = Arc::new(DeviceHost::new("pr", "de"));
        network.add_host(Endpoint::new("10.0.0.2", 5592), Arc::clone(&device));

        let candidates = vec![Endpoint::new("10.0.0.1", 5592), Endpoint::new("10.0.0.2", 5592)];
        let link = upgrade(plan(network, candidates, &device), Arc::new(Outcomes::default())).await;
        assert_eq!(link.unwrap().peer_fingerprint(), device.fingerprint());
    }

    #[tokio::test]
    async fn test_upgrade_rejects_other_device() {
        let network = Arc::new(MemoryNetwork::new());
        let device = Arc::new(DeviceHost::new("pr", "de"));
        let impostor = Arc::new(DeviceHost::new("pr", "de"));
        network.add_host(Endpoint::new("10.0.0.3", 5592), impostor);

        let outcomes = Arc::new(Outcomes::default());
        let link = upgrade(
            plan(network, vec![Endpoint::new("10.0.0.3", 5592)], &device),
            outcomes.clone(),
        )
        .await;
        assert!(link.is_none());
        assert_eq!(outcomes.0.lock()[0], Some(Err(Error::Unknown)));
    }
}
