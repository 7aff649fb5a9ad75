//! In-process network.
//!
//! [`MemoryNetwork`] implements [`SecureChannel`], [`Discovery`] and
//! [`RelayService`] on top of in-memory datagram queues. Devices are
//! [`DeviceHost`]s placed at endpoints; every established link spawns a serve
//! loop for the device end on the current runtime. Datagram loss and
//! reordering are deterministic so tests can reproduce them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{TransportError, TransportResult};
use crate::core::{
    DiscoveredDevice, Discovery, Endpoint, Error, Link, LocalIdentity, RelayRequest, RelayService,
    RelaySession, SecureChannel, SharedLink,
};
use crate::device::DeviceHost;

/// Datagram impairments applied to one direction of a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkConditions {
    /// Drop every n-th datagram.
    pub drop_every: Option<u32>,
    /// Hold back every n-th datagram by `reorder_delay`.
    pub reorder_every: Option<u32>,
    /// How long held-back datagrams are delayed.
    pub reorder_delay: Duration,
}

impl LinkConditions {
    /// No loss, no reordering.
    pub fn perfect() -> Self {
        Self::default()
    }

    /// Drop every `n`-th datagram.
    pub fn lossy(n: u32) -> Self {
        Self {
            drop_every: Some(n),
            ..Self::default()
        }
    }

    /// Additionally delay every `n`-th datagram by `delay`.
    pub fn reordering(mut self, n: u32, delay: Duration) -> Self {
        self.reorder_every = Some(n);
        self.reorder_delay = delay;
        self
    }

    fn hits(every: Option<u32>, count: u32) -> bool {
        every.is_some_and(|n| n > 0 && count % n == 0)
    }
}

/// One end of an in-memory link.
pub struct MemoryLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    peer_fingerprint: String,
    conditions: LinkConditions,
    sent: AtomicU32,
    partitioned: AtomicBool,
    closed: CancellationToken,
}

/// Create two connected links. The first end reports `peer` as its peer
/// fingerprint, the second reports `local`.
pub fn link_pair(
    local: &str,
    peer: &str,
    conditions: LinkConditions,
) -> (Arc<MemoryLink>, Arc<MemoryLink>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let end = |tx, rx, peer_fingerprint: &str| {
        Arc::new(MemoryLink {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            peer_fingerprint: peer_fingerprint.to_string(),
            conditions,
            sent: AtomicU32::new(0),
            partitioned: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    };
    (end(a_tx, a_rx, peer), end(b_tx, b_rx, local))
}

impl MemoryLink {
    /// Datagrams handed to [`Link::send`] so far, including dropped ones.
    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Silently drop everything sent on this end from now on. The link stays
    /// open, like a peer that vanished without a word.
    pub fn partition(&self) {
        self.partitioned.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, datagram: Bytes) -> TransportResult<()> {
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;

        if self.partitioned.load(Ordering::Relaxed) {
            return Ok(());
        }
        if LinkConditions::hits(self.conditions.drop_every, count) {
            tracing::trace!(count, "memory link dropped datagram");
            return Ok(());
        }
        if LinkConditions::hits(self.conditions.reorder_every, count) {
            let delay = self.conditions.reorder_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(datagram);
            });
            return Ok(());
        }

        tx.send(datagram).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            datagram = rx.recv() => datagram.ok_or(TransportError::Closed),
        }
    }

    fn peer_fingerprint(&self) -> String {
        self.peer_fingerprint.clone()
    }

    fn close(&self) {
        self.tx.lock().take();
        self.closed.cancel();
    }
}

impl fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLink")
            .field("peer_fingerprint", &self.peer_fingerprint)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

struct Relay {
    server_url: String,
    device: Arc<DeviceHost>,
    peer_candidates: Vec<Endpoint>,
}

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<Endpoint, Arc<DeviceHost>>,
    delays: HashMap<Endpoint, Duration>,
    announced: Vec<(Endpoint, Arc<DeviceHost>)>,
    relay: Option<Relay>,
    relay_delay: Duration,
    conditions: LinkConditions,
    links: Vec<Arc<MemoryLink>>,
}

/// In-process stand-in for the network, discovery and the relay server.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` reachable at `endpoint`.
    pub fn add_host(&self, endpoint: Endpoint, device: Arc<DeviceHost>) {
        self.state.lock().hosts.insert(endpoint, device);
    }

    /// Delay channel establishment towards `endpoint`.
    pub fn set_delay(&self, endpoint: Endpoint, delay: Duration) {
        self.state.lock().delays.insert(endpoint, delay);
    }

    /// Answer discovery lookups for `device` with `endpoint`.
    ///
    /// The endpoint is also made reachable.
    pub fn announce(&self, endpoint: Endpoint, device: Arc<DeviceHost>) {
        let mut state = self.state.lock();
        state.hosts.insert(endpoint.clone(), Arc::clone(&device));
        state.announced.push((endpoint, device));
    }

    /// Run a relay at `server_url` that reaches `device` and announces
    /// `peer_candidates` for an upgrade.
    pub fn set_relay(
        &self,
        server_url: impl Into<String>,
        device: Arc<DeviceHost>,
        peer_candidates: Vec<Endpoint>,
    ) {
        self.state.lock().relay = Some(Relay {
            server_url: server_url.into(),
            device,
            peer_candidates,
        });
    }

    /// Delay relay negotiations.
    pub fn set_relay_delay(&self, delay: Duration) {
        self.state.lock().relay_delay = delay;
    }

    /// Impairments for links created from now on.
    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.state.lock().conditions = conditions;
    }

    /// Client ends of every link created so far.
    pub fn links(&self) -> Vec<Arc<MemoryLink>> {
        self.state.lock().links.clone()
    }

    fn connect(&self, device: Arc<DeviceHost>, identity: &LocalIdentity) -> SharedLink {
        let conditions = self.state.lock().conditions;
        let (client, device_end) = link_pair(&identity.fingerprint, &device.fingerprint(), conditions);
        self.state.lock().links.push(Arc::clone(&client));
        tokio::spawn(device.serve(device_end));
        client
    }
}

#[async_trait]
impl SecureChannel for MemoryNetwork {
    async fn establish(
        &self,
        endpoint: &Endpoint,
        identity: &LocalIdentity,
    ) -> TransportResult<SharedLink> {
        let (device, delay) = {
            let state = self.state.lock();
            (
                state.hosts.get(endpoint).cloned(),
                state.delays.get(endpoint).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let device = device.ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;
        Ok(self.connect(device, identity))
    }
}

#[async_trait]
impl Discovery for MemoryNetwork {
    async fn lookup(&self, product_id: &str, device_id: &str) -> Result<DiscoveredDevice, Error> {
        let state = self.state.lock();
        state
            .announced
            .iter()
            .find(|(_, device)| device.product_id() == product_id && device.device_id() == device_id)
            .map(|(endpoint, device)| DiscoveredDevice {
                endpoint: endpoint.clone(),
                product_id: device.product_id().to_string(),
                device_id: device.device_id().to_string(),
            })
            .ok_or(Error::NotFound)
    }
}

#[async_trait]
impl RelayService for MemoryNetwork {
    async fn open(&self, request: &RelayRequest) -> TransportResult<RelaySession> {
        let (relay, delay) = {
            let state = self.state.lock();
            let relay = state.relay.as_ref().map(|relay| {
                (
                    relay.server_url.clone(),
                    Arc::clone(&relay.device),
                    relay.peer_candidates.clone(),
                )
            });
            (relay, state.relay_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let Some((server_url, device, peer_candidates)) = relay else {
            return Err(TransportError::Unreachable(request.server_url.clone()));
        };
        if server_url != request.server_url {
            return Err(TransportError::Unreachable(request.server_url.clone()));
        }
        if device.product_id() != request.product_id || device.device_id() != request.device_id {
            return Err(TransportError::RelayRejected(format!(
                "unknown device {}/{}",
                request.product_id, request.device_id
            )));
        }

        Ok(RelaySession {
            link: self.connect(device, &request.identity),
            peer_candidates,
        })
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryNetwork")
            .field("hosts", &state.hosts.len())
            .field("relay", &state.relay.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_pair_delivers() {
        let (a, b) = link_pair("a", "b", LinkConditions::perfect());
        assert_eq!(a.peer_fingerprint(), "b");
        assert_eq!(b.peer_fingerprint(), "a");

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_ref(), b"ping");
    }

    #[tokio::test]
    async fn test_drop_every() {
        let (a, b) = link_pair("a", "b", LinkConditions::lossy(2));
        for i in 1u8..=4 {
            a.send(Bytes::from(vec![i])).await.unwrap();
        }
        assert_eq!(b.recv().await.unwrap().as_ref(), &[1]);
        assert_eq!(b.recv().await.unwrap().as_ref(), &[3]);
        assert_eq!(a.sent(), 4);
    }

    #[tokio::test]
    async fn test_reorder_every() {
        let conditions = LinkConditions::perfect().reordering(2, Duration::from_millis(20));
        let (a, b) = link_pair("a", "b", conditions);
        a.send(Bytes::from_static(b"1")).await.unwrap();
        a.send(Bytes::from_static(b"2")).await.unwrap();
        a.send(Bytes::from_static(b"3")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().as_ref(), b"1");
        assert_eq!(b.recv().await.unwrap().as_ref(), b"3");
        assert_eq!(b.recv().await.unwrap().as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_partition_drops_silently() {
        let (a, b) = link_pair("a", "b", LinkConditions::perfect());
        a.partition();
        a.send(Bytes::from_static(b"lost")).await.unwrap();
        b.send(Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(a.recv().await.unwrap().as_ref(), b"kept");

        let silent = tokio::time::timeout(Duration::from_millis(50), b.recv()).await;
        assert!(silent.is_err());
        assert_eq!(a.sent(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (a, b) = link_pair("a", "b", LinkConditions::perfect());
        a.close();
        assert!(matches!(a.recv().await, Err(TransportError::Closed)));
        assert!(matches!(a.send(Bytes::new()).await, Err(TransportError::Closed)));
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let network = MemoryNetwork::new();
        let err = network
            .establish(&Endpoint::new("10.0.0.9", 1), &LocalIdentity::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_discovery() {
        let network = MemoryNetwork::new();
        let device = Arc::new(DeviceHost::new("pr-1", "de-1"));
        network.announce(Endpoint::new("192.168.1.20", 5592), device);

        let found = network.lookup("pr-1", "de-1").await.unwrap();
        assert_eq!(found.endpoint, Endpoint::new("192.168.1.20", 5592));
        assert_eq!(network.lookup("pr-1", "de-2").await, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn test_relay_rejects_unknown_device() {
        let network = MemoryNetwork::new();
        let device = Arc::new(DeviceHost::new("pr-1", "de-1"));
        network.set_relay("https://relay.test", device, Vec::new());

        let mut request = RelayRequest {
            server_url: "https://relay.test".into(),
            server_key: "sk".into(),
            server_jwt_token: None,
            product_id: "pr-1".into(),
            device_id: "de-9".into(),
            identity: LocalIdentity::default(),
        };
        assert!(matches!(
            network.open(&request).await,
            Err(TransportError::RelayRejected(_))
        ));

        request.device_id = "de-1".into();
        let session = network.open(&request).await.unwrap();
        assert!(session.peer_candidates.is_empty());
    }
}
