//! Connections.
//!
//! A [`Connection`] is configured, then `connect` races every enabled channel
//! kind and commits to the first link that comes up. Streams and requests run
//! on top of whatever link is active; a relayed connection may later swap to
//! a peer-to-peer link without the application noticing.
//!
//! Lock order: `shared` before `streams` and `requests`. Stream drivers and
//! request tasks read the active link through `shared` at every send.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::client::{ClientInner, Environment};
use super::options::{ConnectionOptions, KeepAliveSettings};
use crate::channel::{
    ChannelKind, ChannelObserver, ChannelRecord, ChannelState, DirectAttempt, EstablishedChannel,
    LocalAttempt, RacePlan, RelayAttempt, UpgradePlan, race, status_code, upgrade,
};
use crate::completion::{Completion, Resolver};
use crate::core::constants::{CLOSE_ATTEMPTS, CLOSE_RETRY_INTERVAL, UPGRADE_GRACE};
use crate::core::{Endpoint, Error, LocalIdentity, RelayRequest, Result, SharedLink};
use crate::crypto::PrivateKey;
use crate::request::{Method, RequestCodec, RequestExchange};
use crate::stream::{FrameSink, Stream, StreamEngine, StreamShared, spawn_stream};
use crate::transport::Frame;
#[cfg(feature = "tunnel")]
use crate::tunnel::TcpTunnel;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Being configured.
    Unconfigured,
    /// Channels are being attempted.
    Connecting,
    /// A channel is active.
    Connected,
    /// Close in progress.
    Closing,
    /// Closed, failed to connect, or torn down.
    Closed,
}

impl ConnectionState {
    /// Uppercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Unconfigured => "UNCONFIGURED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a connected connection reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// Through the relay.
    Relay,
    /// Over a direct path: local, direct candidate or peer-to-peer.
    Direct,
}

impl From<ChannelKind> for ConnectionType {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Relay => ConnectionType::Relay,
            ChannelKind::Local | ChannelKind::Direct | ChannelKind::PeerToPeer => {
                ConnectionType::Direct
            }
        }
    }
}

/// Snapshot of a connection and its channel attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionInfo {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Active connection type, when connected.
    #[serde(rename = "Type")]
    pub connection_type: Option<ConnectionType>,
    /// Local discovery status code.
    pub local: &'static str,
    /// Relay status code.
    pub relay: &'static str,
    /// Direct candidates status code.
    pub direct: &'static str,
    /// Peer-to-peer upgrade status code.
    pub peer_to_peer: &'static str,
}

#[derive(Default)]
struct DirectCandidates {
    enabled: bool,
    ended: bool,
    endpoints: Vec<Endpoint>,
    tx: Option<mpsc::UnboundedSender<Endpoint>>,
}

struct ActiveChannel {
    kind: ChannelKind,
    link: SharedLink,
    /// Bumped on every link swap.
    generation: u64,
}

struct ConnectionShared {
    state: ConnectionState,
    options: ConnectionOptions,
    direct: DirectCandidates,
    active: Option<ActiveChannel>,
    records: Vec<ChannelRecord>,
    failure: Option<Error>,
}

fn identity_of(options: &ConnectionOptions) -> Option<LocalIdentity> {
    let key = options.private_key.as_ref()?;
    Some(LocalIdentity {
        fingerprint: key.fingerprint(),
        app_name: options.app_name.clone(),
        app_version: options.app_version.clone(),
    })
}

/// Give up on every attempt still running.
fn settle_attempts(records: &mut [ChannelRecord], err: Error) {
    for record in records
        .iter_mut()
        .filter(|r| r.state == ChannelState::Attempting)
    {
        record.finish(Err(err));
    }
}

/// Connection state shared with the dispatcher tasks.
pub(crate) struct ConnectionInner {
    env: Arc<Environment>,
    token: CancellationToken,
    shared: Mutex<ConnectionShared>,
    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    requests: Mutex<HashMap<u32, oneshot::Sender<Bytes>>>,
    next_stream: AtomicU32,
    next_token: AtomicU32,
    close_ack: Notify,
    /// Datagrams received on any link, for keep-alive.
    received: AtomicU64,
}

impl ConnectionInner {
    fn new(env: Arc<Environment>) -> Arc<Self> {
        let inner = Arc::new(Self {
            token: env.child_token(),
            env,
            shared: Mutex::new(ConnectionShared {
                state: ConnectionState::Unconfigured,
                options: ConnectionOptions::default(),
                direct: DirectCandidates::default(),
                active: None,
                records: Vec::new(),
                failure: None,
            }),
            streams: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(1),
            next_token: AtomicU32::new(rand::random()),
            close_ack: Notify::new(),
            received: AtomicU64::new(0),
        });
        inner.env.register(&inner);
        inner
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    fn configure(&self, f: impl FnOnce(&mut ConnectionOptions) -> Result<()>) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state != ConnectionState::Unconfigured {
            return Err(Error::InvalidState);
        }
        f(&mut shared.options)
    }

    fn options_json(&self) -> String {
        self.shared.lock().options.to_json()
    }

    fn enable_direct_candidates(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state != ConnectionState::Unconfigured {
            return Err(Error::InvalidState);
        }
        shared.direct.enabled = true;
        Ok(())
    }

    fn add_direct_candidate(&self, endpoint: Endpoint) -> Result<()> {
        let mut shared = self.shared.lock();
        if !matches!(
            shared.state,
            ConnectionState::Unconfigured | ConnectionState::Connecting
        ) || !shared.direct.enabled
            || shared.direct.ended
        {
            return Err(Error::InvalidState);
        }
        if let Some(tx) = &shared.direct.tx {
            let _ = tx.send(endpoint.clone());
        }
        tracing::debug!(%endpoint, "direct candidate added");
        shared.direct.endpoints.push(endpoint);
        Ok(())
    }

    fn end_of_direct_candidates(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        if !shared.direct.enabled {
            return Err(Error::InvalidState);
        }
        shared.direct.ended = true;
        shared.direct.tx = None;
        Ok(())
    }

    // =========================================================================
    // Connect
    // =========================================================================

    fn connect(self: &Arc<Self>) -> Completion<()> {
        if self.env.is_stopped() {
            return Completion::immediate(Err(Error::Stopped));
        }

        let (plan, connect_timeout) = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Unconfigured {
                return Completion::immediate(Err(Error::InvalidState));
            }
            let plan = match self.plan(&mut shared) {
                Ok(plan) => plan,
                Err(e) => return Completion::immediate(Err(e)),
            };
            shared.state = ConnectionState::Connecting;
            (plan, shared.options.connect_timeout)
        };

        tracing::debug!(
            local = plan.local.is_some(),
            relay = plan.relay.is_some(),
            direct = plan.direct.is_some(),
            "connecting"
        );
        let (completion, resolver) = Completion::pending();
        self.env
            .handle
            .spawn(Arc::clone(self).run_connect(plan, connect_timeout, resolver));
        completion
    }

    fn plan(&self, shared: &mut ConnectionShared) -> Result<RacePlan> {
        let options = &shared.options;
        let (Some(product_id), Some(device_id), Some(identity)) = (
            options.product_id.clone(),
            options.device_id.clone(),
            identity_of(options),
        ) else {
            return Err(Error::InvalidState);
        };

        let local = match (options.local_enabled(), &self.env.discovery, &self.env.secure_channel) {
            (true, Some(discovery), Some(channel)) => Some(LocalAttempt {
                discovery: Arc::clone(discovery),
                channel: Arc::clone(channel),
                product_id: product_id.clone(),
                device_id: device_id.clone(),
            }),
            _ => None,
        };

        let relay = match (options.remote_enabled(), &self.env.relay) {
            (true, Some(service)) => Some(RelayAttempt {
                service: Arc::clone(service),
                request: RelayRequest {
                    server_url: options.server_url.clone().unwrap_or_default(),
                    server_key: options.server_key.clone().unwrap_or_default(),
                    server_jwt_token: options.server_jwt_token.clone(),
                    product_id,
                    device_id,
                    identity: identity.clone(),
                },
            }),
            _ => None,
        };

        let mut candidates_tx = None;
        let direct = match (shared.direct.enabled, &self.env.secure_channel) {
            (true, Some(channel)) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for endpoint in &shared.direct.endpoints {
                    let _ = tx.send(endpoint.clone());
                }
                if !shared.direct.ended {
                    candidates_tx = Some(tx);
                }
                Some(DirectAttempt {
                    channel: Arc::clone(channel),
                    candidates: rx,
                })
            }
            _ => None,
        };

        let plan = RacePlan {
            identity,
            channel_timeout: options.channel_timeout,
            local,
            relay,
            direct,
        };
        if !plan.has_attempts() {
            return Err(Error::InvalidState);
        }
        shared.direct.tx = candidates_tx;
        Ok(plan)
    }

    async fn run_connect(
        self: Arc<Self>,
        plan: RacePlan,
        connect_timeout: Duration,
        resolver: Resolver<()>,
    ) {
        let observer: Arc<dyn ChannelObserver> = self.clone();
        let raced = tokio::select! {
            _ = self.token.cancelled() => Err(self.failure()),
            raced = tokio::time::timeout(connect_timeout, race(plan, observer)) => {
                raced.unwrap_or(Err(Error::Timeout))
            }
        };

        match raced.and_then(|channel| self.commit(channel)) {
            Ok(upgrade_plan) => {
                resolver.complete();
                if let Some(plan) = upgrade_plan {
                    self.env.handle.spawn(Arc::clone(&self).run_upgrade(plan));
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "connect failed");
                self.fail_connect(e);
                resolver.fail(e);
            }
        }
    }

    fn commit(self: &Arc<Self>, channel: EstablishedChannel) -> Result<Option<UpgradePlan>> {
        let (upgrade_plan, keep_alive) = {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connecting {
                let failure = shared.failure.unwrap_or(Error::Aborted);
                drop(shared);
                channel.link.close();
                return Err(failure);
            }

            shared.state = ConnectionState::Connected;
            settle_attempts(&mut shared.records, Error::Aborted);
            shared.direct.tx = None;
            shared.active = Some(ActiveChannel {
                kind: channel.kind,
                link: Arc::clone(&channel.link),
                generation: 0,
            });

            let options = &shared.options;
            let upgrade_plan = match (&self.env.secure_channel, identity_of(options)) {
                (Some(secure), Some(identity))
                    if channel.kind == ChannelKind::Relay
                        && options.rendezvous
                        && !channel.peer_candidates.is_empty() =>
                {
                    Some(UpgradePlan {
                        channel: Arc::clone(secure),
                        candidates: channel.peer_candidates.clone(),
                        identity,
                        device_fingerprint: channel.link.peer_fingerprint(),
                        channel_timeout: options.channel_timeout,
                    })
                }
                _ => None,
            };
            (upgrade_plan, options.keep_alive)
        };

        tracing::info!(kind = %channel.kind, device = %channel.link.peer_fingerprint(), "connected");
        self.spawn_receiver(channel.link, 0);
        if keep_alive.enabled() {
            self.env
                .handle
                .spawn(Arc::clone(self).keep_alive(keep_alive));
        }
        Ok(upgrade_plan)
    }

    fn fail_connect(&self, err: Error) {
        {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Connecting {
                shared.state = ConnectionState::Closed;
                shared.failure = Some(err);
                shared.direct.tx = None;
                settle_attempts(&mut shared.records, err);
            }
        }
        self.token.cancel();
    }

    async fn run_upgrade(self: Arc<Self>, plan: UpgradePlan) {
        self.set_relay_state(ChannelState::Upgrading);
        let observer: Arc<dyn ChannelObserver> = self.clone();
        let link = tokio::select! {
            _ = self.token.cancelled() => return,
            link = upgrade(plan, observer) => link,
        };
        self.set_relay_state(ChannelState::Established);
        let Some(link) = link else {
            return;
        };

        let swapped = {
            let mut shared = self.shared.lock();
            let connected = shared.state == ConnectionState::Connected;
            match shared.active.as_mut() {
                Some(active) if connected => {
                    active.kind = ChannelKind::PeerToPeer;
                    active.generation += 1;
                    let old = std::mem::replace(&mut active.link, Arc::clone(&link));
                    Some((old, active.generation))
                }
                _ => None,
            }
        };
        let Some((old, generation)) = swapped else {
            link.close();
            return;
        };

        tracing::info!(generation, "upgraded to peer-to-peer");
        self.spawn_receiver(link, generation);

        // The replaced link keeps receiving for a while so nothing in flight
        // on it is lost.
        let token = self.token.clone();
        self.env.handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(UPGRADE_GRACE) => {}
                _ = token.cancelled() => {}
            }
            old.close();
        });
    }

    fn set_relay_state(&self, state: ChannelState) {
        let mut shared = self.shared.lock();
        for record in shared.records.iter_mut().filter(|r| {
            r.kind == ChannelKind::Relay
                && matches!(r.state, ChannelState::Established | ChannelState::Upgrading)
        }) {
            record.state = state;
        }
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    fn spawn_receiver(self: &Arc<Self>, link: SharedLink, generation: u64) {
        self.env
            .handle
            .spawn(Arc::clone(self).receive(link, generation));
    }

    async fn receive(self: Arc<Self>, link: SharedLink, generation: u64) {
        loop {
            let received = tokio::select! {
                _ = self.token.cancelled() => return,
                received = link.recv() => received,
            };
            match received {
                Ok(datagram) => {
                    self.received.fetch_add(1, Ordering::Relaxed);
                    self.dispatch(&link, datagram).await;
                }
                Err(e) => {
                    tracing::debug!(generation, error = %e, "link closed");
                    break;
                }
            }
        }
        self.link_lost(generation);
    }

    async fn dispatch(&self, link: &SharedLink, datagram: Bytes) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(error = %e, "dropping malformed datagram");
                return;
            }
        };

        match frame {
            Frame::Response { token, body } => {
                if let Some(tx) = self.requests.lock().remove(&token) {
                    let _ = tx.send(body);
                }
            }
            Frame::CloseAck => self.close_ack.notify_one(),
            Frame::Close => {
                tracing::info!("device closed the connection");
                let _ = link.send(Frame::CloseAck.encode()).await;
                self.teardown(Error::Aborted, false);
            }
            Frame::KeepAlive => {
                let _ = link.send(Frame::KeepAliveAck.encode()).await;
            }
            Frame::Hello { .. }
            | Frame::HelloAck { .. }
            | Frame::Request { .. }
            | Frame::KeepAliveAck => {
                tracing::trace!(frame = ?frame.frame_type(), "ignoring frame");
            }
            frame => {
                let Some(stream_id) = frame.stream_id() else {
                    return;
                };
                let stream = self.streams.lock().get(&stream_id).cloned();
                match stream {
                    Some(stream) => stream.deliver(frame),
                    None if !matches!(frame, Frame::StreamRst { .. }) => {
                        let _ = link.send(Frame::StreamRst { stream_id }.encode()).await;
                    }
                    None => {}
                }
            }
        }
    }

    /// Send keep-alives while the connection is silent; tear down with
    /// [`Error::Timeout`] once they go unanswered.
    async fn keep_alive(self: Arc<Self>, settings: KeepAliveSettings) {
        let mut seen = self.received.load(Ordering::Relaxed);
        let mut unanswered = 0u32;
        let mut wait = settings.interval;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            let received = self.received.load(Ordering::Relaxed);
            if received != seen {
                seen = received;
                unanswered = 0;
                wait = settings.interval;
                continue;
            }
            if unanswered == settings.max_retries {
                tracing::warn!(unanswered, "keep-alive expired");
                self.teardown(Error::Timeout, false);
                return;
            }

            unanswered += 1;
            tracing::trace!(attempt = unanswered, "sending keep-alive");
            if let Err(e) = self.send_frame(Frame::KeepAlive).await {
                tracing::debug!(error = %e, "keep-alive not sent");
            }
            wait = settings.retry_interval;
        }
    }

    fn link_lost(&self, generation: u64) {
        let active = {
            let shared = self.shared.lock();
            shared.state == ConnectionState::Connected
                && shared
                    .active
                    .as_ref()
                    .is_some_and(|active| active.generation == generation)
        };
        if active {
            tracing::warn!(generation, "active link lost");
            self.teardown(Error::Aborted, false);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Fail everything with `err` and drop the link. With `farewell`, a close
    /// frame is sent first.
    pub(crate) fn teardown(&self, err: Error, farewell: bool) {
        let active = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            shared.failure = Some(err);
            shared.direct.tx = None;
            settle_attempts(&mut shared.records, err);
            shared.active.take()
        };

        self.token.cancel();
        self.fail_children(err);

        if let Some(active) = active {
            let link = active.link;
            if farewell {
                self.env.handle.spawn(async move {
                    let _ = link.send(Frame::Close.encode()).await;
                    link.close();
                });
            } else {
                link.close();
            }
        }
        tracing::debug!(error = %err, "connection torn down");
    }

    fn fail_children(&self, err: Error) {
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.fail(err);
        }
        self.requests.lock().clear();
    }

    fn close(self: &Arc<Self>) -> Completion<()> {
        {
            let mut shared = self.shared.lock();
            if shared.state != ConnectionState::Connected {
                return Completion::immediate(Err(Error::InvalidState));
            }
            shared.state = ConnectionState::Closing;
            shared.failure = Some(Error::Aborted);
        }
        self.fail_children(Error::Aborted);

        let (completion, resolver) = Completion::pending();
        self.env.handle.spawn(Arc::clone(self).run_close(resolver));
        completion
    }

    async fn run_close(self: Arc<Self>, resolver: Resolver<()>) {
        let mut acknowledged = false;
        for attempt in 1..=CLOSE_ATTEMPTS {
            let Some(link) = self.link() else {
                break;
            };
            if let Err(e) = link.send(Frame::Close.encode()).await {
                tracing::debug!(error = %e, "close frame not sent");
                break;
            }
            tokio::select! {
                _ = self.close_ack.notified() => {
                    acknowledged = true;
                    break;
                }
                _ = tokio::time::sleep(CLOSE_RETRY_INTERVAL) => {
                    tracing::trace!(attempt, "close not acknowledged yet");
                }
                _ = self.token.cancelled() => break,
            }
        }
        if !acknowledged {
            tracing::debug!("closing without acknowledgement");
        }

        let active = {
            let mut shared = self.shared.lock();
            if shared.state == ConnectionState::Closing {
                shared.state = ConnectionState::Closed;
            }
            shared.active.take()
        };
        self.token.cancel();
        if let Some(active) = active {
            active.link.close();
        }

        if self.env.is_stopped() {
            resolver.fail(Error::Stopped);
        } else {
            tracing::info!("connection closed");
            resolver.complete();
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub(crate) fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn active<R>(&self, f: impl FnOnce(&ActiveChannel) -> R) -> Result<R> {
        let shared = self.shared.lock();
        match (&shared.state, &shared.active) {
            (ConnectionState::Connected, Some(active)) => Ok(f(active)),
            _ => Err(Error::NotConnected),
        }
    }

    fn info(&self) -> ConnectionInfo {
        let shared = self.shared.lock();
        let connection_type = match (&shared.state, &shared.active) {
            (ConnectionState::Connected, Some(active)) => Some(active.kind.into()),
            _ => None,
        };
        ConnectionInfo {
            state: shared.state,
            connection_type,
            local: status_code(&shared.records, ChannelKind::Local),
            relay: status_code(&shared.records, ChannelKind::Relay),
            direct: status_code(&shared.records, ChannelKind::Direct),
            peer_to_peer: status_code(&shared.records, ChannelKind::PeerToPeer),
        }
    }

    /// Error pending work fails with once the connection is gone.
    pub(crate) fn failure(&self) -> Error {
        self.shared.lock().failure.unwrap_or(Error::Aborted)
    }

    // =========================================================================
    // Streams and requests
    // =========================================================================

    pub(crate) fn open_stream(self: &Arc<Self>) -> Result<Arc<StreamShared>> {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Connected {
            return Err(Error::InvalidState);
        }
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        let sink: Arc<dyn FrameSink> = self.clone();
        let stream = spawn_stream(&self.env.handle, StreamEngine::initiator(id), sink);
        self.streams.lock().insert(id, Arc::clone(&stream));
        drop(shared);
        Ok(stream)
    }

    pub(crate) fn codec(&self) -> Arc<dyn RequestCodec> {
        Arc::clone(&self.env.codec)
    }

    pub(crate) fn handle(&self) -> &tokio::runtime::Handle {
        &self.env.handle
    }

    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.shared.lock().options.request_timeout
    }

    pub(crate) fn next_request_token(&self) -> u32 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Route the response for `token` to `tx`.
    pub(crate) fn register_request(&self, token: u32, tx: oneshot::Sender<Bytes>) -> Result<()> {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Connected {
            return Err(shared.failure.unwrap_or(Error::NotConnected));
        }
        self.requests.lock().insert(token, tx);
        Ok(())
    }

    pub(crate) fn unregister_request(&self, token: u32) {
        self.requests.lock().remove(&token);
    }

    /// Send `frame` on the active link.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        let link = self.link().ok_or(Error::NotConnected)?;
        link.send(frame.encode()).await.map_err(Error::from)
    }
}

impl FrameSink for ConnectionInner {
    fn link(&self) -> Option<SharedLink> {
        self.shared
            .lock()
            .active
            .as_ref()
            .map(|active| Arc::clone(&active.link))
    }

    fn unregister_stream(&self, stream_id: u32) {
        self.streams.lock().remove(&stream_id);
    }
}

impl ChannelObserver for ConnectionInner {
    fn attempt_started(&self, kind: ChannelKind, endpoint: Option<Endpoint>) -> usize {
        let mut shared = self.shared.lock();
        shared.records.push(ChannelRecord::attempting(kind, endpoint));
        shared.records.len() - 1
    }

    fn attempt_finished(&self, index: usize, outcome: Result<()>) {
        if let Some(record) = self.shared.lock().records.get_mut(index) {
            if record.state == ChannelState::Attempting {
                record.finish(outcome);
            }
        }
    }
}

/// A logical connection to one device.
///
/// Configuration is write-once: setters fail with [`Error::InvalidState`]
/// once `connect` was called. Dropping the connection tears it down; every
/// pending operation on it, its streams and its requests resolves with
/// [`Error::Aborted`].
pub struct Connection {
    inner: Arc<ConnectionInner>,
    client: Arc<ClientInner>,
}

impl Connection {
    pub(crate) fn new(client: Arc<ClientInner>) -> Self {
        Self {
            inner: ConnectionInner::new(Arc::clone(&client.env)),
            client,
        }
    }

    fn set(&self, f: impl FnOnce(&mut ConnectionOptions)) -> Result<()> {
        self.inner.configure(|options| {
            f(options);
            Ok(())
        })
    }

    /// Set the product id of the target device.
    pub fn set_product_id(&self, product_id: &str) -> Result<()> {
        self.set(|o| o.product_id = Some(product_id.to_string()))
    }

    /// Set the device id of the target device.
    pub fn set_device_id(&self, device_id: &str) -> Result<()> {
        self.set(|o| o.device_id = Some(device_id.to_string()))
    }

    /// Set the relay server url.
    pub fn set_server_url(&self, server_url: &str) -> Result<()> {
        self.set(|o| o.server_url = Some(server_url.to_string()))
    }

    /// Set the key identifying the application at the relay server.
    pub fn set_server_key(&self, server_key: &str) -> Result<()> {
        self.set(|o| o.server_key = Some(server_key.to_string()))
    }

    /// Set a bearer token presented to the relay server.
    pub fn set_server_jwt_token(&self, token: &str) -> Result<()> {
        self.set(|o| o.server_jwt_token = Some(token.to_string()))
    }

    /// Set the client identity from a hex encoded private key.
    pub fn set_private_key(&self, private_key: &str) -> Result<()> {
        let key = PrivateKey::from_hex(private_key)?;
        self.set(|o| o.private_key = Some(key))
    }

    /// Set the application name presented to the device.
    pub fn set_application_name(&self, name: &str) -> Result<()> {
        self.set(|o| o.app_name = Some(name.to_string()))
    }

    /// Set the application version presented to the device.
    pub fn set_application_version(&self, version: &str) -> Result<()> {
        self.set(|o| o.app_version = Some(version.to_string()))
    }

    /// Enable or disable local discovery.
    pub fn set_local(&self, enabled: bool) -> Result<()> {
        self.set(|o| o.local = enabled)
    }

    /// Enable or disable the relay.
    pub fn set_remote(&self, enabled: bool) -> Result<()> {
        self.set(|o| o.remote = enabled)
    }

    /// Enable or disable the peer-to-peer upgrade of relayed connections.
    pub fn set_rendezvous(&self, enabled: bool) -> Result<()> {
        self.set(|o| o.rendezvous = enabled)
    }

    /// Use direct candidates only.
    pub fn set_direct_only(&self, enabled: bool) -> Result<()> {
        self.set(|o| o.direct_only = enabled)
    }

    /// Bound the whole connect operation.
    pub fn set_connect_timeout(&self, timeout: Duration) -> Result<()> {
        self.set(|o| o.connect_timeout = timeout)
    }

    /// Bound each channel attempt.
    pub fn set_channel_timeout(&self, timeout: Duration) -> Result<()> {
        self.set(|o| o.channel_timeout = timeout)
    }

    /// Bound how long requests wait for their response.
    pub fn set_request_timeout(&self, timeout: Duration) -> Result<()> {
        self.set(|o| o.request_timeout = timeout)
    }

    /// Configure liveness probing. A zero `interval` disables it.
    pub fn set_keep_alive(
        &self,
        interval: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Result<()> {
        self.set(|o| {
            o.keep_alive = KeepAliveSettings {
                interval,
                retry_interval,
                max_retries,
            }
        })
    }

    /// Apply options from a JSON object. See [`ConnectionOptions`].
    pub fn set_options(&self, json: &str) -> Result<()> {
        self.inner
            .configure(|o| o.apply_json(json).map_err(Error::from))
    }

    /// Current options as JSON, without the private key.
    pub fn options_json(&self) -> String {
        self.inner.options_json()
    }

    /// Accept direct candidates for this connection.
    pub fn enable_direct_candidates(&self) -> Result<()> {
        self.inner.enable_direct_candidates()
    }

    /// Add a direct candidate. Legal before and during connect, until
    /// [`Connection::end_of_direct_candidates`].
    pub fn add_direct_candidate(&self, host: &str, port: u16) -> Result<()> {
        self.inner.add_direct_candidate(Endpoint::new(host, port))
    }

    /// No more direct candidates will be added.
    pub fn end_of_direct_candidates(&self) -> Result<()> {
        self.inner.end_of_direct_candidates()
    }

    /// Connect to the device.
    ///
    /// Resolves `Ok` once any channel is established, [`Error::NoChannels`]
    /// when none could be, [`Error::Timeout`] when the connect timeout
    /// passes first, and [`Error::InvalidState`] immediately when the
    /// connection is not fully configured or was connected before.
    pub fn connect(&self) -> Completion<()> {
        self.inner.connect()
    }

    /// Close the connection gracefully.
    pub fn close(&self) -> Completion<()> {
        self.inner.close()
    }

    /// Tear the connection down immediately.
    pub fn free(self) {}

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Relay or direct; only while connected.
    pub fn connection_type(&self) -> Result<ConnectionType> {
        self.inner.active(|active| active.kind.into())
    }

    /// Fingerprint of the connected device.
    pub fn device_fingerprint(&self) -> Result<String> {
        self.inner.active(|active| active.link.peer_fingerprint())
    }

    /// Fingerprint of the configured private key.
    pub fn client_fingerprint(&self) -> Result<String> {
        let shared = self.inner.shared.lock();
        shared
            .options
            .private_key
            .as_ref()
            .map(PrivateKey::fingerprint)
            .ok_or(Error::InvalidState)
    }

    /// Connection and channel status snapshot.
    pub fn info(&self) -> ConnectionInfo {
        self.inner.info()
    }

    /// [`Connection::info`] as JSON.
    pub fn info_json(&self) -> String {
        serde_json::to_string(&self.info()).unwrap_or_else(|_| String::from("{}"))
    }

    /// Create a stream. The connection must be connected.
    pub fn stream(&self) -> Result<Stream> {
        let shared = self.inner.open_stream()?;
        Ok(Stream::new(shared, Some(Arc::clone(&self.client))))
    }

    /// Create a request. `method` is one of `GET`, `POST`, `PUT`, `DELETE`.
    pub fn request(&self, method: &str, path: &str) -> Result<RequestExchange> {
        let method: Method = method.parse()?;
        if self.inner.state() != ConnectionState::Connected {
            return Err(Error::InvalidState);
        }
        Ok(RequestExchange::new(
            Arc::clone(&self.inner),
            Arc::clone(&self.client),
            method,
            path,
        ))
    }

    /// Create a TCP tunnel. The connection must be connected.
    #[cfg(feature = "tunnel")]
    pub fn tcp_tunnel(&self) -> Result<TcpTunnel> {
        if self.inner.state() != ConnectionState::Connected {
            return Err(Error::InvalidState);
        }
        Ok(TcpTunnel::new(
            Arc::clone(&self.inner),
            Arc::clone(&self.client),
        ))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.teardown(Error::Aborted, true);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
