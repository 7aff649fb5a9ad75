//! Client context.
//!
//! A [`Client`] owns the dispatcher runtime every connection, stream and
//! request runs on, and the collaborators channels are built from. Handles
//! created from it keep the runtime alive, so the client itself may be
//! dropped first.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, ConnectionInner};
use crate::completion::Completion;
use crate::core::{DiscoveredDevice, Discovery, Error, RelayService, Result, SecureChannel};
use crate::crypto::PrivateKey;
use crate::logging::{self, LogLevel};
use crate::request::{BinaryCodec, RequestCodec};

/// Name of the dispatcher threads.
const DISPATCH_THREAD_NAME: &str = "edgelink-dispatch";

/// Shared by a client and everything created from it.
pub(crate) struct Environment {
    pub(crate) handle: Handle,
    pub(crate) secure_channel: Option<Arc<dyn SecureChannel>>,
    pub(crate) discovery: Option<Arc<dyn Discovery>>,
    pub(crate) relay: Option<Arc<dyn RelayService>>,
    pub(crate) codec: Arc<dyn RequestCodec>,
    root: CancellationToken,
    stopped: AtomicBool,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
}

impl Environment {
    /// Token cancelled by [`Client::stop`].
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, connection: &Arc<ConnectionInner>) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.push(Arc::downgrade(connection));
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("client stopping");
        let connections: Vec<_> = self
            .connections
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for connection in connections {
            connection.teardown(Error::Stopped, true);
        }
        self.root.cancel();
    }
}

/// Owns the dispatcher runtime, when the client created it.
pub(crate) struct ClientInner {
    pub(crate) env: Arc<Environment>,
    runtime: Option<Runtime>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    worker_threads: usize,
    handle: Option<Handle>,
    secure_channel: Option<Arc<dyn SecureChannel>>,
    discovery: Option<Arc<dyn Discovery>>,
    relay: Option<Arc<dyn RelayService>>,
    codec: Arc<dyn RequestCodec>,
}

impl ClientBuilder {
    /// Create a builder with one dispatcher thread and the default
    /// collaborators.
    pub fn new() -> Self {
        Self {
            worker_threads: 1,
            handle: None,
            secure_channel: default_secure_channel(),
            discovery: None,
            relay: None,
            codec: Arc::new(BinaryCodec),
        }
    }

    /// Number of dispatcher threads of the owned runtime.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Dispatch on an existing runtime instead of creating one.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Secure channel used for local, direct and peer-to-peer channels.
    pub fn secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure_channel = Some(channel);
        self
    }

    /// Local discovery collaborator.
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Relay service collaborator.
    pub fn relay(mut self, relay: Arc<dyn RelayService>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Codec for request and response bodies.
    pub fn codec(mut self, codec: Arc<dyn RequestCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build the client, starting the dispatcher when needed.
    pub fn build(self) -> Result<Client> {
        let (handle, runtime) = match self.handle {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.worker_threads)
                    .thread_name(DISPATCH_THREAD_NAME)
                    .enable_all()
                    .build()
                    .map_err(|e| {
                        tracing::error!(error = %e, "dispatcher runtime did not start");
                        Error::Unknown
                    })?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let env = Arc::new(Environment {
            handle,
            secure_channel: self.secure_channel,
            discovery: self.discovery,
            relay: self.relay,
            codec: self.codec,
            root: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        });
        Ok(Client {
            inner: Arc::new(ClientInner { env, runtime }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "udp")]
fn default_secure_channel() -> Option<Arc<dyn SecureChannel>> {
    Some(Arc::new(crate::transport::udp::UdpChannel::new()))
}

#[cfg(not(feature = "udp"))]
fn default_secure_channel() -> Option<Arc<dyn SecureChannel>> {
    None
}

/// Entry point: creates connections and owns the dispatcher.
///
/// # Example
///
/// ```ignore
/// use edgelink::Client;
///
/// let client = Client::new()?;
/// let connection = client.connection();
/// connection.set_product_id("pr-12345678")?;
/// connection.set_device_id("de-abcdefgh")?;
/// connection.set_private_key(&client.create_private_key())?;
/// connection.enable_direct_candidates()?;
/// connection.add_direct_candidate("192.168.1.20", 5592)?;
/// connection.end_of_direct_candidates()?;
/// connection.connect().wait()?;
/// ```
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client with default settings.
    pub fn new() -> Result<Self> {
        ClientBuilder::new().build()
    }

    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create an unconfigured connection.
    pub fn connection(&self) -> Connection {
        Connection::new(Arc::clone(&self.inner))
    }

    /// Generate a new private key, hex encoded.
    pub fn create_private_key(&self) -> String {
        PrivateKey::generate().to_hex()
    }

    /// Look for a device on the local network.
    ///
    /// Resolves with [`Error::NotImplemented`] when the client has no
    /// discovery collaborator.
    pub fn discover(&self, product_id: &str, device_id: &str) -> Completion<DiscoveredDevice> {
        let env = &self.inner.env;
        if env.is_stopped() {
            return Completion::immediate(Err(Error::Stopped));
        }
        let Some(discovery) = env.discovery.clone() else {
            return Completion::immediate(Err(Error::NotImplemented));
        };

        let (completion, resolver) = Completion::pending();
        let token = env.child_token();
        let (product_id, device_id) = (product_id.to_string(), device_id.to_string());
        env.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => resolver.fail(Error::Stopped),
                found = discovery.lookup(&product_id, &device_id) => match found {
                    Ok(device) => resolver.succeed(device),
                    Err(e) => resolver.fail(e),
                },
            }
        });
        completion
    }

    /// Set the log level by name (`error`, `warn`, `info`, `debug`, `trace`).
    pub fn set_log_level(&self, level: &str) -> Result<()> {
        logging::set_level(level.parse::<LogLevel>()?)
    }

    /// Stop the client. Every pending operation resolves with
    /// [`Error::Stopped`] and every connection is torn down.
    pub fn stop(&self) {
        self.inner.env.stop();
    }

    /// Runtime the client dispatches on.
    pub fn handle(&self) -> &Handle {
        &self.inner.env.handle
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("stopped", &self.inner.env.is_stopped())
            .field("owns_runtime", &self.inner.runtime.is_some())
            .finish()
    }
}
