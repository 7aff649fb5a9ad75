//! Client end of a TCP tunnel.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::header::{TunnelStatus, TunnelTarget};
use super::bridge;
use crate::client::{ClientInner, ConnectionInner, ConnectionState};
use crate::completion::{Completion, Resolver};
use crate::core::constants::TUNNEL_STREAM_PORT;
use crate::core::{Error, Result};
use crate::stream::Stream;

/// Which local interfaces the tunnel listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ListenMode {
    /// Loopback only.
    #[default]
    Localhost,
    /// Every interface.
    Any,
}

impl ListenMode {
    fn address(self, port: u16) -> SocketAddr {
        match self {
            ListenMode::Localhost => SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            ListenMode::Any => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Opening,
    Listening(u16),
    Closed,
}

struct TunnelState {
    mode: ListenMode,
    phase: Phase,
}

/// Forwards a local TCP port to a target reachable from the device.
///
/// Every TCP client accepted on the local port is relayed over its own
/// stream. Closing or dropping the tunnel stops the listener and aborts the
/// relayed sockets.
pub struct TcpTunnel {
    connection: Arc<ConnectionInner>,
    client: Arc<ClientInner>,
    token: CancellationToken,
    state: Arc<Mutex<TunnelState>>,
}

impl TcpTunnel {
    pub(crate) fn new(connection: Arc<ConnectionInner>, client: Arc<ClientInner>) -> Self {
        Self {
            token: connection.child_token(),
            connection,
            client,
            state: Arc::new(Mutex::new(TunnelState {
                mode: ListenMode::default(),
                phase: Phase::Idle,
            })),
        }
    }

    /// Choose the listening interfaces. Only legal before `open`.
    pub fn set_listen_mode(&self, mode: ListenMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Idle {
            return Err(Error::InvalidState);
        }
        state.mode = mode;
        Ok(())
    }

    /// Listen on `local_port` (zero picks a free port) and forward every
    /// accepted socket to `remote_host:remote_port` as seen from the device.
    ///
    /// Resolves once the listener is bound.
    pub fn open(&self, local_port: u16, remote_host: &str, remote_port: u16) -> Completion<()> {
        let target = match TunnelTarget::new(remote_host, remote_port) {
            Ok(target) => target,
            Err(e) => return Completion::immediate(Err(e)),
        };
        let address = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Idle => {}
                Phase::Opening => return Completion::immediate(Err(Error::OperationInProgress)),
                _ => return Completion::immediate(Err(Error::InvalidState)),
            }
            if self.connection.state() != ConnectionState::Connected {
                return Completion::immediate(Err(Error::InvalidState));
            }
            state.phase = Phase::Opening;
            state.mode.address(local_port)
        };

        let (completion, resolver) = Completion::pending();
        let listener = Listener {
            connection: Arc::clone(&self.connection),
            client: Arc::clone(&self.client),
            token: self.token.clone(),
            state: Arc::clone(&self.state),
            target,
        };
        self.connection
            .handle()
            .spawn(listener.run(address, resolver));
        completion
    }

    /// Port the tunnel listens on, once open.
    pub fn local_port(&self) -> Result<u16> {
        match self.state.lock().phase {
            Phase::Listening(port) => Ok(port),
            _ => Err(Error::InvalidState),
        }
    }

    /// Stop listening and abort every relayed socket.
    pub fn close(&self) {
        self.state.lock().phase = Phase::Closed;
        self.token.cancel();
    }
}

impl Drop for TcpTunnel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for TcpTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TcpTunnel")
            .field("mode", &state.mode)
            .field("phase", &state.phase)
            .finish()
    }
}

fn bind_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => Error::InvalidArgument,
        _ => Error::Unknown,
    }
}

/// The accept loop of one opened tunnel.
struct Listener {
    connection: Arc<ConnectionInner>,
    client: Arc<ClientInner>,
    token: CancellationToken,
    state: Arc<Mutex<TunnelState>>,
    target: TunnelTarget,
}

impl Listener {
    async fn run(self, address: SocketAddr, resolver: Resolver<()>) {
        let bound = TcpListener::bind(address)
            .await
            .and_then(|listener| Ok((listener.local_addr()?.port(), listener)));
        let listener = {
            let mut state = self.state.lock();
            match bound {
                Ok((port, listener)) if state.phase == Phase::Opening => {
                    state.phase = Phase::Listening(port);
                    listener
                }
                Ok(_) => {
                    drop(state);
                    resolver.fail(Error::Aborted);
                    return;
                }
                Err(e) => {
                    tracing::debug!(%address, error = %e, "tunnel listener not bound");
                    if state.phase == Phase::Opening {
                        state.phase = Phase::Idle;
                    }
                    drop(state);
                    resolver.fail(bind_error(e));
                    return;
                }
            }
        };
        tracing::info!(%address, target = %self.target, "tunnel listening");
        resolver.complete();

        let forwarder = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = forwarder.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, "tunnel client accepted");
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::trace!(%peer, error = %e, "TCP_NODELAY not set");
                    }
                    let handle = forwarder.connection.handle().clone();
                    let forwarder = Arc::clone(&forwarder);
                    handle.spawn(async move {
                        tokio::select! {
                            _ = forwarder.token.cancelled() => {}
                            result = forwarder.forward(socket) => {
                                if let Err(e) = result {
                                    tracing::debug!(%peer, error = %e, "tunnel socket ended");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tunnel accept failed");
                }
            }
        }
        tracing::debug!(target = %forwarder.target, "tunnel listener stopped");
    }

    async fn forward(&self, socket: TcpStream) -> Result<()> {
        let shared = self.connection.open_stream()?;
        let stream = Stream::new(shared, Some(Arc::clone(&self.client)));
        stream.open(TUNNEL_STREAM_PORT).outcome().await?;
        stream.write(self.target.encode()).outcome().await?;

        match TunnelStatus::read_from(&stream).await? {
            TunnelStatus::Connected => {}
            status => {
                tracing::info!(target = %self.target, ?status, "device declined tunnel");
                return Err(Error::NotFound);
            }
        }
        bridge(&stream, socket).await
    }
}
