//! TCP tunnels over a connection.
//!
//! A [`TcpTunnel`] listens on a local TCP port. Every accepted socket gets its
//! own stream to the device's tunnel service, which connects to the requested
//! target and relays bytes both ways:
//!
//! ```text
//!      ┌────────┐  stream   ┌─────────────┐   tcp    ┌────────┐
//! ──tcp┤ Tunnel ├───~~~─────┤TunnelService├───~~~────┤ target │
//! port └────────┘           └─────────────┘          └────────┘
//! ```
//!
//! The stream starts with the target header followed by a one-byte status
//! from the device; after that it carries the raw TCP bytes. A TCP half-close
//! maps onto a stream close and back.

mod header;
mod listener;
#[cfg(feature = "device")]
mod service;

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::core::constants::TUNNEL_CHUNK_SIZE;
use crate::core::{Error, Result};
use crate::stream::Stream;

pub use header::{TunnelStatus, TunnelTarget};
pub use listener::{ListenMode, TcpTunnel};
#[cfg(feature = "device")]
pub use service::TunnelService;

fn socket_error(err: io::Error) -> Error {
    tracing::debug!(error = %err, "tunnel socket failed");
    Error::Aborted
}

/// Read exactly `n` bytes from `stream`.
async fn read_exact(stream: &Stream, n: usize) -> Result<Vec<u8>> {
    let read = stream.read_all(n);
    read.outcome().await?;
    read.into_output().ok_or(Error::NoData)
}

/// Relay bytes between `stream` and `socket` until both directions closed.
///
/// Fails as soon as either direction fails; the caller drops the stream,
/// which aborts it.
async fn bridge(stream: &Stream, socket: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    let upstream = async {
        let mut buf = vec![0u8; TUNNEL_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await.map_err(socket_error)?;
            if n == 0 {
                break;
            }
            stream.write(Bytes::copy_from_slice(&buf[..n])).outcome().await?;
        }
        stream.close().outcome().await
    };

    let downstream = async {
        loop {
            let read = stream.read_some(TUNNEL_CHUNK_SIZE);
            match read.outcome().await {
                Ok(()) => {
                    if let Some(data) = read.into_output() {
                        writer.write_all(&data).await.map_err(socket_error)?;
                    }
                }
                Err(Error::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        writer.shutdown().await.map_err(socket_error)
    };

    tokio::try_join!(upstream, downstream).map(|_| ())
}

#[cfg(all(test, feature = "device"))]
mod tests {
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener as StdListener, TcpStream as StdStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::client::{Client, Connection};
    use crate::core::Endpoint;
    use crate::core::constants::TUNNEL_STREAM_PORT;
    use crate::device::DeviceHost;
    use crate::transport::memory::MemoryNetwork;

    fn connected(service: TunnelService) -> (Client, Connection) {
        let network = Arc::new(MemoryNetwork::new());
        let device = Arc::new(DeviceHost::new("pr-1", "de-1"));
        device.add_stream_handler(TUNNEL_STREAM_PORT, service);
        network.announce(Endpoint::new("192.168.1.20", 5592), device);

        let client = Client::builder()
            .secure_channel(network.clone())
            .discovery(network.clone())
            .relay(network.clone())
            .build()
            .unwrap();
        let connection = client.connection();
        connection.set_product_id("pr-1").unwrap();
        connection.set_device_id("de-1").unwrap();
        connection
            .set_private_key(&client.create_private_key())
            .unwrap();
        connection.set_remote(false).unwrap();
        connection.connect().wait().unwrap();
        (client, connection)
    }

    /// TCP server that echoes one connection until the peer half-closes.
    fn echo_server() -> u16 {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).unwrap();
            }
            socket.shutdown(Shutdown::Write).unwrap();
        });
        port
    }

    fn dial(port: u16) -> StdStream {
        let socket = StdStream::connect(("127.0.0.1", port)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        socket
    }

    #[test]
    fn test_echo_through_tunnel() {
        let target = echo_server();
        let (_client, connection) = connected(TunnelService::new());
        let tunnel = connection.tcp_tunnel().unwrap();
        assert_eq!(tunnel.open(0, "127.0.0.1", target).wait(), Ok(()));
        let port = tunnel.local_port().unwrap();
        assert_ne!(port, 0);

        let mut socket = dial(port);
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        socket.write_all(&payload).unwrap();
        socket.shutdown(Shutdown::Write).unwrap();

        let mut echoed = Vec::new();
        socket.read_to_end(&mut echoed).unwrap();
        assert_eq!(echoed, payload);
    }

    #[test]
    fn test_refused_target_closes_socket() {
        let (_client, connection) = connected(TunnelService::new().allow("127.0.0.1", 5432));
        let tunnel = connection.tcp_tunnel().unwrap();
        tunnel.open(0, "127.0.0.1", 22).wait().unwrap();

        let mut socket = dial(tunnel.local_port().unwrap());
        let mut buf = Vec::new();
        assert_eq!(socket.read_to_end(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_unreachable_target_closes_socket() {
        let unused = StdListener::bind("127.0.0.1:0").unwrap();
        let target = unused.local_addr().unwrap().port();
        drop(unused);

        let (_client, connection) = connected(TunnelService::new());
        let tunnel = connection.tcp_tunnel().unwrap();
        tunnel.open(0, "127.0.0.1", target).wait().unwrap();

        let mut socket = dial(tunnel.local_port().unwrap());
        let mut buf = Vec::new();
        assert_eq!(socket.read_to_end(&mut buf).unwrap_or(0), 0);
    }

    #[test]
    fn test_tunnel_lifecycle() {
        let client = Client::new().unwrap();
        assert_eq!(
            client.connection().tcp_tunnel().unwrap_err(),
            Error::InvalidState
        );

        let (_client, connection) = connected(TunnelService::new());
        let tunnel = connection.tcp_tunnel().unwrap();
        assert_eq!(tunnel.local_port(), Err(Error::InvalidState));
        assert_eq!(
            tunnel.open(0, "", 80).wait(),
            Err(Error::InvalidArgument)
        );
        assert_eq!(tunnel.set_listen_mode(ListenMode::Localhost), Ok(()));

        tunnel.open(0, "127.0.0.1", 80).wait().unwrap();
        assert_eq!(
            tunnel.open(0, "127.0.0.1", 80).wait(),
            Err(Error::InvalidState)
        );
        assert_eq!(
            tunnel.set_listen_mode(ListenMode::Any),
            Err(Error::InvalidState)
        );

        let port = tunnel.local_port().unwrap();
        tunnel.close();
        thread::sleep(Duration::from_millis(200));
        assert!(StdStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn test_port_in_use_is_rejected() {
        let taken = StdListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (_client, connection) = connected(TunnelService::new());
        let tunnel = connection.tcp_tunnel().unwrap();
        assert_eq!(
            tunnel.open(port, "127.0.0.1", 80).wait(),
            Err(Error::InvalidArgument)
        );
        assert_eq!(tunnel.local_port(), Err(Error::InvalidState));
    }
}
