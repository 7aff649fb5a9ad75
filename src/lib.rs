//! # edgelink
//!
//! Secure client connections to remote devices that may not be reachable at a
//! fixed address.
//!
//! A [`Connection`] races every configured channel kind at once (local
//! discovery, the relay service and caller-supplied direct candidates),
//! commits to the first one that comes up and, when that was the relay,
//! keeps trying to upgrade to a peer-to-peer path in the background. On top
//! of the active channel run reliable, ordered, flow-controlled byte
//! [`Stream`]s and one-shot [`RequestExchange`]s.
//!
//! Every operation that does not finish instantly returns a [`Completion`]:
//! poll it, block on it, await it or attach a callback.
//!
//! ## Feature Flags
//!
//! - `udp` (default): plain UDP secure-channel collaborator
//! - `device` (default): device-side responder and the in-process network
//! - `tunnel` (default): TCP tunnels through a connection
//!
//! ## Modules
//!
//! - [`core`]: error taxonomy, constants and collaborator traits
//! - [`completion`]: the single-shot completion primitive
//! - [`channel`]: channel attempts, the race between them and the upgrade
//! - [`client`]: client context, connections and options
//! - [`stream`]: the reliable stream protocol
//! - [`request`]: request/response exchanges and the codec
//! - [`transport`]: frames, RTT estimation and link implementations
//! - [`crypto`]: client keys and fingerprints
//! - [`device`]: device-side responder (requires `device`)
//! - [`tunnel`]: TCP tunnels (requires `tunnel`)
//!
//! ## Example Usage
//!
//! ```ignore
//! use edgelink::prelude::*;
//!
//! let client = Client::new()?;
//! let connection = client.connection();
//! connection.set_product_id("pr-12345678")?;
//! connection.set_device_id("de-abcdefgh")?;
//! connection.set_server_url("https://pr-12345678.clients.example.net")?;
//! connection.set_server_key("sk-5f3ab4bea7cc2585091539fb950084ce")?;
//! connection.set_private_key(&client.create_private_key())?;
//! connection.connect().wait()?;
//!
//! let stream = connection.stream()?;
//! stream.open(1).wait()?;
//! stream.write(&b"hello"[..]).wait()?;
//! let echoed = stream.read_all(5).wait_output()?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod channel;
pub mod client;
pub mod completion;
pub mod core;
pub mod crypto;
pub mod logging;
pub mod request;
pub mod stream;
pub mod transport;

// Device-side responder (feature-gated)
#[cfg(feature = "device")]
#[cfg_attr(docsrs, doc(cfg(feature = "device")))]
pub mod device;

// TCP tunnels (feature-gated)
#[cfg(feature = "tunnel")]
#[cfg_attr(docsrs, doc(cfg(feature = "tunnel")))]
pub mod tunnel;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channel::ChannelKind;
    pub use crate::client::{
        Client, ClientBuilder, Connection, ConnectionInfo, ConnectionOptions, ConnectionState,
        ConnectionType,
    };
    pub use crate::completion::{Completion, Resolver};
    pub use crate::core::{Error, Result};
    pub use crate::logging::LogLevel;
    pub use crate::request::{Method, RequestExchange};
    pub use crate::stream::{Stream, StreamState};
}

// Re-export commonly used items at crate root
pub use channel::ChannelKind;
pub use client::{
    Client, ClientBuilder, Connection, ConnectionInfo, ConnectionOptions, ConnectionState,
    ConnectionType,
};
pub use completion::{Completion, Resolver};
pub use core::{Error, Result};
pub use logging::LogLevel;
pub use request::{Method, RequestExchange};
pub use stream::{Stream, StreamState};

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
