//! Client API.
//!
//! - [`Client`]: dispatcher runtime and collaborators
//! - [`Connection`]: one logical connection to a device
//! - [`ConnectionOptions`]: everything a connection is configured with

#[allow(clippy::module_inception)]
mod client;
mod connection;
mod options;

pub use client::{Client, ClientBuilder};
pub use connection::{Connection, ConnectionInfo, ConnectionState, ConnectionType};
pub use options::{ConnectionOptions, KeepAliveSettings, OptionsError};

pub(crate) use client::ClientInner;
pub(crate) use connection::ConnectionInner;
