//! Transport layer.
//!
//! Everything between the connection core and the wire:
//!
//! - **Frame encoding/decoding**: [`Frame`] and its little-endian wire format
//! - **RTT estimation**: [`RttEstimator`] implementing RFC 6298
//! - **UDP channel** (`udp` feature): a [`SecureChannel`](crate::core::SecureChannel)
//!   over connected UDP sockets
//! - **In-memory network** (`device` feature): every collaborator trait backed
//!   by in-process queues with configurable loss and reordering
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Streams / Requests / Control        │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │       frames, RTT, links                │
//! ├─────────────────────────────────────────┤
//! │   Secure channel / relay collaborator   │
//! └─────────────────────────────────────────┘
//! ```

mod error;
mod frame;
mod timing;

#[cfg(feature = "device")]
pub mod memory;
#[cfg(feature = "udp")]
pub mod udp;

pub use error::*;
pub use frame::*;
pub use timing::RttEstimator;
