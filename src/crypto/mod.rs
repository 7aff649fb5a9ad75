//! Client credentials.
//!
//! Key generation, hex encoding and fingerprints. Channel encryption itself is
//! provided by the [`SecureChannel`](crate::core::SecureChannel) collaborator.

mod keys;

pub use keys::*;
