//! Core error taxonomy, constants and collaborator traits.

pub mod constants;
mod error;
mod traits;

pub use error::*;
pub use traits::*;
