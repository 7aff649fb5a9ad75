//! Device-side responder.
//!
//! A minimal peer for the client: accepts streams on registered ports and
//! answers requests, over any link a secure channel or relay produced. It
//! runs the same [`StreamEngine`](crate::stream::StreamEngine) as the client.

mod handler;
mod host;
mod session;

pub use handler::{EchoHandler, RequestHandler, StreamHandler};
pub use host::DeviceHost;
