//! Request/response exchanges.
//!
//! A request carries a method, a path and an optional payload with its
//! content format. The [`RequestCodec`] turns messages into the opaque bodies
//! carried by request and response frames; [`BinaryCodec`] is the default.

mod codec;
mod exchange;
mod message;

pub use codec::{BinaryCodec, CodecError, MAX_BODY_SIZE, RequestCodec};
pub use exchange::RequestExchange;
pub use message::{Method, RequestMessage, ResponseMessage};
