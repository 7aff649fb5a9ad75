//! Reliable ordered byte streams.
//!
//! - [`SendBuffer`]: bytes written and not yet acknowledged
//! - [`ReorderBuffer`]: out-of-order segments keyed by byte offset
//! - [`AckTracker`]: in-flight segments, RTT sampling, retransmission timer
//! - [`StreamEngine`]: the sans-IO state machine both ends run
//! - [`Stream`]: the application handle
//!
//! ```text
//!   Created ──open──► Opening ──SYN-ACK──► Open ──close──► WriteClosed
//!                                                              │
//!                                   FIN acked + peer FIN seen  ▼
//!                                                            Closed
//!   any non-terminal state ──abort / RST / retransmit exhaustion──► Aborted
//! ```

mod ack;
mod engine;
mod handle;
mod receiver;
mod sender;

pub use ack::{AckTracker, TimeoutAction};
pub use engine::{StreamEngine, StreamState};
pub use handle::Stream;
pub use receiver::ReorderBuffer;
pub use sender::SendBuffer;

pub(crate) use handle::{FrameSink, StreamShared, spawn_stream};
