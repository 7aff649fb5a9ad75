//! Stream handle and driver task.
//!
//! Each stream runs one driver task on the dispatcher. Application calls lock
//! the engine, register their operation and kick the driver; the driver owns
//! the retransmission timer and pushes the engine's outbox onto whatever link
//! is active at that moment.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

use super::engine::{StreamEngine, StreamState, settle_all};
use crate::client::ClientInner;
use crate::completion::Completion;
use crate::core::{Error, SharedLink};
use crate::transport::Frame;

/// Where a stream driver sends its frames.
pub(crate) trait FrameSink: Send + Sync + 'static {
    /// Link to send on right now, if any.
    fn link(&self) -> Option<SharedLink>;

    /// The driver for `stream_id` exited.
    fn unregister_stream(&self, stream_id: u32);
}

pub(crate) enum StreamEvent {
    Frame(Frame),
    Kick,
}

/// State shared by a stream handle, its driver and the owning connection.
pub(crate) struct StreamShared {
    id: u32,
    engine: Mutex<StreamEngine>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamShared {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Hand an inbound frame to the driver.
    pub(crate) fn deliver(&self, frame: Frame) {
        let _ = self.events.send(StreamEvent::Frame(frame));
    }

    /// Fail every operation, e.g. on connection teardown.
    pub(crate) fn fail(&self, err: Error) {
        self.with_engine(|engine, _| engine.fail(err));
    }

    pub(crate) fn state(&self) -> StreamState {
        self.engine.lock().state()
    }

    /// Run `f` against the engine, then announce results and wake the driver.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut StreamEngine, Instant) -> R) -> R {
        let result = self.update(f);
        let _ = self.events.send(StreamEvent::Kick);
        result
    }

    fn update<R>(&self, f: impl FnOnce(&mut StreamEngine, Instant) -> R) -> R {
        let (result, settled) = {
            let mut engine = self.engine.lock();
            let result = f(&mut engine, Instant::now());
            (result, engine.take_settled())
        };
        settle_all(settled);
        result
    }
}

/// Start a driver for `engine` on `handle`.
pub(crate) fn spawn_stream(
    handle: &Handle,
    engine: StreamEngine,
    sink: Arc<dyn FrameSink>,
) -> Arc<StreamShared> {
    let (events, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(StreamShared {
        id: engine.id(),
        engine: Mutex::new(engine),
        events,
    });
    handle.spawn(drive(Arc::clone(&shared), rx, sink));
    shared
}

enum Wake {
    Event(StreamEvent),
    Timer,
}

async fn drive(
    shared: Arc<StreamShared>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    sink: Arc<dyn FrameSink>,
) {
    loop {
        let now = Instant::now();
        let (outbox, deadline, finished) = {
            let mut engine = shared.engine.lock();
            (engine.take_outbox(), engine.deadline(), engine.is_finished(now))
        };

        for frame in outbox {
            let Some(link) = sink.link() else {
                break;
            };
            if let Err(e) = link.send(frame.encode()).await {
                tracing::trace!(stream = shared.id, error = %e, "stream frame not sent");
                break;
            }
        }

        if finished {
            break;
        }

        let wake = match deadline {
            Some(at) => tokio::select! {
                event = events.recv() => event.map(Wake::Event),
                _ = sleep_until(at) => Some(Wake::Timer),
            },
            None => events.recv().await.map(Wake::Event),
        };

        match wake {
            Some(Wake::Event(StreamEvent::Frame(frame))) => {
                shared.update(|engine, now| engine.on_frame(frame, now))
            }
            Some(Wake::Event(StreamEvent::Kick)) => {}
            Some(Wake::Timer) => shared.update(|engine, now| engine.on_timeout(now)),
            None => break,
        }
    }

    tracing::trace!(stream = shared.id, "stream driver finished");
    sink.unregister_stream(shared.id);
}

/// A reliable, ordered byte stream over a connection.
///
/// At most one read and one write may be outstanding at a time. Dropping the
/// handle aborts the stream.
pub struct Stream {
    shared: Arc<StreamShared>,
    _client: Option<Arc<ClientInner>>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, client: Option<Arc<ClientInner>>) -> Self {
        Self {
            shared,
            _client: client,
        }
    }

    /// Stream id, unique within its connection.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Open the stream towards a port on the device.
    ///
    /// Resolves once the device accepted the stream.
    pub fn open(&self, port: u32) -> Completion<()> {
        self.shared.with_engine(|engine, now| engine.open(port, now))
    }

    /// Read exactly `n` bytes.
    ///
    /// At end of file the short data is still delivered as output alongside
    /// [`Error::Eof`].
    pub fn read_all(&self, n: usize) -> Completion<Vec<u8>> {
        self.shared.with_engine(|engine, _| engine.read(n, true))
    }

    /// Read between one and `max` bytes.
    pub fn read_some(&self, max: usize) -> Completion<Vec<u8>> {
        self.shared.with_engine(|engine, _| engine.read(max, false))
    }

    /// Write `data`.
    ///
    /// Resolves once every byte is queued for sending, not when the peer
    /// acknowledged it. Use [`Stream::close`] to wait for delivery.
    pub fn write(&self, data: impl Into<Bytes>) -> Completion<()> {
        let data = data.into();
        self.shared.with_engine(|engine, now| engine.write(data, now))
    }

    /// Close the write direction.
    ///
    /// Resolves once everything written, and the close itself, were
    /// acknowledged. Reading stays possible.
    pub fn close(&self) -> Completion<()> {
        self.shared.with_engine(|engine, now| engine.close(now))
    }

    /// Abort the stream. Every outstanding operation fails with
    /// [`Error::Aborted`].
    pub fn abort(&self) {
        self.shared.with_engine(|engine, _| engine.abort());
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.with_engine(|engine, _| engine.release());
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
