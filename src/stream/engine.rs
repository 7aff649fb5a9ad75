//! Stream protocol state machine.
//!
//! [`StreamEngine`] is sans-IO: operations and inbound frames go in, frames to
//! transmit accumulate in an outbox and finished operations accumulate as
//! [`Settle`] records. The caller drains both after releasing its lock, so
//! completion callbacks never run while the engine is borrowed.
//!
//! The same engine runs on both ends. The opening side starts in
//! [`StreamState::Created`] and moves through `Opening`; the accepting side
//! starts directly in `Open` after answering the SYN.

use bytes::{Buf, Bytes};
use tokio::time::Instant;

use super::ack::{AckTracker, TimeoutAction};
use super::receiver::ReorderBuffer;
use super::sender::SendBuffer;
use crate::completion::{Completion, Resolver};
use crate::core::constants::{MAX_SEGMENT_SIZE, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE, STREAM_LINGER};
use crate::core::{Error, Result};
use crate::transport::Frame;

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Created, not opened yet.
    Created,
    /// SYN sent, waiting for the peer.
    Opening,
    /// Both directions usable.
    Open,
    /// This side called close; reading still allowed.
    WriteClosed,
    /// Both sides finished writing and our FIN was acknowledged.
    Closed,
    /// Terminated by either side or by connection teardown.
    Aborted,
}

/// A finished operation waiting to be announced.
pub(crate) enum Settle {
    Unit(Resolver<()>, Result<()>),
    Bytes(Resolver<Vec<u8>>, Result<()>, Option<Vec<u8>>),
}

impl Settle {
    pub(crate) fn run(self) {
        match self {
            Settle::Unit(resolver, outcome) => resolver.resolve(outcome, None),
            Settle::Bytes(resolver, outcome, output) => resolver.resolve(outcome, output),
        }
    }
}

/// Run every settle record in order.
pub(crate) fn settle_all(settled: Vec<Settle>) {
    for settle in settled {
        settle.run();
    }
}

struct PendingRead {
    resolver: Resolver<Vec<u8>>,
    want: usize,
    /// `read_all` semantics: wait for `want` bytes.
    fill: bool,
    buf: Vec<u8>,
}

struct PendingWrite {
    resolver: Resolver<()>,
    data: Bytes,
}

/// One end of a stream.
pub struct StreamEngine {
    id: u32,
    port: u32,
    state: StreamState,
    acceptor: bool,
    failure: Error,

    sender: SendBuffer,
    receiver: ReorderBuffer,
    tracker: AckTracker,
    /// Highest sequence number ever transmitted.
    high_water: u64,
    peer_window: u32,
    /// Window last advertised to the peer.
    advertised: u32,

    /// Our final offset, once close was called.
    fin: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,

    released: bool,
    detached: bool,
    closed_at: Option<Instant>,

    open: Option<Resolver<()>>,
    read: Option<PendingRead>,
    write: Option<PendingWrite>,
    close: Option<Resolver<()>>,

    outbox: Vec<Frame>,
    settled: Vec<Settle>,
}

impl StreamEngine {
    fn new(id: u32, port: u32, state: StreamState, acceptor: bool) -> Self {
        Self {
            id,
            port,
            state,
            acceptor,
            failure: Error::Aborted,
            sender: SendBuffer::new(SEND_BUFFER_SIZE),
            receiver: ReorderBuffer::new(RECV_BUFFER_SIZE),
            tracker: AckTracker::new(),
            high_water: 0,
            peer_window: RECV_BUFFER_SIZE as u32,
            advertised: RECV_BUFFER_SIZE as u32,
            fin: None,
            fin_sent: false,
            fin_acked: false,
            released: false,
            detached: false,
            closed_at: None,
            open: None,
            read: None,
            write: None,
            close: None,
            outbox: Vec::new(),
            settled: Vec::new(),
        }
    }

    /// Engine for a stream this side will open.
    pub fn initiator(id: u32) -> Self {
        Self::new(id, 0, StreamState::Created, false)
    }

    /// Engine answering a peer's SYN.
    pub fn acceptor(id: u32, port: u32) -> Self {
        let mut engine = Self::new(id, port, StreamState::Open, true);
        engine.outbox.push(Frame::StreamSynAck { stream_id: id });
        engine
    }

    /// Stream id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Port the stream is bound to.
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Start the handshake towards `port`.
    pub fn open(&mut self, port: u32, now: Instant) -> Completion<()> {
        match self.state {
            StreamState::Created => {}
            StreamState::Opening => return Completion::immediate(Err(Error::OperationInProgress)),
            StreamState::Aborted => return Completion::immediate(Err(self.failure)),
            _ => return Completion::immediate(Err(Error::InvalidState)),
        }

        let (completion, resolver) = Completion::pending();
        self.port = port;
        self.state = StreamState::Opening;
        self.open = Some(resolver);
        self.send_syn(false, now);
        completion
    }

    /// Read up to `max` bytes. With `fill`, wait for exactly `max`.
    pub fn read(&mut self, max: usize, fill: bool) -> Completion<Vec<u8>> {
        if let Err(e) = self.check_usable() {
            return Completion::immediate(Err(e));
        }
        if self.read.is_some() {
            return Completion::immediate(Err(Error::OperationInProgress));
        }
        if max == 0 {
            return if fill {
                Completion::immediate_with(Ok(()), Some(Vec::new()))
            } else {
                Completion::immediate(Err(Error::InvalidArgument))
            };
        }

        let (completion, resolver) = Completion::pending();
        self.read = Some(PendingRead {
            resolver,
            want: max,
            fill,
            buf: Vec::new(),
        });
        self.service_read();
        completion
    }

    /// Queue `data` for sending.
    pub fn write(&mut self, data: Bytes, now: Instant) -> Completion<()> {
        if let Err(e) = self.check_usable() {
            return Completion::immediate(Err(e));
        }
        if self.write.is_some() {
            return Completion::immediate(Err(Error::OperationInProgress));
        }
        if matches!(self.state, StreamState::WriteClosed | StreamState::Closed) {
            return Completion::immediate(Err(Error::InvalidState));
        }
        if data.is_empty() {
            return Completion::immediate(Ok(()));
        }

        let (completion, resolver) = Completion::pending();
        self.write = Some(PendingWrite { resolver, data });
        self.service_write();
        self.pump(now);
        completion
    }

    /// Half-close the write direction.
    pub fn close(&mut self, now: Instant) -> Completion<()> {
        if let Err(e) = self.check_usable() {
            return Completion::immediate(Err(e));
        }
        if self.close.is_some() || self.write.is_some() {
            return Completion::immediate(Err(Error::OperationInProgress));
        }
        if matches!(self.state, StreamState::WriteClosed | StreamState::Closed) {
            return Completion::immediate(Err(Error::InvalidState));
        }

        let (completion, resolver) = Completion::pending();
        self.fin = Some(self.sender.end());
        self.state = StreamState::WriteClosed;
        self.close = Some(resolver);
        self.pump(now);
        completion
    }

    /// Abort the stream and tell the peer.
    pub fn abort(&mut self) {
        if matches!(self.state, StreamState::Aborted | StreamState::Closed) {
            return;
        }
        let notify_peer = self.state != StreamState::Created;
        self.teardown(Error::Aborted);
        if notify_peer {
            self.outbox.push(Frame::StreamRst { stream_id: self.id });
        }
    }

    /// Fail every operation with `err` without telling the peer.
    ///
    /// Used when the whole connection goes away.
    pub fn fail(&mut self, err: Error) {
        self.detached = true;
        if matches!(self.state, StreamState::Aborted | StreamState::Closed) {
            return;
        }
        self.teardown(err);
    }

    /// The application handle is gone.
    pub fn release(&mut self) {
        self.released = true;
        self.abort();
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Process a frame addressed to this stream.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::StreamSyn { .. } => {
                // Our SYN-ACK was lost.
                if self.acceptor && self.state != StreamState::Aborted {
                    self.outbox.push(Frame::StreamSynAck { stream_id: self.id });
                }
            }
            Frame::StreamSynAck { .. } => match self.state {
                StreamState::Opening => self.established(now),
                StreamState::Open | StreamState::WriteClosed | StreamState::Closed => {
                    self.queue_ack()
                }
                _ => {}
            },
            Frame::StreamData {
                offset, payload, ..
            } => {
                if !self.accepts_peer_frames(now) {
                    return;
                }
                if !payload.is_empty() {
                    self.receiver.insert(offset, payload);
                }
                self.queue_ack();
                self.service_read();
                self.check_closed(now);
            }
            Frame::StreamAck { ack, window, .. } => {
                if !self.accepts_peer_frames(now) {
                    return;
                }
                self.on_ack(ack, window, now);
            }
            Frame::StreamFin { offset, .. } => {
                if !self.accepts_peer_frames(now) {
                    return;
                }
                if !self.receiver.set_fin(offset) {
                    tracing::debug!(stream = self.id, offset, "ignoring inconsistent fin");
                }
                self.queue_ack();
                self.service_read();
                self.check_closed(now);
            }
            Frame::StreamRst { .. } => {
                if !matches!(self.state, StreamState::Aborted | StreamState::Closed) {
                    tracing::debug!(stream = self.id, "stream reset by peer");
                    self.teardown(Error::Aborted);
                }
            }
            _ => {}
        }
        self.pump(now);
    }

    /// Handle the retransmission timer.
    pub fn on_timeout(&mut self, now: Instant) {
        match self.state {
            StreamState::Opening => match self.tracker.on_timeout(now) {
                Some(TimeoutAction::GiveUp) => {
                    tracing::debug!(stream = self.id, "open gave up after retransmits");
                    self.teardown(Error::Aborted);
                }
                Some(_) => self.send_syn(true, now),
                None => {}
            },
            StreamState::Open | StreamState::WriteClosed => match self.tracker.on_timeout(now) {
                Some(TimeoutAction::Retransmit) => {
                    tracing::trace!(
                        stream = self.id,
                        from = self.sender.base(),
                        rto = ?self.tracker.current_rto(),
                        "retransmitting"
                    );
                    self.sender.rewind();
                    if !self.fin_acked {
                        self.fin_sent = false;
                    }
                    self.pump(now);
                }
                Some(TimeoutAction::WindowCheck) => {
                    if self.sender.unsent() > 0 {
                        self.outbox.push(Frame::StreamData {
                            stream_id: self.id,
                            offset: self.sender.next(),
                            payload: Bytes::new(),
                        });
                    } else {
                        self.tracker.cancel_all();
                    }
                }
                Some(TimeoutAction::GiveUp) => {
                    tracing::debug!(stream = self.id, "stream gave up after retransmits");
                    self.teardown(Error::Aborted);
                    self.outbox.push(Frame::StreamRst { stream_id: self.id });
                }
                None => {}
            },
            _ => {}
        }
    }

    /// When [`StreamEngine::on_timeout`] next needs to run.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            StreamState::Closed if self.released => self.closed_at.map(|at| at + STREAM_LINGER),
            StreamState::Closed | StreamState::Aborted => None,
            _ => self.tracker.deadline(),
        }
    }

    /// Whether the driver can stop.
    pub fn is_finished(&self, now: Instant) -> bool {
        match self.state {
            StreamState::Aborted => true,
            StreamState::Closed => {
                self.detached
                    || (self.released
                        && self.closed_at.map(|at| at + STREAM_LINGER <= now).unwrap_or(true))
            }
            _ => false,
        }
    }

    /// Frames to transmit, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.outbox)
    }

    /// Operations that finished since the last call.
    pub(crate) fn take_settled(&mut self) -> Vec<Settle> {
        std::mem::take(&mut self.settled)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_usable(&self) -> Result<()> {
        match self.state {
            StreamState::Created => Err(Error::InvalidState),
            StreamState::Opening => Err(Error::OperationInProgress),
            StreamState::Aborted => Err(self.failure),
            _ => Ok(()),
        }
    }

    /// Peer frames imply the peer accepted our SYN even if its SYN-ACK was lost.
    fn accepts_peer_frames(&mut self, now: Instant) -> bool {
        if self.state == StreamState::Opening {
            self.established(now);
        }
        matches!(
            self.state,
            StreamState::Open | StreamState::WriteClosed | StreamState::Closed
        )
    }

    fn established(&mut self, now: Instant) {
        self.tracker.process_ack(0, now);
        self.state = StreamState::Open;
        if let Some(resolver) = self.open.take() {
            self.settled.push(Settle::Unit(resolver, Ok(())));
        }
        tracing::debug!(stream = self.id, port = self.port, "stream open");
        self.queue_ack();
    }

    fn send_syn(&mut self, retransmitted: bool, now: Instant) {
        self.outbox.push(Frame::StreamSyn {
            stream_id: self.id,
            port: self.port,
        });
        // The handshake occupies sequence number zero in the tracker.
        self.tracker.register_sent(0, retransmitted, now);
    }

    fn queue_ack(&mut self) {
        let window = self.receiver.window();
        self.advertised = window;
        self.outbox.push(Frame::StreamAck {
            stream_id: self.id,
            ack: self.receiver.ack_number(),
            window,
        });
    }

    fn on_ack(&mut self, ack: u64, window: u32, now: Instant) {
        if ack > self.high_water || ack < self.sender.base() {
            return;
        }
        self.peer_window = window;
        self.sender.ack(ack);
        self.tracker.process_ack(ack, now);

        if let Some(fin) = self.fin {
            if self.fin_sent && ack > fin && !self.fin_acked {
                self.fin_acked = true;
                if let Some(resolver) = self.close.take() {
                    self.settled.push(Settle::Unit(resolver, Ok(())));
                }
            }
        }
        self.service_write();
        self.check_closed(now);
    }

    fn service_read(&mut self) {
        let Some(mut pending) = self.read.take() else {
            return;
        };

        let chunk = self.receiver.read(pending.want - pending.buf.len());
        pending.buf.extend_from_slice(&chunk);
        if !chunk.is_empty() && self.receiver.window() >= self.advertised + MAX_SEGMENT_SIZE as u32 {
            self.queue_ack();
        }

        let done = if pending.fill {
            pending.buf.len() == pending.want
        } else {
            !pending.buf.is_empty()
        };

        if done {
            self.settled
                .push(Settle::Bytes(pending.resolver, Ok(()), Some(pending.buf)));
        } else if self.receiver.at_eof() {
            let output = (!pending.buf.is_empty()).then_some(pending.buf);
            self.settled
                .push(Settle::Bytes(pending.resolver, Err(Error::Eof), output));
        } else {
            self.read = Some(pending);
        }
    }

    fn service_write(&mut self) {
        let Some(mut pending) = self.write.take() else {
            return;
        };
        let taken = self.sender.push(&pending.data);
        pending.data.advance(taken);
        if pending.data.is_empty() {
            self.settled.push(Settle::Unit(pending.resolver, Ok(())));
        } else {
            self.write = Some(pending);
        }
    }

    fn pump(&mut self, now: Instant) {
        if !matches!(self.state, StreamState::Open | StreamState::WriteClosed) {
            return;
        }

        let limit = self.sender.base() + self.peer_window as u64;
        while let Some((offset, payload)) = self.sender.next_segment(MAX_SEGMENT_SIZE, limit) {
            let end = offset + payload.len() as u64;
            self.register_sent(end, now);
            self.outbox.push(Frame::StreamData {
                stream_id: self.id,
                offset,
                payload,
            });
        }

        if let Some(fin) = self.fin {
            if !self.fin_sent && !self.fin_acked && self.sender.next() == fin {
                self.fin_sent = true;
                self.register_sent(fin + 1, now);
                self.outbox.push(Frame::StreamFin {
                    stream_id: self.id,
                    offset: fin,
                });
            }
        }

        if self.sender.unsent() > 0 && !self.tracker.has_in_flight() {
            self.tracker.arm_window_check(now);
        }
    }

    fn register_sent(&mut self, end: u64, now: Instant) {
        let retransmitted = end <= self.high_water;
        self.high_water = self.high_water.max(end);
        self.tracker.register_sent(end, retransmitted, now);
    }

    fn check_closed(&mut self, now: Instant) {
        if self.state == StreamState::WriteClosed && self.fin_acked && self.receiver.is_finished() {
            self.state = StreamState::Closed;
            self.closed_at = Some(now);
            self.tracker.cancel_all();
            tracing::debug!(stream = self.id, "stream closed");
        }
    }

    fn teardown(&mut self, err: Error) {
        self.state = StreamState::Aborted;
        self.failure = err;
        self.tracker.cancel_all();

        if let Some(resolver) = self.open.take() {
            self.settled.push(Settle::Unit(resolver, Err(err)));
        }
        if let Some(pending) = self.read.take() {
            self.settled
                .push(Settle::Bytes(pending.resolver, Err(err), None));
        }
        if let Some(pending) = self.write.take() {
            self.settled.push(Settle::Unit(pending.resolver, Err(err)));
        }
        if let Some(resolver) = self.close.take() {
            self.settled.push(Settle::Unit(resolver, Err(err)));
        }
    }
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("send_base", &self.sender.base())
            .field("send_next", &self.sender.next())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Poll;
    use std::time::Duration;

    fn settle(engine: &mut StreamEngine) {
        settle_all(engine.take_settled());
    }

    /// Deliver every queued frame from `from` to `to`, optionally dropping
    /// data frames.
    fn deliver(from: &mut StreamEngine, to: &mut StreamEngine, now: Instant, drop_data: bool) -> usize {
        let frames = from.take_outbox();
        let count = frames.len();
        for frame in frames {
            if drop_data && matches!(frame, Frame::StreamData { .. }) {
                continue;
            }
            to.on_frame(frame, now);
        }
        settle(to);
        count
    }

    /// Shuttle frames until both outboxes are empty.
    fn run(a: &mut StreamEngine, b: &mut StreamEngine, now: Instant) {
        loop {
            let moved = deliver(a, b, now, false) + deliver(b, a, now, false);
            if moved == 0 {
                break;
            }
        }
    }

    fn open_pair(now: Instant) -> (StreamEngine, StreamEngine) {
        let mut client = StreamEngine::initiator(1);
        let open = client.open(7, now);
        let syn = client.take_outbox();
        assert!(matches!(syn.as_slice(), [Frame::StreamSyn { stream_id: 1, port: 7 }]));

        let mut device = StreamEngine::acceptor(1, 7);
        run(&mut device, &mut client, now);
        assert_eq!(open.ready(), Poll::Ready(Ok(())));
        assert_eq!(client.state(), StreamState::Open);
        (client, device)
    }

    #[test]
    fn test_ops_before_open() {
        let now = Instant::now();
        let mut engine = StreamEngine::initiator(1);
        assert_eq!(engine.read(4, false).ready(), Poll::Ready(Err(Error::InvalidState)));
        assert_eq!(
            engine.write(Bytes::from_static(b"x"), now).ready(),
            Poll::Ready(Err(Error::InvalidState))
        );
        assert_eq!(engine.close(now).ready(), Poll::Ready(Err(Error::InvalidState)));
    }

    #[test]
    fn test_ops_while_opening() {
        let now = Instant::now();
        let mut engine = StreamEngine::initiator(1);
        let _open = engine.open(1, now);
        assert_eq!(engine.open(1, now).ready(), Poll::Ready(Err(Error::OperationInProgress)));
        assert_eq!(
            engine.read(1, true).ready(),
            Poll::Ready(Err(Error::OperationInProgress))
        );
        assert_eq!(engine.state(), StreamState::Opening);
    }

    #[test]
    fn test_write_then_read() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        let write = client.write(Bytes::from(vec![9u8; 3000]), now);
        settle(&mut client);
        assert_eq!(write.ready(), Poll::Ready(Ok(())));

        let read = device.read(3000, true);
        run(&mut client, &mut device, now);
        assert_eq!(read.ready(), Poll::Ready(Ok(())));
        assert_eq!(read.into_output().unwrap(), vec![9u8; 3000]);
    }

    #[test]
    fn test_second_read_rejected() {
        let now = Instant::now();
        let (_client, mut device) = open_pair(now);

        let first = device.read(16, false);
        let second = device.read(16, false);
        assert_eq!(second.ready(), Poll::Ready(Err(Error::OperationInProgress)));
        assert_eq!(first.ready(), Poll::Pending);
    }

    #[test]
    fn test_close_waits_for_write() {
        let now = Instant::now();
        let (mut client, _device) = open_pair(now);

        // More than the send buffer holds, so the write stays outstanding.
        let write = client.write(Bytes::from(vec![1u8; SEND_BUFFER_SIZE + 10]), now);
        settle(&mut client);
        assert_eq!(write.ready(), Poll::Pending);
        assert_eq!(client.close(now).ready(), Poll::Ready(Err(Error::OperationInProgress)));
    }

    #[test]
    fn test_close_and_eof() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        let write = client.write(Bytes::from_static(b"bye"), now);
        let close = client.close(now);
        settle(&mut client);
        assert_eq!(write.ready(), Poll::Ready(Ok(())));
        assert_eq!(client.state(), StreamState::WriteClosed);

        let read = device.read(10, true);
        run(&mut client, &mut device, now);
        assert_eq!(close.ready(), Poll::Ready(Ok(())));
        assert_eq!(read.ready(), Poll::Ready(Err(Error::Eof)));
        assert_eq!(read.into_output(), Some(b"bye".to_vec()));

        let device_close = device.close(now);
        run(&mut device, &mut client, now);
        assert_eq!(device_close.ready(), Poll::Ready(Ok(())));
        assert_eq!(client.state(), StreamState::Closed);
        assert_eq!(device.state(), StreamState::Closed);
    }

    #[test]
    fn test_write_after_close() {
        let now = Instant::now();
        let (mut client, _device) = open_pair(now);
        let _close = client.close(now);
        assert_eq!(
            client.write(Bytes::from_static(b"late"), now).ready(),
            Poll::Ready(Err(Error::InvalidState))
        );
    }

    #[test]
    fn test_abort_resets_peer() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        let pending = device.read(1, false);
        client.abort();
        settle(&mut client);
        assert_eq!(client.state(), StreamState::Aborted);

        run(&mut client, &mut device, now);
        assert_eq!(device.state(), StreamState::Aborted);
        assert_eq!(pending.ready(), Poll::Ready(Err(Error::Aborted)));
        assert_eq!(device.read(1, false).ready(), Poll::Ready(Err(Error::Aborted)));
    }

    #[test]
    fn test_fail_uses_given_error() {
        let now = Instant::now();
        let (mut client, _device) = open_pair(now);
        let read = client.read(1, false);
        client.fail(Error::Stopped);
        settle(&mut client);
        assert_eq!(read.ready(), Poll::Ready(Err(Error::Stopped)));
        assert!(client.take_outbox().iter().all(|f| !matches!(f, Frame::StreamRst { .. })));
        assert!(client.is_finished(now));
    }

    #[test]
    fn test_retransmit_after_loss() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        let read = device.read(5, true);
        let _write = client.write(Bytes::from_static(b"hello"), now);
        deliver(&mut client, &mut device, now, true);
        assert_eq!(read.ready(), Poll::Pending);

        let fire = client.deadline().unwrap();
        client.on_timeout(fire);
        run(&mut client, &mut device, fire);
        assert_eq!(read.ready(), Poll::Ready(Ok(())));
        assert_eq!(read.into_output(), Some(b"hello".to_vec()));
        assert_eq!(client.deadline(), None);
    }

    #[test]
    fn test_open_gives_up() {
        let mut now = Instant::now();
        let mut engine = StreamEngine::initiator(3);
        let open = engine.open(1, now);

        while let Some(at) = engine.deadline() {
            now = at;
            engine.on_timeout(now);
            engine.take_outbox();
        }
        settle(&mut engine);
        assert_eq!(open.ready(), Poll::Ready(Err(Error::Aborted)));
        assert_eq!(engine.state(), StreamState::Aborted);
    }

    #[test]
    fn test_flow_control_window() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        // The device never reads: its window fills up and the client stalls.
        let _write = client.write(Bytes::from(vec![2u8; RECV_BUFFER_SIZE + 4096]), now);
        run(&mut client, &mut device, now);
        settle(&mut client);
        assert_eq!(client.sender.base(), RECV_BUFFER_SIZE as u64);
        assert!(client.sender.unsent() > 0);

        // Window check fires and the peer answers with its (still zero) window.
        let fire = client.deadline().unwrap();
        client.on_timeout(fire);
        let check = client.take_outbox();
        assert!(matches!(check.as_slice(), [Frame::StreamData { payload, .. }] if payload.is_empty()));

        // Reading frees space and unblocks the sender.
        let read = device.read(RECV_BUFFER_SIZE, true);
        settle(&mut device);
        assert_eq!(read.ready(), Poll::Ready(Ok(())));
        run(&mut device, &mut client, fire + Duration::from_millis(1));
        assert!(client.sender.base() > RECV_BUFFER_SIZE as u64);
    }

    #[test]
    fn test_duplicate_syn_is_answered() {
        let now = Instant::now();
        let mut device = StreamEngine::acceptor(5, 2);
        device.take_outbox();
        device.on_frame(Frame::StreamSyn { stream_id: 5, port: 2 }, now);
        assert_eq!(device.take_outbox(), vec![Frame::StreamSynAck { stream_id: 5 }]);
    }

    #[test]
    fn test_hostile_offsets_keep_stream_usable() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);

        let read = device.read(5, true);
        device.on_frame(
            Frame::StreamData {
                stream_id: 1,
                offset: u64::MAX - 2,
                payload: Bytes::from_static(b"abcdef"),
            },
            now,
        );
        device.on_frame(Frame::StreamFin { stream_id: 1, offset: u64::MAX }, now);
        device.take_outbox();
        assert_eq!(device.state(), StreamState::Open);

        let _write = client.write(Bytes::from_static(b"hello"), now);
        run(&mut client, &mut device, now);
        assert_eq!(read.ready(), Poll::Ready(Ok(())));
        assert_eq!(read.into_output(), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_release_lingers_after_close() {
        let now = Instant::now();
        let (mut client, mut device) = open_pair(now);
        let _c = client.close(now);
        run(&mut client, &mut device, now);
        let _d = device.close(now);
        run(&mut device, &mut client, now);
        assert_eq!(client.state(), StreamState::Closed);

        client.release();
        assert!(client.take_outbox().is_empty());
        assert!(!client.is_finished(now));
        assert!(client.is_finished(now + STREAM_LINGER));
    }
}
