//! Channel attempts and the race between them.
//!
//! A connection attempts every configured channel kind at once. Each attempt
//! runs independently with its own timeout; an arbiter hands the commit
//! token to the first one that establishes a link, and every later winner
//! closes its own link.
//!
//! ```text
//!   Local  ─ discovery lookup ─► secure channel ─┐
//!   Relay  ─ relay negotiation ──────────────────┼─► arbiter ─► active link
//!   Direct ─ secure channel per candidate ───────┘
//!                                   relay won? ─► peer-to-peer upgrade
//! ```

mod arbiter;
mod direct;
mod local;
mod relay;
mod upgrade;

use std::fmt;

use crate::core::{Endpoint, Error, Result, SharedLink};

pub(crate) use arbiter::{RacePlan, race};
pub(crate) use direct::DirectAttempt;
pub(crate) use local::LocalAttempt;
pub(crate) use relay::RelayAttempt;
pub(crate) use upgrade::{UpgradePlan, upgrade};

/// How a channel reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Found by local discovery.
    Local,
    /// Mediated by the relay service.
    Relay,
    /// Caller-supplied direct candidate.
    Direct,
    /// Direct path learned through the relay.
    PeerToPeer,
}

impl ChannelKind {
    /// Every kind, in reporting order.
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Local,
        ChannelKind::Relay,
        ChannelKind::Direct,
        ChannelKind::PeerToPeer,
    ];

    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Local => "local",
            ChannelKind::Relay => "relay",
            ChannelKind::Direct => "direct",
            ChannelKind::PeerToPeer => "p2p",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Still trying.
    Attempting,
    /// A link exists.
    Established,
    /// Established relay link with a peer-to-peer upgrade running.
    Upgrading,
    /// Gave up; see the record's error.
    Failed,
}

/// What happened to one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Channel kind.
    pub kind: ChannelKind,
    /// Endpoint attempted, when known up front.
    pub endpoint: Option<Endpoint>,
    /// Current state.
    pub state: ChannelState,
    /// Why the attempt failed.
    pub error: Option<Error>,
}

impl ChannelRecord {
    pub(crate) fn attempting(kind: ChannelKind, endpoint: Option<Endpoint>) -> Self {
        Self {
            kind,
            endpoint,
            state: ChannelState::Attempting,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.state = ChannelState::Established,
            Err(e) => {
                self.state = ChannelState::Failed;
                self.error = Some(e);
            }
        }
    }
}

/// Summary code for every attempt of `kind`: `"OK"` when one established,
/// `"PENDING"` while any is running, the last error code otherwise, and
/// `"NONE"` when the kind was never attempted.
pub fn status_code(records: &[ChannelRecord], kind: ChannelKind) -> &'static str {
    let mut pending = false;
    let mut failure = None;
    for record in records.iter().filter(|r| r.kind == kind) {
        match record.state {
            ChannelState::Established | ChannelState::Upgrading => return "OK",
            ChannelState::Attempting => pending = true,
            ChannelState::Failed => failure = record.error.or(failure),
        }
    }
    match (pending, failure) {
        (true, _) => "PENDING",
        (false, Some(e)) => e.code(),
        (false, None) => "NONE",
    }
}

/// A link an attempt produced.
#[derive(Debug)]
pub(crate) struct EstablishedChannel {
    pub(crate) kind: ChannelKind,
    pub(crate) link: SharedLink,
    /// Upgrade candidates announced by the relay.
    pub(crate) peer_candidates: Vec<Endpoint>,
}

/// Receives attempt progress.
pub(crate) trait ChannelObserver: Send + Sync + 'static {
    /// An attempt started; returns its record index.
    fn attempt_started(&self, kind: ChannelKind, endpoint: Option<Endpoint>) -> usize;

    /// The attempt at `index` finished.
    fn attempt_finished(&self, index: usize, outcome: Result<()>);
}
