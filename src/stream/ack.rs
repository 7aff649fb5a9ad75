//! Acknowledgment tracking
//!
//! Tracks in-flight segments by the sequence number just past their last
//! byte, samples RTT from acknowledgements and drives the retransmission
//! timer.

use tokio::time::Instant;

use crate::core::constants::MAX_RETRANSMITS;
use crate::transport::RttEstimator;

/// A segment waiting for acknowledgment
#[derive(Debug, Clone, Copy)]
struct InFlight {
    /// Sequence number just past the segment
    end: u64,
    /// Time the segment was (re)sent
    sent_at: Instant,
    /// Sent more than once; excluded from RTT sampling
    retransmitted: bool,
}

/// Outcome of a retransmission timer expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Resend everything from the oldest unacknowledged byte
    Retransmit,
    /// Nothing in flight; check the peer's window
    WindowCheck,
    /// Too many consecutive timeouts
    GiveUp,
}

/// Acknowledgment tracker
#[derive(Debug)]
pub struct AckTracker {
    in_flight: Vec<InFlight>,
    highest_acked: u64,
    rtt: RttEstimator,
    /// Consecutive timeouts without progress
    timeouts: u32,
    /// When the retransmission timer fires, if armed
    deadline: Option<Instant>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    /// Create a new ack tracker
    pub fn new() -> Self {
        Self {
            in_flight: Vec::new(),
            highest_acked: 0,
            rtt: RttEstimator::new(),
            timeouts: 0,
            deadline: None,
        }
    }

    /// Register a sent segment ending at `end`
    pub fn register_sent(&mut self, end: u64, retransmitted: bool, now: Instant) {
        self.in_flight.push(InFlight {
            end,
            sent_at: now,
            retransmitted,
        });
        if self.deadline.is_none() {
            self.deadline = Some(now + self.rtt.rto());
        }
    }

    /// Process a cumulative acknowledgment
    ///
    /// Returns `true` if it acknowledged anything new.
    pub fn process_ack(&mut self, ack: u64, now: Instant) -> bool {
        let progressed = ack > self.highest_acked || self.in_flight.iter().any(|s| s.end <= ack);
        if !progressed {
            return false;
        }
        self.highest_acked = self.highest_acked.max(ack);

        let mut sample = None;
        self.in_flight.retain(|segment| {
            if segment.end <= ack {
                if !segment.retransmitted {
                    sample = Some(now.saturating_duration_since(segment.sent_at));
                }
                false
            } else {
                true
            }
        });

        if let Some(rtt) = sample {
            self.rtt.update(rtt);
        }
        self.rtt.reset_backoff();
        self.timeouts = 0;
        self.deadline = if self.in_flight.is_empty() {
            None
        } else {
            Some(now + self.rtt.rto())
        };
        true
    }

    /// Whether any segment is waiting for acknowledgment
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Arm the timer for a window check if it is idle
    pub fn arm_window_check(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.rtt.rto());
        }
    }

    /// When the timer fires
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Handle the timer
    ///
    /// Returns `None` if the timer has not expired yet.
    pub fn on_timeout(&mut self, now: Instant) -> Option<TimeoutAction> {
        match self.deadline {
            Some(at) if at <= now => {}
            _ => return None,
        }

        let rto = self.rtt.backoff();
        self.deadline = Some(now + rto);

        if self.in_flight.is_empty() {
            return Some(TimeoutAction::WindowCheck);
        }

        self.timeouts += 1;
        if self.timeouts > MAX_RETRANSMITS {
            self.cancel_all();
            return Some(TimeoutAction::GiveUp);
        }

        // Go-back-N: everything in flight is resent and re-registered.
        self.in_flight.clear();
        self.deadline = None;
        Some(TimeoutAction::Retransmit)
    }

    /// Current retransmission timeout
    pub fn current_rto(&self) -> std::time::Duration {
        self.rtt.rto()
    }

    /// Consecutive timeouts so far
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// Forget everything in flight and disarm the timer
    pub fn cancel_all(&mut self) {
        self.in_flight.clear();
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_arms_timer() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        assert_eq!(tracker.deadline(), None);

        tracker.register_sent(100, false, now);
        assert_eq!(tracker.deadline(), Some(now + tracker.current_rto()));
        assert!(tracker.has_in_flight());
    }

    #[test]
    fn test_ack_clears_and_samples() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.register_sent(100, false, now);
        tracker.register_sent(200, false, now);

        assert!(tracker.process_ack(100, now + Duration::from_millis(40)));
        assert!(tracker.has_in_flight());
        assert!(tracker.deadline().is_some());

        assert!(tracker.process_ack(200, now + Duration::from_millis(50)));
        assert!(!tracker.has_in_flight());
        assert_eq!(tracker.deadline(), None);

        // Duplicate ack
        assert!(!tracker.process_ack(200, now + Duration::from_millis(60)));
    }

    #[test]
    fn test_timeout_not_due() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.register_sent(10, false, now);
        assert_eq!(tracker.on_timeout(now), None);
    }

    #[test]
    fn test_timeout_backoff() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.register_sent(10, false, now);
        let rto = tracker.current_rto();

        let fire = tracker.deadline().unwrap();
        assert_eq!(tracker.on_timeout(fire), Some(TimeoutAction::Retransmit));
        assert_eq!(tracker.current_rto(), rto * 2);
        assert!(!tracker.has_in_flight());
        assert_eq!(tracker.timeouts(), 1);
    }

    #[test]
    fn test_gives_up() {
        let mut now = Instant::now();
        let mut tracker = AckTracker::new();

        for _ in 0..MAX_RETRANSMITS {
            tracker.register_sent(10, true, now);
            now = tracker.deadline().unwrap();
            assert_eq!(tracker.on_timeout(now), Some(TimeoutAction::Retransmit));
        }

        tracker.register_sent(10, true, now);
        now = tracker.deadline().unwrap();
        assert_eq!(tracker.on_timeout(now), Some(TimeoutAction::GiveUp));
        assert_eq!(tracker.deadline(), None);
    }

    #[test]
    fn test_progress_resets_timeouts() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.register_sent(10, false, now);
        let fire = tracker.deadline().unwrap();
        tracker.on_timeout(fire);
        assert_eq!(tracker.timeouts(), 1);

        tracker.register_sent(10, true, fire);
        tracker.process_ack(10, fire + Duration::from_millis(5));
        assert_eq!(tracker.timeouts(), 0);
    }

    #[test]
    fn test_window_check_when_idle() {
        let now = Instant::now();
        let mut tracker = AckTracker::new();
        tracker.arm_window_check(now);
        let fire = tracker.deadline().unwrap();
        assert_eq!(tracker.on_timeout(fire), Some(TimeoutAction::WindowCheck));
        assert_eq!(tracker.timeouts(), 0);
        assert!(tracker.deadline().is_some());
    }
}
