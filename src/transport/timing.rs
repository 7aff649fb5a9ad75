//! RTT estimation.
//!
//! RFC 6298 smoothed RTT with exponential backoff. Samples come from the
//! stream engine, which only measures segments that were never retransmitted
//! (Karn's rule).

use std::time::Duration;

use crate::core::constants::{INITIAL_RTO, MAX_RTO, MIN_RTO, RETRANSMIT_BACKOFF};

/// Alpha for SRTT smoothing (1/8).
const SRTT_ALPHA: f64 = 0.125;

/// Beta for RTTVAR smoothing (1/4).
const RTTVAR_BETA: f64 = 0.25;

/// K multiplier for RTO calculation.
const RTO_K: f64 = 4.0;

/// Clock granularity floor for the variance term, in milliseconds.
const GRANULARITY_MS: f64 = 10.0;

/// RTT estimator implementing RFC 6298.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// RTO computed from the estimates, before backoff.
    base_rto: Duration,
    /// Current retransmission timeout.
    rto: Duration,
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new RTT estimator with initial values.
    pub fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            base_rto: INITIAL_RTO,
            rto: INITIAL_RTO,
            initialized: false,
        }
    }

    /// Update the estimate with a new sample.
    ///
    /// A fresh sample also clears any backoff.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.initialized {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar =
                (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * sample_ms;
        }

        // RTO = SRTT + max(G, K * RTTVAR)
        let rto_ms = self.srtt + f64::max(GRANULARITY_MS, RTO_K * self.rttvar);
        let rto_ms = rto_ms.clamp(MIN_RTO.as_millis() as f64, MAX_RTO.as_millis() as f64);

        self.base_rto = Duration::from_millis(rto_ms as u64);
        self.rto = self.base_rto;
    }

    /// Current smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Whether at least one sample was taken.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Back off after a retransmission timeout, capped at the maximum.
    pub fn backoff(&mut self) -> Duration {
        self.rto = self.rto.saturating_mul(RETRANSMIT_BACKOFF).min(MAX_RTO);
        self.rto
    }

    /// Drop any backoff once progress resumes.
    pub fn reset_backoff(&mut self) {
        self.rto = self.base_rto;
    }
}
