//! Adaptive retransmission timeout.
//!
//! A smoothed round-trip estimate drives the wait before a retransmission:
//! `srtt` is an exponentially-weighted moving average of observed RTTs and
//! the timeout is twice that, clamped to a configured band.

use std::time::Duration;

/// Weight of the previous estimate in the moving average.
const SRTT_WEIGHT: f64 = 0.875;

/// Tracks the smoothed RTT and the retransmission timeout derived from it.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rto: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl RtoEstimator {
    /// `initial` is used until the first sample arrives; afterwards the
    /// timeout stays within `[floor, ceiling]`.
    pub fn new(initial: Duration, floor: Duration, ceiling: Duration) -> Self {
        RtoEstimator {
            srtt: None,
            rto: initial,
            floor,
            ceiling,
        }
    }

    /// Fold one round-trip observation into the estimate.
    ///
    /// Callers must not feed RTTs measured across a retransmission: such a
    /// sample cannot be attributed to a single send and would bias the
    /// estimate (Karn's rule).
    pub fn sample(&mut self, rtt: Duration) {
        let srtt = match self.srtt {
            None => rtt,
            Some(prev) => prev.mul_f64(SRTT_WEIGHT) + rtt.mul_f64(1.0 - SRTT_WEIGHT),
        };
        self.srtt = Some(srtt);
        self.rto = (srtt * 2).clamp(self.floor, self.ceiling);
    }

    /// The timeout to apply to the next exchange.
    pub fn current(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }
}
