//! Exponentially weighted ingest-rate estimation.

use std::time::Duration;

/// Smooths per-interval trace-root counts into an events-per-second rate.
#[derive(Debug, Clone)]
pub struct IngestRateEstimate {
    rate: f64,
    decay: f64,
    primed: bool,
}

impl IngestRateEstimate {
    /// `decay` is the weight given to the newest observation, in `(0, 1]`.
    pub fn new(decay: f64) -> Self {
        IngestRateEstimate {
            rate: 0.0,
            decay,
            primed: false,
        }
    }

    /// Folds one interval's observation into the estimate and returns the
    /// updated rate. The first observation is adopted unsmoothed.
    pub fn observe_interval(&mut self, count: u64, interval: Duration) -> f64 {
        let seconds = interval.as_secs_f64();
        if seconds <= 0.0 {
            return self.rate;
        }
        let observed = count as f64 / seconds;
        if self.primed {
            self.rate = self.rate * (1.0 - self.decay) + observed * self.decay;
        } else {
            self.rate = observed;
            self.primed = true;
        }
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}
