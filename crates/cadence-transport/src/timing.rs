//! # Stream Timing
//!
//! Two independent estimators fed by the receiver:
//!
//! - [`LatencyController`]: PI controller on the buffered latency (samples
//!   queued between the network and the speaker). When the smoothed latency
//!   strays further than the tolerance from the target it asks the external
//!   resampler for a new ratio. A ratio above 1.0 consumes samples faster.
//!   Once latency is back within the tolerance the ratio returns to 1.0.
//! - [`RateEstimator`]: sender sample clock versus the local monotonic clock,
//!   from packet timestamps and arrival times. Reported for diagnostics.

use quanta::Instant;

use crate::config::DriftConfig;
use crate::stats::Ewma;

// ─── Latency Controller ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LatencyController {
    config: DriftConfig,
    target: f64,
    tolerance: f64,
    smoothed: Ewma,
    integral: f64,
    scaling: f64,
    reported: f64,
}

impl LatencyController {
    pub fn new(config: &DriftConfig, sample_rate: u32, target_samples: usize) -> Self {
        LatencyController {
            target: target_samples as f64,
            tolerance: config.tolerance.as_secs_f64() * sample_rate as f64,
            smoothed: Ewma::new(config.smoothing),
            integral: 0.0,
            scaling: 1.0,
            reported: 1.0,
            config: config.clone(),
        }
    }

    /// Feed one latency measurement in samples per channel. Returns the new
    /// resampling ratio when a nudge should be sent.
    pub fn update(&mut self, latency_samples: f64) -> Option<f64> {
        let latency = self.smoothed.update(latency_samples);
        let error = latency - self.target;

        if self.config.i_gain > 0.0 {
            let limit = self.config.max_scaling / self.config.i_gain;
            self.integral = (self.integral + error).clamp(-limit, limit);
        }
        let max = self.config.max_scaling;
        self.scaling = (1.0 + self.config.p_gain * error + self.config.i_gain * self.integral)
            .clamp(1.0 - max, 1.0 + max);

        if error.abs() <= self.tolerance {
            if self.reported == 1.0 {
                return None;
            }
            // Back inside the band: release the correction.
            self.integral = 0.0;
            self.scaling = 1.0;
            self.reported = 1.0;
            return Some(1.0);
        }
        if (self.scaling - self.reported).abs() < self.config.report_step {
            return None;
        }
        self.reported = self.scaling;
        Some(self.scaling)
    }

    /// Last computed ratio, reported or not.
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    pub fn latency(&self) -> f64 {
        self.smoothed.value()
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn reset(&mut self) {
        self.smoothed.reset();
        self.integral = 0.0;
        self.scaling = 1.0;
        self.reported = 1.0;
    }
}

// ─── Rate Estimator ─────────────────────────────────────────────────────────

/// Long-run ratio of sender sample clock to local wall clock.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    sample_rate: f64,
    origin: Option<Instant>,
    last_timestamp: u32,
    /// Samples elapsed at the sender since the origin, unwrapped.
    elapsed_samples: u64,
    ratio: Ewma,
}

impl RateEstimator {
    /// Measurements closer than this to the origin are too noisy to use.
    const MIN_SPAN_SECS: f64 = 1.0;

    pub fn new(sample_rate: u32) -> Self {
        RateEstimator {
            sample_rate: sample_rate as f64,
            origin: None,
            last_timestamp: 0,
            elapsed_samples: 0,
            ratio: Ewma::new(0.1),
        }
    }

    /// Record a source packet's timestamp and arrival time.
    pub fn observe(&mut self, timestamp: u32, arrival: Instant) {
        let Some(origin) = self.origin else {
            self.origin = Some(arrival);
            self.last_timestamp = timestamp;
            return;
        };

        let step = timestamp.wrapping_sub(self.last_timestamp) as i32;
        if step <= 0 {
            return;
        }
        self.last_timestamp = timestamp;
        self.elapsed_samples += step as u64;

        let span = arrival.saturating_duration_since(origin).as_secs_f64();
        if span < Self::MIN_SPAN_SECS {
            return;
        }
        let sender_secs = self.elapsed_samples as f64 / self.sample_rate;
        self.ratio.update(sender_secs / span);
    }

    /// Sender rate over local rate; 1.0 until enough time has passed.
    pub fn ratio(&self) -> f64 {
        if self.ratio.is_initialized() {
            self.ratio.value()
        } else {
            1.0
        }
    }

    /// Deviation of the sender clock in parts per million.
    pub fn drift_ppm(&self) -> f64 {
        (self.ratio() - 1.0) * 1e6
    }
}
