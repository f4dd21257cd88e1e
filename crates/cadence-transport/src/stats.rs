//! # Transport Statistics
//!
//! Counters for the sender, the jitter buffer and the receiver pipeline.
//! All stats serialize to JSON for periodic reporting.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Interleaved samples accepted by `write`.
    pub samples_written: u64,
    /// Source packets produced.
    pub source_packets: u64,
    /// Repair packets produced.
    pub repair_packets: u64,
    /// Blocks closed (with or without repairs).
    pub blocks_completed: u64,
    /// Wire bytes produced, headers included.
    pub bytes_sent: u64,
    /// Writes that could not get a buffer.
    pub pool_exhausted: u64,
    /// Blocks sent without repairs because the pool ran dry.
    pub repairs_skipped: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair overhead relative to source traffic.
    pub fn repair_ratio(&self) -> f64 {
        if self.source_packets == 0 {
            0.0
        } else {
            self.repair_packets as f64 / self.source_packets as f64
        }
    }
}

// ─── Jitter Stats ───────────────────────────────────────────────────────────

/// Jitter buffer accounting, per packet and per block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterStats {
    /// Packets accepted into a block.
    pub packets_inserted: u64,
    /// Packets for a position already held.
    pub duplicates: u64,
    /// Packets for a block behind the cursor.
    pub late_packets: u64,
    /// Packets whose block geometry disagreed with the block's first packet.
    pub geometry_mismatches: u64,
    /// Blocks whose sources all arrived.
    pub blocks_complete: u64,
    /// Blocks repaired by FEC.
    pub blocks_recovered: u64,
    /// Blocks emitted with gap-filled positions.
    pub blocks_lost: u64,
    /// Blocks resolved before their deadline to make room.
    pub blocks_forced: u64,
    /// Source positions rebuilt by FEC.
    pub positions_recovered: u64,
    /// Source positions substituted with the gap payload.
    pub positions_filled: u64,
    /// Forward jumps too large to fill.
    pub resyncs: u64,
}

impl JitterStats {
    /// Share of emitted blocks that needed gap filling.
    pub fn block_loss_rate(&self) -> f64 {
        let total = self.blocks_complete + self.blocks_recovered + self.blocks_lost;
        if total == 0 {
            0.0
        } else {
            self.blocks_lost as f64 / total as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Datagrams handed to `receive`.
    pub datagrams: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Datagrams that failed wire validation.
    pub malformed: u64,
    /// Payloads handed downstream.
    pub payloads_delivered: u64,
    /// Payloads dropped because the delivery queue was full.
    pub overruns: u64,
    /// Smoothed end-to-end buffered latency in samples per channel.
    pub latency_samples: f64,
    /// Last resampling ratio requested.
    pub scaling: f64,
    /// Estimated sender clock rate relative to the local clock.
    pub sender_rate_ratio: f64,
    pub jitter: JitterStats,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of received datagrams that were usable.
    pub fn valid_ratio(&self) -> f64 {
        if self.datagrams == 0 {
            0.0
        } else {
            (self.datagrams - self.malformed) as f64 / self.datagrams as f64
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
