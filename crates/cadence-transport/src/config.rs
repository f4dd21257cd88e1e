use std::time::Duration;

use serde::Deserialize;

use crate::codec::symbol_len;
use crate::error::{Result, TransportError};
use crate::pool::AcquireMode;
use crate::sample::{channel_count, SAMPLE_BYTES};
use crate::wire::{HEADER_LEN, MAX_BLOCK_PACKETS, MAX_PAYLOAD_LEN};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfigInput {
    pub version: u32,
    pub sample_rate: Option<u32>,
    pub channel_mask: Option<u32>,
    pub samples_per_packet: Option<usize>,
    pub latency_ms: Option<u64>,
    pub max_blocks: Option<usize>,
    pub max_gap_blocks: Option<usize>,
    pub pool_capacity: Option<usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub fec: FecConfigInput,
    pub drift: DriftConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub source_packets: Option<usize>,
    pub repair_packets: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriftConfigInput {
    pub tolerance_ms: Option<u64>,
    pub max_scaling: Option<f64>,
    pub p_gain: Option<f64>,
    pub i_gain: Option<f64>,
    pub smoothing: Option<f64>,
    pub report_step: Option<f64>,
}

/// Block geometry: N source packets protected by M repair packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecConfig {
    pub source_packets: usize,
    pub repair_packets: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            source_packets: 10,
            repair_packets: 5,
        }
    }
}

/// Latency controller tuning. Errors are measured in samples per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftConfig {
    /// Latency error tolerated before a resampling nudge is requested.
    pub tolerance: Duration,
    /// Largest deviation of the resampling ratio from 1.0.
    pub max_scaling: f64,
    pub p_gain: f64,
    pub i_gain: f64,
    /// EWMA factor applied to latency measurements.
    pub smoothing: f64,
    /// Minimum ratio change worth reporting.
    pub report_step: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_millis(10),
            max_scaling: 0.005,
            p_gain: 2e-6,
            i_gain: 5e-10,
            smoothing: 0.05,
            report_step: 1e-5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub version: u32,
    pub sample_rate: u32,
    pub channel_mask: u32,
    /// Samples per channel carried by one source packet.
    pub samples_per_packet: usize,
    pub fec: FecConfig,
    /// Time a block may wait for its packets after the first one arrives.
    pub latency: Duration,
    /// Blocks the jitter buffer holds at once.
    pub max_blocks: usize,
    /// Largest forward jump filled with gap blocks; beyond it the receiver
    /// resynchronises instead.
    pub max_gap_blocks: usize,
    pub pool_capacity: usize,
    /// `None` selects non-blocking pool acquisition.
    pub acquire_timeout: Option<Duration>,
    pub drift: DriftConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let fec = FecConfig::default();
        let max_blocks = 4;
        Self {
            version: CONFIG_VERSION,
            sample_rate: 48_000,
            channel_mask: 0b11,
            samples_per_packet: 240,
            fec,
            latency: Duration::from_millis(100),
            max_blocks,
            max_gap_blocks: 32,
            pool_capacity: default_pool_capacity(fec, max_blocks),
            acquire_timeout: None,
            drift: DriftConfig::default(),
        }
    }
}

/// Two windows' worth of packets plus headroom for in-flight datagrams.
fn default_pool_capacity(fec: FecConfig, max_blocks: usize) -> usize {
    max_blocks * (fec.source_packets + fec.repair_packets) * 2 + 32
}

impl StreamConfigInput {
    pub fn resolve(self) -> Result<StreamConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(TransportError::Config(format!(
                "unsupported config version {version}"
            )));
        }

        let defaults = StreamConfig::default();
        let fec_defaults = FecConfig::default();
        let fec = FecConfig {
            source_packets: self.fec.source_packets.unwrap_or(fec_defaults.source_packets),
            repair_packets: self.fec.repair_packets.unwrap_or(fec_defaults.repair_packets),
        };
        let max_blocks = self.max_blocks.unwrap_or(defaults.max_blocks);

        let drift_defaults = DriftConfig::default();
        let drift = DriftConfig {
            tolerance: self
                .drift
                .tolerance_ms
                .map(Duration::from_millis)
                .unwrap_or(drift_defaults.tolerance),
            max_scaling: self.drift.max_scaling.unwrap_or(drift_defaults.max_scaling),
            p_gain: self.drift.p_gain.unwrap_or(drift_defaults.p_gain),
            i_gain: self.drift.i_gain.unwrap_or(drift_defaults.i_gain),
            smoothing: self.drift.smoothing.unwrap_or(drift_defaults.smoothing),
            report_step: self.drift.report_step.unwrap_or(drift_defaults.report_step),
        };

        let config = StreamConfig {
            version,
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            channel_mask: self.channel_mask.unwrap_or(defaults.channel_mask),
            samples_per_packet: self.samples_per_packet.unwrap_or(defaults.samples_per_packet),
            fec,
            latency: self
                .latency_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.latency),
            max_blocks,
            max_gap_blocks: self.max_gap_blocks.unwrap_or(defaults.max_gap_blocks),
            pool_capacity: self
                .pool_capacity
                .unwrap_or_else(|| default_pool_capacity(fec, max_blocks)),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
            drift,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StreamConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(StreamConfig::default());
        }
        let parsed: StreamConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TransportError::Config(msg));
        if self.sample_rate == 0 {
            return fail("sample_rate must be positive".into());
        }
        if self.channels() == 0 {
            return fail("channel_mask selects no channels".into());
        }
        if self.samples_per_packet == 0 {
            return fail("samples_per_packet must be positive".into());
        }
        if self.fec.source_packets == 0 {
            return fail("fec.source_packets must be positive".into());
        }
        if self.fec.source_packets + self.fec.repair_packets > MAX_BLOCK_PACKETS {
            return fail(format!(
                "fec block of {}+{} exceeds {MAX_BLOCK_PACKETS} packets",
                self.fec.source_packets, self.fec.repair_packets
            ));
        }
        if symbol_len(self.payload_len()) > MAX_PAYLOAD_LEN {
            return fail(format!(
                "packet payload of {} bytes is too large",
                self.payload_len()
            ));
        }
        if self.max_blocks == 0 {
            return fail("max_blocks must be positive".into());
        }
        if self.latency < self.block_duration() {
            return fail(format!(
                "latency {:?} is shorter than one block ({:?})",
                self.latency,
                self.block_duration()
            ));
        }
        if self.pool_capacity < self.fec.source_packets + self.fec.repair_packets {
            return fail("pool_capacity cannot hold one block".into());
        }
        if !(0.0..=1.0).contains(&self.drift.smoothing) {
            return fail("drift.smoothing must be in [0, 1]".into());
        }
        if !(0.0..0.5).contains(&self.drift.max_scaling) {
            return fail("drift.max_scaling must be in [0, 0.5)".into());
        }
        Ok(())
    }

    pub fn channels(&self) -> u16 {
        channel_count(self.channel_mask)
    }

    /// Interleaved samples in one source packet.
    pub fn samples_per_payload(&self) -> usize {
        self.samples_per_packet * self.channels() as usize
    }

    /// Bytes of sample data in one source packet.
    pub fn payload_len(&self) -> usize {
        self.samples_per_payload() * SAMPLE_BYTES
    }

    /// Pool buffer size fitting any packet of the stream, header included.
    pub fn wire_buffer_size(&self) -> usize {
        HEADER_LEN + symbol_len(self.payload_len())
    }

    pub fn packet_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_packet as f64 / self.sample_rate as f64)
    }

    pub fn block_duration(&self) -> Duration {
        self.packet_duration() * self.fec.source_packets as u32
    }

    pub fn latency_samples(&self) -> usize {
        (self.latency.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    pub fn acquire_mode(&self) -> AcquireMode {
        match self.acquire_timeout {
            Some(timeout) => AcquireMode::Blocking(timeout),
            None => AcquireMode::NonBlocking,
        }
    }
}
