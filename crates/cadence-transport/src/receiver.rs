//! # Receiver Pipeline
//!
//! Pure logic, no I/O. Accepts raw datagrams from the network layer,
//! validates them, feeds the jitter buffer and queues the released source
//! payloads for the playback side.
//!
//! ## Responsibilities
//!
//! 1. **Deserialization**: decode wire packets, drop malformed ones
//! 2. **Reordering and recovery**: delegated to [`JitterBuffer`]
//! 3. **Delivery queue**: bounded, drop-oldest when the consumer stalls
//! 4. **Timing**: buffered-latency control and sender clock estimation
//!
//! The receiver does NOT manage sockets or threads; the runtime feeds it
//! datagrams and calls [`Receiver::poll`] periodically.

use bytes::Bytes;
use quanta::Instant;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{Result, TransportError};
use crate::jitter::{BlockReport, Delivered, JitterBuffer, JitterConfig};
use crate::pool::BufferPool;
use crate::sample::{read_samples, SAMPLE_BYTES};
use crate::stats::ReceiverStats;
use crate::timing::{LatencyController, RateEstimator};
use crate::wire::Packet;

// ─── Receiver Events ────────────────────────────────────────────────────────

/// Events the receiver generates for the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    /// A block left the jitter buffer.
    BlockResolved(BlockReport),
    /// The external resampler should switch to this ratio.
    Rescale(f64),
}

// ─── Receiver ───────────────────────────────────────────────────────────────

pub struct Receiver {
    config: StreamConfig,
    pool: BufferPool,
    jitter: JitterBuffer,
    controller: LatencyController,
    rate: RateEstimator,
    delivered: VecDeque<Delivered>,
    delivered_capacity: usize,
    /// Bytes of the front payload already consumed by `read`.
    read_offset: usize,
    /// Unread interleaved samples in `delivered`.
    queued_samples: usize,
    events: VecDeque<ReceiverEvent>,
    stats: ReceiverStats,
}

impl Receiver {
    /// Create a receiver with its own pool sized from `config`.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(
            config.pool_capacity,
            config.wire_buffer_size(),
            config.acquire_mode(),
        );
        Self::with_pool(config, pool)
    }

    /// Create a receiver whose datagrams and recovered payloads come from
    /// `pool`.
    pub fn with_pool(config: StreamConfig, pool: BufferPool) -> Result<Self> {
        if pool.buffer_size() < config.wire_buffer_size() {
            return Err(TransportError::Config(format!(
                "pool buffers of {} bytes cannot hold {}-byte packets",
                pool.buffer_size(),
                config.wire_buffer_size()
            )));
        }
        let jitter = JitterBuffer::new(JitterConfig::from_stream(&config), pool.clone());
        let controller =
            LatencyController::new(&config.drift, config.sample_rate, config.latency_samples());
        let delivered_capacity = config.max_blocks * config.fec.source_packets * 2;
        Ok(Receiver {
            rate: RateEstimator::new(config.sample_rate),
            config,
            pool,
            jitter,
            controller,
            delivered: VecDeque::with_capacity(delivered_capacity),
            delivered_capacity,
            read_offset: 0,
            queued_samples: 0,
            events: VecDeque::new(),
            stats: ReceiverStats {
                scaling: 1.0,
                sender_rate_ratio: 1.0,
                ..ReceiverStats::default()
            },
        })
    }

    /// Process one datagram.
    pub fn receive(&mut self, raw: Bytes, now: Instant) {
        self.stats.datagrams += 1;
        self.stats.bytes_received += raw.len() as u64;

        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "dropping datagram");
                return;
            }
        };

        if packet.is_source() {
            self.rate.observe(packet.timestamp(), now);
        }
        self.jitter.insert(packet, now);
        self.collect();
    }

    /// Resolve blocks whose deadline has passed.
    pub fn poll(&mut self, now: Instant) {
        self.jitter.poll(now);
        self.collect();
    }

    /// Release everything still buffered (end of stream).
    pub fn flush(&mut self) {
        self.jitter.flush();
        self.collect();
    }

    fn collect(&mut self) {
        while let Some(payload) = self.jitter.pop() {
            if self.delivered.len() >= self.delivered_capacity {
                self.drop_oldest();
            }
            self.queued_samples += payload.payload.len() / SAMPLE_BYTES;
            self.stats.payloads_delivered += 1;
            self.delivered.push_back(payload);
        }
        for report in self.jitter.drain_reports() {
            self.events.push_back(ReceiverEvent::BlockResolved(report));
        }
        self.stats.jitter = self.jitter.stats().clone();
    }

    fn drop_oldest(&mut self) {
        if let Some(old) = self.delivered.pop_front() {
            let unread = old.payload.len().saturating_sub(self.read_offset) / SAMPLE_BYTES;
            self.queued_samples = self.queued_samples.saturating_sub(unread);
            self.read_offset = 0;
            self.stats.overruns += 1;
        }
    }

    /// Next payload in stream order. A payload partially consumed by
    /// [`Receiver::read`] comes back without its consumed prefix.
    pub fn pop_payload(&mut self) -> Option<Delivered> {
        let mut next = self.delivered.pop_front()?;
        if self.read_offset > 0 {
            next.payload = next.payload.slice(self.read_offset.min(next.payload.len())..);
            self.read_offset = 0;
        }
        self.queued_samples = self
            .queued_samples
            .saturating_sub(next.payload.len() / SAMPLE_BYTES);
        Some(next)
    }

    /// Copy queued samples into `out`. Returns how many were written; the
    /// caller decides what to play for the rest.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(front) = self.delivered.front() else {
                break;
            };
            let count = read_samples(&front.payload[self.read_offset..], &mut out[written..]);
            written += count;
            self.read_offset += count * SAMPLE_BYTES;
            self.queued_samples = self.queued_samples.saturating_sub(count);

            let exhausted = self.read_offset + SAMPLE_BYTES > front.payload.len();
            if exhausted {
                self.delivered.pop_front();
                self.read_offset = 0;
            }
        }
        written
    }

    /// Feed the latency controller. `downstream_samples` is what the caller
    /// has buffered past the receiver (interleaved). Returns a new resampling
    /// ratio when one should be applied; it is also queued as an event.
    pub fn update_timing(&mut self, downstream_samples: usize) -> Option<f64> {
        let channels = self.config.channels().max(1) as usize;
        let interleaved = self.jitter.pending_positions() * self.config.samples_per_payload()
            + self.queued_samples
            + downstream_samples;
        let latency = (interleaved / channels) as f64;

        let nudge = self.controller.update(latency);
        self.stats.latency_samples = self.controller.latency();
        self.stats.scaling = self.controller.scaling();
        self.stats.sender_rate_ratio = self.rate.ratio();

        if let Some(ratio) = nudge {
            debug!(ratio, latency, "requesting resampler adjustment");
            self.events.push_back(ReceiverEvent::Rescale(ratio));
        }
        nudge
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ReceiverEvent> + '_ {
        self.events.drain(..)
    }

    /// Unread interleaved samples waiting in the delivery queue.
    pub fn queued_samples(&self) -> usize {
        self.queued_samples
    }

    pub fn queued_payloads(&self) -> usize {
        self.delivered.len()
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    pub fn jitter(&self) -> &JitterBuffer {
        &self.jitter
    }

    /// Pool for incoming datagrams; also backs FEC recovery.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}
