//! # Sender Pipeline
//!
//! Pure logic, no I/O. Accepts interleaved f32 samples, packs them into
//! fixed-size source packets, assigns sequence numbers, block ids and
//! timestamps, and FEC-encodes each completed block into repair packets.
//!
//! Samples are written straight into a pooled wire buffer behind a reserved
//! header area, so sealing a packet is just writing the header in place. The
//! same buffer backs the queued wire bytes and the payload slice the encoder
//! reads. Repair symbols are computed directly into their own pooled wire
//! buffers.
//!
//! Output order is block-then-position: each source as soon as it is full,
//! then the block's repairs once its last source is sealed.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::warn;

use crate::codec::{symbol_len, BlockEncoder};
use crate::config::StreamConfig;
use crate::error::{Result, TransportError};
use crate::pool::{BufferPool, SequenceGenerator, SliceMut};
use crate::sample::{write_samples, SAMPLE_BYTES};
use crate::stats::SenderStats;
use crate::wire::{PacketHeader, Role, HEADER_LEN};

// ─── Output Packet ──────────────────────────────────────────────────────────

/// A packet ready for the network.
#[derive(Debug, Clone)]
pub struct OutputPacket {
    /// Serialized wire-format bytes (header + payload).
    pub data: Bytes,
    pub sequence: u32,
    pub block_id: u32,
    pub position: u16,
    pub role: Role,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

pub struct Sender {
    config: StreamConfig,
    pool: BufferPool,
    encoder: BlockEncoder,
    seq_gen: SequenceGenerator,
    block_id: u32,
    /// Payload slices of the current block's sealed sources.
    block_sources: Vec<Bytes>,
    block_timestamp: u32,
    /// Wire buffer of the packet being filled.
    current: Option<SliceMut>,
    /// Interleaved samples already in `current`.
    filled: usize,
    /// Stream position of the first sample of `current`.
    next_timestamp: u32,
    output_queue: VecDeque<OutputPacket>,
    stats: SenderStats,
}

impl Sender {
    /// Create a sender with its own pool sized from `config`.
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let pool = BufferPool::new(
            config.pool_capacity,
            config.wire_buffer_size(),
            config.acquire_mode(),
        );
        Self::with_pool(config, pool)
    }

    /// Create a sender drawing from an existing pool.
    pub fn with_pool(config: StreamConfig, pool: BufferPool) -> Result<Self> {
        if pool.buffer_size() < config.wire_buffer_size() {
            return Err(TransportError::Config(format!(
                "pool buffers of {} bytes cannot hold {}-byte packets",
                pool.buffer_size(),
                config.wire_buffer_size()
            )));
        }
        let encoder = BlockEncoder::new(config.fec.source_packets, config.fec.repair_packets)?;
        Ok(Sender {
            block_sources: Vec::with_capacity(config.fec.source_packets),
            config,
            pool,
            encoder,
            seq_gen: SequenceGenerator::new(),
            block_id: 0,
            block_timestamp: 0,
            current: None,
            filled: 0,
            next_timestamp: 0,
            output_queue: VecDeque::new(),
            stats: SenderStats::default(),
        })
    }

    /// Accept interleaved samples. Returns how many were consumed.
    ///
    /// Fails with `OutOfBuffers` only when the pool is exhausted before a
    /// single sample could be taken; a partial count is returned otherwise.
    pub fn write(&mut self, samples: &[f32]) -> Result<usize> {
        let per_packet = self.config.samples_per_payload();
        let mut consumed = 0;

        while consumed < samples.len() {
            if self.current.is_none() {
                match self.pool.acquire() {
                    Ok(buf) => self.current = Some(buf),
                    Err(e) => {
                        self.stats.pool_exhausted += 1;
                        if consumed == 0 {
                            return Err(e);
                        }
                        break;
                    }
                }
            }

            let take = (per_packet - self.filled).min(samples.len() - consumed);
            if let Some(buf) = self.current.as_mut() {
                let offset = HEADER_LEN + self.filled * SAMPLE_BYTES;
                write_samples(&mut buf[offset..], &samples[consumed..consumed + take]);
            }
            self.filled += take;
            consumed += take;

            if self.filled == per_packet {
                self.seal_source();
            }
        }

        self.stats.samples_written += consumed as u64;
        Ok(consumed)
    }

    /// Pad the open packet and block with silence and emit them.
    pub fn flush(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.seal_source();
        }
        while !self.block_sources.is_empty() {
            self.current = Some(self.pool.acquire()?);
            self.seal_source();
        }
        Ok(())
    }

    fn seal_source(&mut self) {
        let Some(mut buf) = self.current.take() else {
            return;
        };
        let payload_len = self.config.payload_len();
        let position = self.block_sources.len();
        if position == 0 {
            self.block_timestamp = self.next_timestamp;
        }

        let header = PacketHeader {
            role: Role::Source,
            sequence: self.seq_gen.next(),
            block_id: self.block_id,
            position: position as u16,
            source_count: self.encoder.source_count() as u16,
            repair_count: self.encoder.repair_count() as u16,
            payload_len: payload_len as u16,
            timestamp: self.next_timestamp,
        };
        let mut dst = &mut buf[..HEADER_LEN];
        header.encode(&mut dst);
        buf.truncate(HEADER_LEN + payload_len);

        let wire = buf.freeze();
        self.block_sources.push(wire.slice(HEADER_LEN..));
        self.enqueue(wire, &header);

        self.filled = 0;
        self.next_timestamp = self
            .next_timestamp
            .wrapping_add(self.config.samples_per_packet as u32);
        self.stats.source_packets += 1;

        if self.block_sources.len() == self.encoder.source_count() {
            self.close_block();
        }
    }

    fn close_block(&mut self) {
        if self.encoder.repair_count() > 0 {
            if let Err(e) = self.emit_repairs() {
                self.stats.repairs_skipped += 1;
                warn!(block_id = self.block_id, error = %e, "sending block without repair packets");
            }
        }
        self.block_sources.clear();
        self.block_id = self.block_id.wrapping_add(1);
        self.stats.blocks_completed += 1;
    }

    fn emit_repairs(&mut self) -> Result<()> {
        let repair_count = self.encoder.repair_count();
        let max_payload = self.block_sources.iter().map(Bytes::len).max().unwrap_or(0);
        let sym = symbol_len(max_payload);

        let mut buffers = Vec::with_capacity(repair_count);
        for _ in 0..repair_count {
            let mut buf = self.pool.acquire()?;
            buf.truncate(HEADER_LEN + sym);
            buffers.push(buf);
        }
        {
            let sources: Vec<&[u8]> = self.block_sources.iter().map(|s| &s[..]).collect();
            let mut targets: Vec<&mut [u8]> =
                buffers.iter_mut().map(|b| &mut b[HEADER_LEN..]).collect();
            self.encoder.encode_into(&sources, &mut targets)?;
        }

        let source_count = self.encoder.source_count();
        for (row, mut buf) in buffers.into_iter().enumerate() {
            let header = PacketHeader {
                role: Role::Repair,
                sequence: self.seq_gen.next(),
                block_id: self.block_id,
                position: (source_count + row) as u16,
                source_count: source_count as u16,
                repair_count: repair_count as u16,
                payload_len: sym as u16,
                timestamp: self.block_timestamp,
            };
            let mut dst = &mut buf[..HEADER_LEN];
            header.encode(&mut dst);
            self.enqueue(buf.freeze(), &header);
            self.stats.repair_packets += 1;
        }
        Ok(())
    }

    fn enqueue(&mut self, data: Bytes, header: &PacketHeader) {
        self.stats.bytes_sent += data.len() as u64;
        self.output_queue.push_back(OutputPacket {
            data,
            sequence: header.sequence,
            block_id: header.block_id,
            position: header.position,
            role: header.role,
        });
    }

    /// Drain packets ready for the network, oldest first.
    pub fn drain_output(&mut self) -> impl Iterator<Item = OutputPacket> + '_ {
        self.output_queue.drain(..)
    }

    pub fn output_queue_len(&self) -> usize {
        self.output_queue.len()
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn next_sequence(&self) -> u32 {
        self.seq_gen.current()
    }

    /// Block currently being filled.
    pub fn block_id(&self) -> u32 {
        self.block_id
    }
}
