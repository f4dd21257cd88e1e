//! # Jitter Buffer
//!
//! Holds packets of a small window of blocks, indexed by
//! `block_id - cursor`, and releases them as a gapless stream of source
//! payloads in strictly increasing `(block_id, position)` order.
//!
//! Block lifecycle:
//!
//! ```text
//!   OPEN ──(≥ N packets, or first arrival + latency)──▶ READY
//!   READY ──(reaches the cursor)──▶ RESOLVED ──▶ dropped
//! ```
//!
//! Only the block at the cursor is ever resolved, so a later block that is
//! ready early waits for its predecessors. A block at the cursor that never
//! received a packet is resolved as soon as any later block in the window
//! passes its deadline.
//!
//! A packet too far ahead of the window fast-forwards the cursor by
//! force-resolving the blocks in between. A jump larger than
//! `max_gap_blocks` is treated as a stream discontinuity: the window is
//! flushed and the cursor moves straight to the new block.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use tracing::{debug, warn};

use crate::codec::BlockDecoder;
use crate::config::StreamConfig;
use crate::pool::BufferPool;
use crate::stats::JitterStats;
use crate::wire::Packet;

// ─── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Wait after a block's first packet before it is resolved regardless.
    pub latency: Duration,
    /// Blocks held at once.
    pub max_blocks: usize,
    /// Largest forward jump that is gap-filled block by block.
    pub max_gap_blocks: usize,
    /// Geometry assumed for blocks that never received a packet.
    pub source_packets: usize,
    pub repair_packets: usize,
    /// Size of the default (silent) gap payload.
    pub gap_payload_len: usize,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self::from_stream(&StreamConfig::default())
    }
}

impl JitterConfig {
    pub fn from_stream(config: &StreamConfig) -> Self {
        Self {
            latency: config.latency,
            max_blocks: config.max_blocks,
            max_gap_blocks: config.max_gap_blocks,
            source_packets: config.fec.source_packets,
            repair_packets: config.fec.repair_packets,
            gap_payload_len: config.payload_len(),
        }
    }
}

// ─── Output Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Arrived over the network.
    Received,
    /// Rebuilt by FEC.
    Recovered,
    /// Substituted with the gap payload.
    Filled,
}

/// One source position released downstream.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub block_id: u32,
    pub position: u16,
    pub payload: Bytes,
    pub kind: PayloadKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Every source arrived.
    Complete,
    /// Missing sources rebuilt by FEC.
    Recovered { positions: usize },
    /// Fewer than N packets; `filled` positions got the gap payload.
    Lost { filled: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub block_id: u32,
    pub outcome: BlockOutcome,
    /// Resolved early to make room, or by `flush`.
    pub forced: bool,
}

/// What happened to an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    Duplicate,
    Late,
    GeometryMismatch,
}

// ─── Block State ────────────────────────────────────────────────────────────

struct PendingBlock {
    source_count: usize,
    repair_count: usize,
    /// Payloads indexed by position; `None` until that packet arrives.
    shards: Vec<Option<Bytes>>,
    received: usize,
    deadline: Instant,
}

impl PendingBlock {
    fn new(source_count: usize, repair_count: usize, deadline: Instant) -> Self {
        PendingBlock {
            source_count,
            repair_count,
            shards: vec![None; source_count + repair_count],
            received: 0,
            deadline,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.received >= self.source_count || self.deadline <= now
    }
}

// ─── JitterBuffer ───────────────────────────────────────────────────────────

pub struct JitterBuffer {
    config: JitterConfig,
    pool: BufferPool,
    gap_fill: Bytes,
    /// Next block to resolve. Set by the first packet ever inserted.
    cursor: Option<u32>,
    /// `window[k]` is block `cursor + k`. Never longer than `max_blocks`.
    window: VecDeque<Option<PendingBlock>>,
    /// Geometry of the most recent block seen.
    geometry: (usize, usize),
    output: VecDeque<Delivered>,
    reports: VecDeque<BlockReport>,
    stats: JitterStats,
}

impl JitterBuffer {
    /// `pool` supplies the buffers that FEC recovery writes into.
    pub fn new(config: JitterConfig, pool: BufferPool) -> Self {
        let gap_fill = Bytes::from(vec![0u8; config.gap_payload_len]);
        let max_blocks = config.max_blocks.max(1);
        JitterBuffer {
            geometry: (config.source_packets.max(1), config.repair_packets),
            config: JitterConfig {
                max_blocks,
                ..config
            },
            pool,
            gap_fill,
            cursor: None,
            window: VecDeque::with_capacity(max_blocks),
            output: VecDeque::new(),
            reports: VecDeque::new(),
            stats: JitterStats::default(),
        }
    }

    /// Replace the payload used for positions that cannot be recovered.
    pub fn set_gap_fill(&mut self, payload: Bytes) {
        self.gap_fill = payload;
    }

    /// Add a packet and release whatever became ready.
    pub fn insert(&mut self, packet: Packet, now: Instant) -> InsertOutcome {
        let block_id = packet.block_id();
        let cursor = *self.cursor.get_or_insert(block_id);

        let delta = block_id.wrapping_sub(cursor) as i32;
        let mut delta = if delta >= 0 {
            delta as usize
        } else if delta.unsigned_abs() as usize > self.config.max_gap_blocks {
            // Far behind the cursor: the sender restarted.
            self.resync(block_id);
            0
        } else {
            self.stats.late_packets += 1;
            debug!(block_id, cursor, "late packet discarded");
            return InsertOutcome::Late;
        };

        if delta >= self.config.max_blocks {
            let skip = delta - self.config.max_blocks + 1;
            if skip > self.config.max_gap_blocks {
                self.resync(block_id);
                delta = 0;
            } else {
                for _ in 0..skip {
                    self.resolve_front(true);
                }
                delta = self.config.max_blocks - 1;
            }
        }

        while self.window.len() <= delta {
            self.window.push_back(None);
        }

        let header = *packet.header();
        let (n, m) = (header.source_count as usize, header.repair_count as usize);
        let deadline = now + self.config.latency;
        let block = self.window[delta].get_or_insert_with(|| PendingBlock::new(n, m, deadline));

        if block.source_count != n || block.repair_count != m {
            self.stats.geometry_mismatches += 1;
            debug!(block_id, n, m, "packet geometry disagrees with its block");
            return InsertOutcome::GeometryMismatch;
        }

        let slot = &mut block.shards[header.position as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            return InsertOutcome::Duplicate;
        }
        *slot = Some(packet.into_payload());
        block.received += 1;

        self.geometry = (n, m);
        self.stats.packets_inserted += 1;
        self.release(now);
        InsertOutcome::Accepted
    }

    /// Resolve every block at the cursor whose deadline has passed.
    pub fn poll(&mut self, now: Instant) {
        self.release(now);
    }

    /// Force-resolve everything still held (end of stream).
    pub fn flush(&mut self) {
        while !self.window.is_empty() {
            self.resolve_front(true);
        }
    }

    fn release(&mut self, now: Instant) {
        loop {
            let ready = match self.window.front() {
                None => false,
                Some(Some(block)) => block.is_ready(now),
                Some(None) => self
                    .window
                    .iter()
                    .skip(1)
                    .flatten()
                    .any(|b| b.deadline <= now),
            };
            if !ready {
                break;
            }
            self.resolve_front(false);
        }
    }

    fn resync(&mut self, block_id: u32) {
        warn!(
            cursor = self.cursor,
            block_id, "stream discontinuity, resynchronising jitter buffer"
        );
        self.flush();
        self.cursor = Some(block_id);
        self.stats.resyncs += 1;
    }

    fn resolve_front(&mut self, forced: bool) {
        let Some(block_id) = self.cursor else {
            return;
        };
        let entry = self.window.pop_front().flatten();
        self.cursor = Some(block_id.wrapping_add(1));
        if forced {
            self.stats.blocks_forced += 1;
        }

        let outcome = match entry {
            Some(block) => self.emit_block(block_id, block),
            None => self.emit_gap_block(block_id),
        };
        self.reports.push_back(BlockReport {
            block_id,
            outcome,
            forced,
        });
    }

    fn emit_block(&mut self, block_id: u32, block: PendingBlock) -> BlockOutcome {
        let n = block.source_count;
        let missing = block.shards[..n].iter().filter(|s| s.is_none()).count();

        if missing == 0 {
            for (position, payload) in block.shards.into_iter().take(n).flatten().enumerate() {
                self.push(block_id, position, payload, PayloadKind::Received);
            }
            self.stats.blocks_complete += 1;
            return BlockOutcome::Complete;
        }

        let decoded = BlockDecoder::new(n, block.repair_count)
            .and_then(|decoder| decoder.decode(block_id, &block.shards, &self.pool));

        match decoded {
            Ok(sources) => {
                for (position, payload) in sources.into_iter().enumerate() {
                    let kind = if block.shards[position].is_some() {
                        PayloadKind::Received
                    } else {
                        PayloadKind::Recovered
                    };
                    self.push(block_id, position, payload, kind);
                }
                self.stats.blocks_recovered += 1;
                self.stats.positions_recovered += missing as u64;
                BlockOutcome::Recovered { positions: missing }
            }
            Err(e) => {
                warn!(block_id, missing, received = block.received, error = %e, "filling gaps");
                for (position, shard) in block.shards.into_iter().take(n).enumerate() {
                    match shard {
                        Some(payload) => self.push(block_id, position, payload, PayloadKind::Received),
                        None => {
                            let fill = self.gap_fill.clone();
                            self.push(block_id, position, fill, PayloadKind::Filled);
                        }
                    }
                }
                self.stats.blocks_lost += 1;
                self.stats.positions_filled += missing as u64;
                BlockOutcome::Lost { filled: missing }
            }
        }
    }

    fn emit_gap_block(&mut self, block_id: u32) -> BlockOutcome {
        let n = self.geometry.0;
        debug!(block_id, "no packets for block, filling");
        for position in 0..n {
            let fill = self.gap_fill.clone();
            self.push(block_id, position, fill, PayloadKind::Filled);
        }
        self.stats.blocks_lost += 1;
        self.stats.positions_filled += n as u64;
        BlockOutcome::Lost { filled: n }
    }

    fn push(&mut self, block_id: u32, position: usize, payload: Bytes, kind: PayloadKind) {
        self.output.push_back(Delivered {
            block_id,
            position: position as u16,
            payload,
            kind,
        });
    }

    /// Next released source payload, in stream order.
    pub fn pop(&mut self) -> Option<Delivered> {
        self.output.pop_front()
    }

    pub fn drain_delivered(&mut self) -> impl Iterator<Item = Delivered> + '_ {
        self.output.drain(..)
    }

    pub fn drain_reports(&mut self) -> impl Iterator<Item = BlockReport> + '_ {
        self.reports.drain(..)
    }

    pub fn cursor(&self) -> Option<u32> {
        self.cursor
    }

    /// Blocks currently held, including empty placeholders.
    pub fn blocks_held(&self) -> usize {
        self.window.len()
    }

    /// Source positions that held blocks will release once resolved.
    pub fn pending_positions(&self) -> usize {
        self.window
            .iter()
            .map(|b| b.as_ref().map_or(self.geometry.0, |b| b.source_count))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.output.is_empty()
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }
}
