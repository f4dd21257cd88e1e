//! Property-based tests for the jitter buffer.
//!
//! Whatever order packets arrive in, and however often, the output is a
//! gapless stream in strictly increasing `(block_id, position)` order with
//! exactly N payloads per block.

use bytes::Bytes;
use proptest::prelude::*;
use quanta::Instant;
use std::time::Duration;

use cadence_transport::config::{FecConfig, StreamConfig};
use cadence_transport::jitter::{JitterBuffer, JitterConfig, PayloadKind};
use cadence_transport::pool::{AcquireMode, BufferPool};
use cadence_transport::sender::Sender;
use cadence_transport::wire::Packet;

const N: usize = 3;
const M: usize = 2;
const BLOCKS: usize = 6;

fn stream_config() -> StreamConfig {
    with_window(8)
}

/// Same stream with a jitter window of `max_blocks` blocks.
fn with_window(max_blocks: usize) -> StreamConfig {
    StreamConfig {
        channel_mask: 0b1,
        samples_per_packet: 2,
        fec: FecConfig {
            source_packets: N,
            repair_packets: M,
        },
        max_blocks,
        ..StreamConfig::default()
    }
}

fn wire_packets() -> Vec<Bytes> {
    let mut sender = Sender::new(stream_config()).unwrap();
    let samples: Vec<f32> = (0..BLOCKS * N * 2).map(|i| i as f32).collect();
    sender.write(&samples).unwrap();
    sender.drain_output().map(|o| o.data).collect()
}

proptest! {
    #[test]
    fn output_is_ordered_and_complete(
        order in Just((0..BLOCKS * (N + M)).collect::<Vec<usize>>()).prop_shuffle(),
        dupes in prop::collection::vec(0..BLOCKS * (N + M), 0..20),
    ) {
        let cfg = stream_config();
        let pool = BufferPool::new(64, cfg.wire_buffer_size(), AcquireMode::NonBlocking);
        let mut jb = JitterBuffer::new(JitterConfig::from_stream(&cfg), pool);
        let packets = wire_packets();
        let now = Instant::now();

        // Block 0 opens the stream so every later block lies ahead of it.
        jb.insert(Packet::decode(packets[0].clone()).unwrap(), now);
        for &i in order.iter().chain(&dupes) {
            jb.insert(Packet::decode(packets[i].clone()).unwrap(), now);
        }
        jb.poll(now + Duration::from_secs(5));
        jb.flush();

        let out: Vec<_> = jb.drain_delivered().collect();
        prop_assert_eq!(out.len(), BLOCKS * N);
        for pair in out.windows(2) {
            prop_assert!(
                (pair[0].block_id, pair[0].position) < (pair[1].block_id, pair[1].position)
            );
        }
        for (i, d) in out.iter().enumerate() {
            prop_assert_eq!(d.block_id as usize, i / N);
            prop_assert_eq!(d.position as usize, i % N);
            prop_assert_ne!(d.kind, PayloadKind::Filled);
        }
    }

    #[test]
    fn narrow_window_fast_forwards_in_order(
        order in Just((0..BLOCKS * (N + M)).collect::<Vec<usize>>()).prop_shuffle(),
        dupes in prop::collection::vec(0..BLOCKS * (N + M), 0..20),
        max_blocks in 1usize..BLOCKS,
    ) {
        let cfg = with_window(max_blocks);
        let pool = BufferPool::new(64, cfg.wire_buffer_size(), AcquireMode::NonBlocking);
        let mut jb = JitterBuffer::new(JitterConfig::from_stream(&cfg), pool);
        let packets = wire_packets();
        let now = Instant::now();

        jb.insert(Packet::decode(packets[0].clone()).unwrap(), now);
        for &i in order.iter().chain(&dupes) {
            jb.insert(Packet::decode(packets[i].clone()).unwrap(), now);
            prop_assert!(jb.blocks_held() <= max_blocks);
        }
        jb.flush();

        // Forced blocks may be gap-filled, but every block appears once,
        // in order, with exactly N positions.
        let out: Vec<_> = jb.drain_delivered().collect();
        prop_assert_eq!(out.len(), BLOCKS * N);
        for (i, d) in out.iter().enumerate() {
            prop_assert_eq!(d.block_id as usize, i / N);
            prop_assert_eq!(d.position as usize, i % N);
        }
        prop_assert_eq!(jb.stats().resyncs, 0);
    }

    #[test]
    fn lossy_arrival_still_yields_n_per_block(
        drop_mask in prop::collection::vec(any::<bool>(), BLOCKS * (N + M)),
    ) {
        let cfg = stream_config();
        let pool = BufferPool::new(64, cfg.wire_buffer_size(), AcquireMode::NonBlocking);
        let mut jb = JitterBuffer::new(JitterConfig::from_stream(&cfg), pool);
        let packets = wire_packets();
        let now = Instant::now();

        jb.insert(Packet::decode(packets[0].clone()).unwrap(), now);
        for (i, data) in packets.iter().enumerate().skip(1) {
            if !drop_mask[i] {
                jb.insert(Packet::decode(data.clone()).unwrap(), now);
            }
        }
        jb.flush();

        let out: Vec<_> = jb.drain_delivered().collect();
        let last_block = out.last().map_or(0, |d| d.block_id as usize);
        prop_assert_eq!(out.len(), (last_block + 1) * N);
        for (i, d) in out.iter().enumerate() {
            prop_assert_eq!(d.block_id as usize, i / N);
            prop_assert_eq!(d.position as usize, i % N);
        }
    }
}
