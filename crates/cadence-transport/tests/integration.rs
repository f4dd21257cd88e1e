//! # Integration tests: Sender ↔ Receiver through the wire format
//!
//! Sender → wire bytes → (impairment) → Receiver → samples.
//!
//! No network I/O; datagrams are passed around as `Bytes`.

use bytes::Bytes;
use quanta::Instant;
use std::time::Duration;

use cadence_transport::config::{FecConfig, StreamConfig};
use cadence_transport::jitter::BlockOutcome;
use cadence_transport::receiver::{Receiver, ReceiverEvent};
use cadence_transport::sender::{OutputPacket, Sender};
use cadence_transport::wire::Role;

// ─── Helpers ────────────────────────────────────────────────────────────────

const N: usize = 4;
const M: usize = 2;
const SAMPLES: usize = 8;

fn config() -> StreamConfig {
    StreamConfig {
        channel_mask: 0b11,
        samples_per_packet: SAMPLES / 2,
        fec: FecConfig {
            source_packets: N,
            repair_packets: M,
        },
        latency: Duration::from_millis(50),
        ..StreamConfig::default()
    }
}

/// Distinct stereo samples for `blocks` full blocks.
fn signal(blocks: usize) -> Vec<f32> {
    (0..blocks * N * SAMPLES)
        .map(|i| (i as f32 * 0.001).sin())
        .collect()
}

fn sender_output(samples: &[f32]) -> Vec<OutputPacket> {
    let mut sender = Sender::new(config()).unwrap();
    assert_eq!(sender.write(samples).unwrap(), samples.len());
    sender.drain_output().collect()
}

fn read_all(rx: &mut Receiver) -> Vec<f32> {
    let mut out = vec![0.0; rx.queued_samples()];
    let n = rx.read(&mut out);
    out.truncate(n);
    out
}

fn reports(rx: &mut Receiver) -> Vec<(u32, BlockOutcome)> {
    rx.drain_events()
        .filter_map(|e| match e {
            ReceiverEvent::BlockResolved(r) => Some((r.block_id, r.outcome)),
            _ => None,
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[test]
fn perfect_network_delivers_every_sample() {
    let input = signal(5);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for pkt in sender_output(&input) {
        rx.receive(pkt.data, now);
    }
    assert_eq!(read_all(&mut rx), input);
    assert_eq!(rx.stats().jitter.blocks_complete, 5);
    assert_eq!(rx.stats().malformed, 0);
}

#[test]
fn repairs_cover_up_to_m_losses_per_block() {
    let input = signal(6);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for (i, pkt) in sender_output(&input).into_iter().enumerate() {
        let pos = i % (N + M);
        // Lose two sources in every block, a different pair each time.
        let block = i / (N + M);
        if pos == block % N || pos == (block + 1) % N {
            continue;
        }
        rx.receive(pkt.data, now);
    }
    assert_eq!(read_all(&mut rx), input);
    assert_eq!(rx.stats().jitter.blocks_recovered, 6);
    assert_eq!(rx.stats().jitter.positions_recovered, 12);
}

#[test]
fn reordering_and_duplication_are_transparent() {
    let input = signal(4);
    let mut packets = sender_output(&input);
    // Reverse runs of four, which straddle block boundaries, and send
    // every third packet twice.
    for run in packets.chunks_mut(4) {
        run.reverse();
    }
    let dupes: Vec<Bytes> = packets.iter().step_by(3).map(|p| p.data.clone()).collect();

    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for pkt in packets {
        rx.receive(pkt.data, now);
    }
    for d in dupes {
        rx.receive(d, now);
    }
    rx.flush();
    assert_eq!(read_all(&mut rx), input);
    let stats = &rx.stats().jitter;
    assert_eq!(stats.blocks_lost, 0);
    assert!(stats.duplicates + stats.late_packets > 0);
}

#[test]
fn block_with_one_and_four_missing_is_recovered() {
    // Block 7 arrives as positions {0, 2, 3, 5}.
    let input = signal(8);
    let packets = sender_output(&input);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for pkt in packets.iter().filter(|p| p.block_id < 7) {
        rx.receive(pkt.data.clone(), now);
    }
    reports(&mut rx);
    for pkt in packets.iter().filter(|p| p.block_id == 7) {
        if [0, 2, 3, 5].contains(&pkt.position) {
            rx.receive(pkt.data.clone(), now);
        }
    }
    assert_eq!(read_all(&mut rx), input);
    assert_eq!(
        reports(&mut rx),
        vec![(7, BlockOutcome::Recovered { positions: 1 })]
    );
}

#[test]
fn wholly_lost_block_is_filled_with_silence() {
    let input = signal(10);
    let packets = sender_output(&input);
    let mut rx = Receiver::new(config()).unwrap();
    let t0 = Instant::now();

    for pkt in packets.iter().filter(|p| p.block_id <= 7) {
        rx.receive(pkt.data.clone(), t0);
    }
    let mut out = read_all(&mut rx);
    // Block 8 is lost entirely; block 9 trickles in.
    let t1 = t0 + Duration::from_millis(10);
    let block9: Vec<_> = packets.iter().filter(|p| p.block_id == 9).collect();
    rx.receive(block9[0].data.clone(), t1);
    rx.poll(t1 + Duration::from_millis(49));
    assert_eq!(rx.jitter().cursor(), Some(8));

    rx.poll(t1 + Duration::from_millis(50));
    out.extend(read_all(&mut rx));
    let block_samples = N * SAMPLES;
    assert_eq!(&out[..8 * block_samples], &input[..8 * block_samples]);
    assert!(out[8 * block_samples..9 * block_samples]
        .iter()
        .all(|&s| s == 0.0));
    assert!(rx.jitter().cursor().unwrap() >= 9);
}

#[test]
fn late_duplicate_after_resolution_is_ignored() {
    let input = signal(6);
    let packets = sender_output(&input);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for pkt in packets.iter().filter(|p| p.block_id <= 5 && p.role == Role::Source) {
        rx.receive(pkt.data.clone(), now);
    }
    let before = rx.queued_samples();
    let late = packets
        .iter()
        .find(|p| p.block_id == 5 && p.position == 2)
        .unwrap();
    rx.receive(late.data.clone(), now);

    assert_eq!(rx.queued_samples(), before);
    assert_eq!(rx.jitter().cursor(), Some(6));
    assert_eq!(rx.stats().jitter.late_packets, 1);
}

#[test]
fn garbage_between_packets_is_counted_not_fatal() {
    let input = signal(2);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for pkt in sender_output(&input) {
        rx.receive(Bytes::from_static(&[0xFF; 30]), now);
        rx.receive(pkt.data, now);
    }
    assert_eq!(read_all(&mut rx), input);
    assert_eq!(rx.stats().malformed, 12);
}

#[test]
fn sender_flush_completes_trailing_block() {
    let cfg = config();
    let mut sender = Sender::new(cfg.clone()).unwrap();
    let input = signal(1);
    sender.write(&input[..10]).unwrap();
    sender.flush().unwrap();

    let mut rx = Receiver::new(cfg).unwrap();
    let now = Instant::now();
    for pkt in sender.drain_output() {
        rx.receive(pkt.data, now);
    }
    let out = read_all(&mut rx);
    assert_eq!(out.len(), N * SAMPLES);
    assert_eq!(&out[..10], &input[..10]);
    assert!(out[10..].iter().all(|&s| s == 0.0));
}

#[test]
fn restarted_sender_is_picked_up_immediately() {
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();

    // A long first session, read as it plays.
    let mut first = Sender::new(config()).unwrap();
    let block = signal(1);
    for _ in 0..40 {
        first.write(&block).unwrap();
        for pkt in first.drain_output() {
            rx.receive(pkt.data, now);
        }
        read_all(&mut rx);
    }

    // A new sender starts again at block 0.
    let input = signal(3);
    for pkt in sender_output(&input) {
        rx.receive(pkt.data, now);
    }
    rx.flush();
    assert_eq!(read_all(&mut rx), input);
    assert_eq!(rx.stats().jitter.resyncs, 1);
    assert_eq!(rx.stats().jitter.blocks_lost, 0);
}

#[test]
fn receiver_releases_all_pool_buffers() {
    let input = signal(3);
    let mut rx = Receiver::new(config()).unwrap();
    let now = Instant::now();
    for (i, pkt) in sender_output(&input).into_iter().enumerate() {
        if i % (N + M) != 0 {
            rx.receive(pkt.data, now);
        }
    }
    assert!(rx.pool().in_use() > 0, "recovered payloads live in the pool");
    read_all(&mut rx);
    assert_eq!(rx.pool().in_use(), 0);
}
