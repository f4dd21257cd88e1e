//! # Session Threads
//!
//! Sender session (one thread):
//!
//! ```text
//!   SampleSource ─▶ [capture bridge: Sender::write ─▶ DatagramSink]
//! ```
//!
//! Receiver session (two threads):
//!
//! ```text
//!   DatagramSource ─▶ [network: Receiver] ─▶ rtrb ring ─▶ [playback bridge] ─▶ SampleSink
//! ```
//!
//! The network thread is the only owner of the receiver and its jitter
//! buffer. Playback holds off until the ring has buffered the configured
//! latency, and buffers again after running dry.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cadence_transport::config::StreamConfig;
use cadence_transport::receiver::Receiver;
use cadence_transport::sender::Sender;
use cadence_transport::stats::{ReceiverStats, SenderStats};
use cadence_transport::TransportError;
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::bridge::{
    BridgeConfig, BridgeExit, BridgeStats, FrameReader, FrameStatus, FrameWriter, IoBridge,
    SampleSink, SampleSource, StopFlag,
};
use crate::error::{Result, StreamError};
use crate::link::{DatagramSink, DatagramSource};

/// Longest a network receive blocks before the loop services deadlines.
const RECV_TIMEOUT: Duration = Duration::from_millis(5);
/// How often buffered latency is measured and stats are published.
const TIMING_INTERVAL: Duration = Duration::from_millis(20);

// ─── Rate Control ───────────────────────────────────────────────────────────

/// Receives resampling ratios requested by the drift controller. A ratio
/// above 1.0 means playback should consume faster.
pub trait RateControl: Send + 'static {
    fn set_ratio(&mut self, ratio: f64);
}

/// Logs requests without acting on them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRateControl;

impl RateControl for LogRateControl {
    fn set_ratio(&mut self, ratio: f64) {
        info!(ratio, "resampling ratio requested");
    }
}

fn check_format(config: &StreamConfig, sample_rate: u32, channels: u16) -> Result<()> {
    if sample_rate != config.sample_rate || channels != config.channels() {
        return Err(TransportError::Config(format!(
            "device runs {sample_rate} Hz x {channels} ch, stream is {} Hz x {} ch",
            config.sample_rate,
            config.channels()
        ))
        .into());
    }
    Ok(())
}

fn publish<T: Clone>(slot: &Mutex<T>, value: &T) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = value.clone();
}

// ─── Sender Session ─────────────────────────────────────────────────────────

/// Capture-side pipeline end: packetizes frames and sends them inline.
struct NetworkWriter<L> {
    sender: Sender,
    link: L,
    stats: Arc<Mutex<SenderStats>>,
    send_errors: u64,
}

impl<L: DatagramSink> NetworkWriter<L> {
    fn transmit(&mut self) -> Result<()> {
        for packet in self.sender.drain_output() {
            match self.link.send(packet.data) {
                Ok(()) => {}
                Err(StreamError::Closed) => return Err(StreamError::Closed),
                Err(e) => {
                    self.send_errors += 1;
                    debug!(error = %e, sequence = packet.sequence, "send failed");
                }
            }
        }
        Ok(())
    }
}

impl<L: DatagramSink> FrameWriter for NetworkWriter<L> {
    fn write_frame(&mut self, frame: &[f32]) -> Result<()> {
        let mut offset = 0;
        while offset < frame.len() {
            match self.sender.write(&frame[offset..]) {
                Ok(consumed) => offset += consumed,
                Err(e @ TransportError::OutOfBuffers { .. }) => {
                    warn!(error = %e, dropped = frame.len() - offset, "dropping captured samples");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            self.transmit()?;
        }
        publish(&self.stats, self.sender.stats());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.transmit()?;
        self.sender.flush()?;
        self.transmit()?;
        self.link.flush()?;
        publish(&self.stats, self.sender.stats());
        info!(
            packets = self.sender.stats().source_packets,
            repairs = self.sender.stats().repair_packets,
            send_errors = self.send_errors,
            "sender finished"
        );
        Ok(())
    }
}

pub struct SenderSession {
    bridge: IoBridge,
    stats: Arc<Mutex<SenderStats>>,
}

impl SenderSession {
    /// Open `source` and start streaming it to `link`.
    pub fn start<S, L>(config: StreamConfig, source: S, link: L) -> Result<Self>
    where
        S: SampleSource,
        L: DatagramSink,
    {
        check_format(&config, source.sample_rate(), source.channels())?;
        let stats = Arc::new(Mutex::new(SenderStats::default()));
        let writer = NetworkWriter {
            sender: Sender::new(config.clone())?,
            link,
            stats: stats.clone(),
            send_errors: 0,
        };
        let bridge = IoBridge::spawn_capture(
            source,
            writer,
            BridgeConfig::new(config.samples_per_packet, "cadence-capture"),
        )?;
        info!(
            sample_rate = config.sample_rate,
            channels = config.channels(),
            fec_n = config.fec.source_packets,
            fec_m = config.fec.repair_packets,
            "sender session started"
        );
        Ok(SenderSession { bridge, stats })
    }

    pub fn stop(&self) {
        self.bridge.stop();
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.bridge.stop_flag()
    }

    pub fn is_finished(&self) -> bool {
        self.bridge.is_finished()
    }

    pub fn stats(&self) -> SenderStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn capture_stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    pub fn join(self) -> BridgeExit {
        self.bridge.join()
    }
}

// ─── Receiver Session ───────────────────────────────────────────────────────

/// Playback-side pipeline end: drains the sample ring.
struct RingReader {
    consumer: rtrb::Consumer<f32>,
    channels: usize,
    /// Samples to buffer before playing.
    prime: usize,
    primed: bool,
}

impl FrameReader for RingReader {
    fn read_frame(&mut self, frame: &mut [f32]) -> FrameStatus {
        // Abandonment first: once seen, the slot count is final.
        let upstream_done = self.consumer.is_abandoned();
        let available = self.consumer.slots();
        if available == 0 && upstream_done {
            return FrameStatus::Ended;
        }
        if !self.primed {
            if available < self.prime && !upstream_done {
                return FrameStatus::Idle;
            }
            self.primed = true;
        }
        if available == 0 {
            debug!("playback ran dry, buffering");
            self.primed = false;
            return FrameStatus::Filled(0);
        }

        let count = available.min(frame.len()) / self.channels * self.channels;
        match self.consumer.read_chunk(count) {
            Ok(chunk) => {
                let (first, second) = chunk.as_slices();
                frame[..first.len()].copy_from_slice(first);
                frame[first.len()..count].copy_from_slice(second);
                chunk.commit_all();
                FrameStatus::Filled(count)
            }
            Err(_) => FrameStatus::Filled(0),
        }
    }
}

/// Move whole frames of delivered samples into the ring.
fn feed_ring(receiver: &mut Receiver, producer: &mut rtrb::Producer<f32>, channels: usize) {
    let count = producer.slots().min(receiver.queued_samples()) / channels * channels;
    if count == 0 {
        return;
    }
    if let Ok(mut chunk) = producer.write_chunk(count) {
        let (first, second) = chunk.as_mut_slices();
        let written = receiver.read(first) + receiver.read(second);
        chunk.commit(written);
    }
}

fn network_loop<L: DatagramSource, R: RateControl>(
    mut receiver: Receiver,
    mut link: L,
    mut producer: rtrb::Producer<f32>,
    ring_capacity: usize,
    mut rate_control: R,
    stop: StopFlag,
    stats: Arc<Mutex<ReceiverStats>>,
) {
    let pool = receiver.pool().clone();
    let channels = receiver.config().channels().max(1) as usize;
    let mut link_closed = false;
    let mut last_timing = Instant::now();

    while !stop.is_stopped() {
        if link_closed {
            thread::sleep(RECV_TIMEOUT);
        } else {
            match pool.acquire() {
                Ok(mut buf) => match link.recv(&mut buf[..], RECV_TIMEOUT) {
                    Ok(Some(len)) => {
                        buf.truncate(len);
                        receiver.receive(buf.freeze(), Instant::now());
                    }
                    Ok(None) => {}
                    Err(StreamError::Closed) => {
                        info!("link closed, draining receiver");
                        receiver.flush();
                        link_closed = true;
                    }
                    Err(e) => {
                        warn!(error = %e, "receive failed");
                        thread::sleep(RECV_TIMEOUT);
                    }
                },
                Err(e) => {
                    debug!(error = %e, "no buffer for incoming datagram");
                    thread::sleep(RECV_TIMEOUT);
                }
            }
        }

        let now = Instant::now();
        receiver.poll(now);
        feed_ring(&mut receiver, &mut producer, channels);

        if now.saturating_duration_since(last_timing) >= TIMING_INTERVAL {
            last_timing = now;
            let downstream = ring_capacity - producer.slots();
            if let Some(ratio) = receiver.update_timing(downstream) {
                rate_control.set_ratio(ratio);
            }
            receiver.drain_events().for_each(drop);
            publish(&stats, receiver.stats());
        }

        if link_closed && receiver.queued_samples() == 0 {
            break;
        }
    }

    publish(&stats, receiver.stats());
    info!(
        delivered = receiver.stats().payloads_delivered,
        lost_blocks = receiver.stats().jitter.blocks_lost,
        "network thread exiting"
    );
}

pub struct ReceiverSession {
    stop: StopFlag,
    network: Option<thread::JoinHandle<()>>,
    playback: Option<IoBridge>,
    stats: Arc<Mutex<ReceiverStats>>,
}

impl ReceiverSession {
    /// Open `sink`, then start the network and playback threads.
    pub fn start<L, K, R>(config: StreamConfig, link: L, sink: K, rate_control: R) -> Result<Self>
    where
        L: DatagramSource,
        K: SampleSink,
        R: RateControl,
    {
        check_format(&config, sink.sample_rate(), sink.channels())?;
        let receiver = Receiver::new(config.clone())?;

        let channels = config.channels() as usize;
        let prime = config.latency_samples() * channels;
        let block = config.samples_per_payload() * config.fec.source_packets;
        let ring_capacity = prime * 2 + block;
        let (producer, consumer) = rtrb::RingBuffer::<f32>::new(ring_capacity);

        let reader = RingReader {
            consumer,
            channels,
            prime,
            primed: false,
        };
        let playback = IoBridge::spawn_playback(
            sink,
            reader,
            BridgeConfig::new(config.samples_per_packet, "cadence-playback"),
        )?;

        let stop = StopFlag::new();
        let stats = Arc::new(Mutex::new(ReceiverStats::default()));
        let network = {
            let stop = stop.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name("cadence-network".into())
                .spawn(move || {
                    network_loop(receiver, link, producer, ring_capacity, rate_control, stop, stats)
                })?
        };
        info!(
            latency_ms = config.latency.as_millis() as u64,
            max_blocks = config.max_blocks,
            "receiver session started"
        );

        Ok(ReceiverSession {
            stop,
            network: Some(network),
            playback: Some(playback),
            stats,
        })
    }

    /// Stop both threads after their current iteration.
    pub fn stop(&self) {
        self.stop.stop();
        if let Some(playback) = self.playback.as_ref() {
            playback.stop();
        }
    }

    /// Whether playback has ended.
    pub fn is_finished(&self) -> bool {
        self.playback.as_ref().map_or(true, IoBridge::is_finished)
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn playback_stats(&self) -> BridgeStats {
        self.playback
            .as_ref()
            .map(IoBridge::stats)
            .unwrap_or_default()
    }

    /// Wait for playback to end (end of stream or `stop`), then shut the
    /// network thread down.
    pub fn join(mut self) -> BridgeExit {
        self.join_inner()
    }

    fn join_inner(&mut self) -> BridgeExit {
        let exit = match self.playback.take() {
            Some(playback) => playback.join(),
            None => BridgeExit::Stopped,
        };
        self.stop.stop();
        if let Some(network) = self.network.take() {
            if network.join().is_err() {
                warn!("network thread panicked");
            }
        }
        exit
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        if self.playback.is_some() || self.network.is_some() {
            self.stop();
            self.join_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> (rtrb::Producer<f32>, RingReader) {
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        let reader = RingReader {
            consumer,
            channels: 2,
            prime: 8,
            primed: false,
        };
        (producer, reader)
    }

    #[test]
    fn reader_waits_for_prime_then_plays() {
        let (mut producer, mut reader) = ring(32);
        let mut frame = [0.0f32; 4];
        for i in 0..6 {
            producer.push(i as f32).unwrap();
        }
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Idle);

        producer.push(6.0).unwrap();
        producer.push(7.0).unwrap();
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(4));
        assert_eq!(frame, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn reader_rebuffers_after_running_dry() {
        let (mut producer, mut reader) = ring(32);
        let mut frame = [0.0f32; 4];
        for i in 0..8 {
            producer.push(i as f32).unwrap();
        }
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(4));
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(4));
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(0));

        producer.push(1.0).unwrap();
        producer.push(1.0).unwrap();
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Idle);
    }

    #[test]
    fn reader_keeps_channel_alignment() {
        let (mut producer, mut reader) = ring(32);
        reader.prime = 0;
        for i in 0..3 {
            producer.push(i as f32).unwrap();
        }
        let mut frame = [0.0f32; 4];
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(2));
    }

    #[test]
    fn abandoned_ring_ends_after_draining() {
        let (mut producer, mut reader) = ring(32);
        producer.push(1.0).unwrap();
        producer.push(2.0).unwrap();
        drop(producer);
        let mut frame = [0.0f32; 4];
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Filled(2));
        assert_eq!(reader.read_frame(&mut frame), FrameStatus::Ended);
    }

    #[test]
    fn mismatched_device_format_is_rejected() {
        let config = StreamConfig::default();
        assert!(check_format(&config, 44_100, 2).is_err());
        assert!(check_format(&config, 48_000, 1).is_err());
        assert!(check_format(&config, 48_000, 2).is_ok());
    }
}
