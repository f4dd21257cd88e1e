//! # Real-Time I/O Bridge
//!
//! A dedicated thread that moves fixed-size sample frames between a device
//! and the pipeline:
//!
//! ```text
//!   capture:   SampleSource ──frame──▶ FrameWriter  (sender side)
//!   playback:  FrameReader  ──frame──▶ SampleSink   (receiver side)
//! ```
//!
//! The device is opened on the calling thread before anything is spawned,
//! so an unusable device is reported as a startup error. Once running, the
//! loop checks a shared [`StopFlag`] once per frame; the frame in flight is
//! always completed before the thread exits. Device errors end the loop and
//! come back from [`IoBridge::join`].
//!
//! Realtime devices block on the hardware themselves. Anything else (files,
//! generators) is paced to the sample rate by the bridge.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};

// ─── Device Traits ──────────────────────────────────────────────────────────

/// Where captured audio comes from.
pub trait SampleSource: Send + 'static {
    /// Open the device. Runs on the caller's thread, before the bridge
    /// thread exists.
    fn prepare(&mut self) -> Result<()>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// `true` when `read` blocks on hardware cadence.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Fill `frame` with interleaved samples. Returns the number written,
    /// a multiple of the channel count; `0` means end of stream.
    fn read(&mut self, frame: &mut [f32]) -> Result<usize>;
}

/// Where received audio goes.
pub trait SampleSink: Send + 'static {
    fn prepare(&mut self) -> Result<()>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    fn is_realtime(&self) -> bool {
        false
    }

    fn write(&mut self, frame: &[f32]) -> Result<()>;

    /// Called once when the loop ends without a device error.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Pipeline end of a capture bridge.
pub trait FrameWriter: Send + 'static {
    fn write_frame(&mut self, frame: &[f32]) -> Result<()>;

    /// End of capture, by stop or end of stream.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// What a [`FrameReader`] produced for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// This many samples were written; the rest of the frame is silence and
    /// counts as an underrun.
    Filled(usize),
    /// Nothing to play yet (still buffering). Plays silence.
    Idle,
    /// The stream has ended and is fully drained.
    Ended,
}

/// Pipeline end of a playback bridge.
pub trait FrameReader: Send + 'static {
    fn read_frame(&mut self, frame: &mut [f32]) -> FrameStatus;
}

// ─── Stop Flag ──────────────────────────────────────────────────────────────

/// Cooperative cancellation shared between a bridge and its controllers.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ─── Configuration & Results ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Samples per channel moved per iteration.
    pub frame_samples: usize,
    pub thread_name: String,
}

impl BridgeConfig {
    pub fn new(frame_samples: usize, thread_name: impl Into<String>) -> Self {
        BridgeConfig {
            frame_samples,
            thread_name: thread_name.into(),
        }
    }
}

/// How a bridge thread ended.
#[derive(Debug)]
pub enum BridgeExit {
    /// `stop()` was observed.
    Stopped,
    /// The source (capture) or reader (playback) ran dry.
    EndOfStream,
    /// The device or pipeline failed.
    Failed(StreamError),
}

impl BridgeExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, BridgeExit::Failed(_))
    }
}

#[derive(Debug, Default)]
struct BridgeCounters {
    frames: AtomicU64,
    underruns: AtomicU64,
}

/// Snapshot of a bridge's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BridgeStats {
    pub frames: u64,
    /// Playback frames that were not completely filled.
    pub underruns: u64,
}

// ─── Pacer ──────────────────────────────────────────────────────────────────

/// Deadline pacing for devices that do not block on their own. Each wait
/// sleeps at most one frame period.
struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    /// Lag beyond which the schedule restarts instead of bursting to catch up.
    const MAX_LAG_FRAMES: u32 = 4;

    fn new(period: Duration) -> Self {
        Pacer {
            period,
            next: Instant::now() + period,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next.saturating_duration_since(now));
        } else if now.saturating_duration_since(self.next) > self.period * Self::MAX_LAG_FRAMES {
            debug!("bridge fell behind schedule, resetting pacer");
            self.next = now;
        }
        self.next = self.next + self.period;
    }
}

fn frame_period(frame_samples: usize, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frame_samples as f64 / sample_rate.max(1) as f64)
}

// ─── IoBridge ───────────────────────────────────────────────────────────────

/// Handle to a running bridge thread.
///
/// Dropping the handle stops the thread and waits for it.
pub struct IoBridge {
    stop: StopFlag,
    counters: Arc<BridgeCounters>,
    handle: Option<thread::JoinHandle<BridgeExit>>,
    name: String,
}

impl IoBridge {
    /// Open `source` and start pumping frames into `writer`.
    pub fn spawn_capture<S, W>(mut source: S, writer: W, config: BridgeConfig) -> Result<Self>
    where
        S: SampleSource,
        W: FrameWriter,
    {
        source.prepare()?;
        let frame_len = config.frame_samples * source.channels() as usize;
        if frame_len == 0 {
            return Err(StreamError::device("capture frame is empty"));
        }
        let pacer = (!source.is_realtime())
            .then(|| Pacer::new(frame_period(config.frame_samples, source.sample_rate())));

        Self::spawn(config.thread_name, move |stop, counters| {
            capture_loop(source, writer, frame_len, pacer, stop, counters)
        })
    }

    /// Open `sink` and start feeding it frames from `reader`.
    pub fn spawn_playback<K, R>(mut sink: K, reader: R, config: BridgeConfig) -> Result<Self>
    where
        K: SampleSink,
        R: FrameReader,
    {
        sink.prepare()?;
        let frame_len = config.frame_samples * sink.channels() as usize;
        if frame_len == 0 {
            return Err(StreamError::device("playback frame is empty"));
        }
        let pacer = (!sink.is_realtime())
            .then(|| Pacer::new(frame_period(config.frame_samples, sink.sample_rate())));

        Self::spawn(config.thread_name, move |stop, counters| {
            playback_loop(sink, reader, frame_len, pacer, stop, counters)
        })
    }

    fn spawn<F>(name: String, body: F) -> Result<Self>
    where
        F: FnOnce(StopFlag, Arc<BridgeCounters>) -> BridgeExit + Send + 'static,
    {
        let stop = StopFlag::new();
        let counters = Arc::new(BridgeCounters::default());
        let handle = {
            let stop = stop.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || body(stop, counters))?
        };
        info!(thread = %name, "bridge started");
        Ok(IoBridge {
            stop,
            counters,
            handle: Some(handle),
            name,
        })
    }

    /// Ask the thread to exit after its current frame. Callable from any
    /// thread through [`IoBridge::stop_flag`].
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Whether the thread has already exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            underruns: self.counters.underruns.load(Ordering::Relaxed),
        }
    }

    /// Block until the thread exits.
    pub fn join(mut self) -> BridgeExit {
        self.join_inner()
    }

    fn join_inner(&mut self) -> BridgeExit {
        let Some(handle) = self.handle.take() else {
            return BridgeExit::Stopped;
        };
        let exit = handle.join().unwrap_or_else(|_| {
            BridgeExit::Failed(StreamError::Panicked {
                thread: self.name.clone(),
            })
        });
        info!(thread = %self.name, ?exit, "bridge exited");
        exit
    }
}

impl Drop for IoBridge {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            self.join_inner();
        }
    }
}

// ─── Loops ──────────────────────────────────────────────────────────────────

fn capture_loop<S: SampleSource, W: FrameWriter>(
    mut source: S,
    mut writer: W,
    frame_len: usize,
    mut pacer: Option<Pacer>,
    stop: StopFlag,
    counters: Arc<BridgeCounters>,
) -> BridgeExit {
    let mut frame = vec![0.0f32; frame_len];

    let exit = loop {
        if stop.is_stopped() {
            break BridgeExit::Stopped;
        }
        let count = match source.read(&mut frame) {
            Ok(0) => break BridgeExit::EndOfStream,
            Ok(count) => count.min(frame_len),
            Err(e) => {
                warn!(error = %e, "capture source failed");
                return BridgeExit::Failed(e);
            }
        };
        if let Err(e) = writer.write_frame(&frame[..count]) {
            warn!(error = %e, "capture pipeline failed");
            return BridgeExit::Failed(e);
        }
        counters.frames.fetch_add(1, Ordering::Relaxed);

        if let Some(pacer) = pacer.as_mut() {
            pacer.wait();
        }
    };

    match writer.finish() {
        Ok(()) => exit,
        Err(e) => BridgeExit::Failed(e),
    }
}

fn playback_loop<K: SampleSink, R: FrameReader>(
    mut sink: K,
    mut reader: R,
    frame_len: usize,
    mut pacer: Option<Pacer>,
    stop: StopFlag,
    counters: Arc<BridgeCounters>,
) -> BridgeExit {
    let mut frame = vec![0.0f32; frame_len];

    let exit = loop {
        if stop.is_stopped() {
            break BridgeExit::Stopped;
        }
        frame.fill(0.0);
        match reader.read_frame(&mut frame) {
            FrameStatus::Ended => break BridgeExit::EndOfStream,
            FrameStatus::Idle => {}
            FrameStatus::Filled(count) if count < frame_len => {
                counters.underruns.fetch_add(1, Ordering::Relaxed);
            }
            FrameStatus::Filled(_) => {}
        }
        if let Err(e) = sink.write(&frame) {
            warn!(error = %e, "playback sink failed");
            return BridgeExit::Failed(e);
        }
        counters.frames.fetch_add(1, Ordering::Relaxed);

        if let Some(pacer) = pacer.as_mut() {
            pacer.wait();
        }
    };

    match sink.finish() {
        Ok(()) => exit,
        Err(e) => BridgeExit::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Counts up from 1; ends after `frames` frames.
    struct Counter {
        next: f32,
        frames: usize,
        realtime: bool,
    }

    impl SampleSource for Counter {
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn sample_rate(&self) -> u32 {
            48_000
        }
        fn channels(&self) -> u16 {
            2
        }
        fn is_realtime(&self) -> bool {
            self.realtime
        }
        fn read(&mut self, frame: &mut [f32]) -> Result<usize> {
            if self.frames == 0 {
                return Ok(0);
            }
            self.frames -= 1;
            for s in frame.iter_mut() {
                *s = self.next;
                self.next += 1.0;
            }
            Ok(frame.len())
        }
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<f32>>>);

    impl FrameWriter for Collect {
        fn write_frame(&mut self, frame: &[f32]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(frame);
            Ok(())
        }
    }

    struct Unopenable;

    impl SampleSink for Unopenable {
        fn prepare(&mut self) -> Result<()> {
            Err(StreamError::device("no such device"))
        }
        fn sample_rate(&self) -> u32 {
            48_000
        }
        fn channels(&self) -> u16 {
            1
        }
        fn write(&mut self, _frame: &[f32]) -> Result<()> {
            unreachable!("never opened")
        }
    }

    struct Scripted(Vec<FrameStatus>);

    impl FrameReader for Scripted {
        fn read_frame(&mut self, frame: &mut [f32]) -> FrameStatus {
            if self.0.is_empty() {
                return FrameStatus::Ended;
            }
            let status = self.0.remove(0);
            if let FrameStatus::Filled(n) = status {
                frame[..n].fill(1.0);
            }
            status
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<f32>>>>);

    impl SampleSink for Recorder {
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn sample_rate(&self) -> u32 {
            48_000
        }
        fn channels(&self) -> u16 {
            1
        }
        fn is_realtime(&self) -> bool {
            true
        }
        fn write(&mut self, frame: &[f32]) -> Result<()> {
            self.0.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn capture_runs_to_end_of_stream() {
        let source = Counter {
            next: 1.0,
            frames: 5,
            realtime: true,
        };
        let out = Collect::default();
        let bridge =
            IoBridge::spawn_capture(source, out.clone(), BridgeConfig::new(4, "test-capture"))
                .unwrap();
        assert!(matches!(bridge.join(), BridgeExit::EndOfStream));

        let samples = out.0.lock().unwrap().clone();
        assert_eq!(samples.len(), 5 * 8);
        assert_eq!(samples[39], 40.0);
    }

    #[test]
    fn unopenable_device_fails_before_spawn() {
        let reader = Scripted(Vec::new());
        let err = IoBridge::spawn_playback(Unopenable, reader, BridgeConfig::new(4, "test"))
            .err()
            .expect("prepare must fail");
        assert!(err.is_device_failure());
    }

    #[test]
    fn underruns_play_silence() {
        let reader = Scripted(vec![
            FrameStatus::Idle,
            FrameStatus::Filled(4),
            FrameStatus::Filled(1),
        ]);
        let sink = Recorder::default();
        let bridge =
            IoBridge::spawn_playback(sink.clone(), reader, BridgeConfig::new(4, "test-playback"))
                .unwrap();
        let stats_handle = bridge.counters.clone();
        assert!(matches!(bridge.join(), BridgeExit::EndOfStream));

        let frames = sink.0.lock().unwrap().clone();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], vec![0.0; 4]);
        assert_eq!(frames[1], vec![1.0; 4]);
        assert_eq!(frames[2], vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(stats_handle.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn paced_capture_follows_sample_rate() {
        // 10 frames of 480 samples at 48 kHz is 100 ms of audio.
        let source = Counter {
            next: 1.0,
            frames: 10,
            realtime: false,
        };
        let start = std::time::Instant::now();
        let bridge =
            IoBridge::spawn_capture(source, Collect::default(), BridgeConfig::new(480, "paced"))
                .unwrap();
        assert!(matches!(bridge.join(), BridgeExit::EndOfStream));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn stop_is_observed_within_a_frame() {
        let source = Counter {
            next: 1.0,
            frames: usize::MAX,
            realtime: false,
        };
        let bridge =
            IoBridge::spawn_capture(source, Collect::default(), BridgeConfig::new(480, "endless"))
                .unwrap();
        thread::sleep(Duration::from_millis(30));
        let flag = bridge.stop_flag();
        let stopper = thread::spawn(move || flag.stop());
        stopper.join().unwrap();

        let start = std::time::Instant::now();
        assert!(matches!(bridge.join(), BridgeExit::Stopped));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
