//! Sample sources and sinks.
//!
//! Raw PCM files are headerless interleaved little-endian f32, the same
//! sample encoding the wire payloads use.

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cadence_transport::sample::{read_samples, write_samples, SAMPLE_BYTES};

use crate::bridge::{SampleSink, SampleSource};
use crate::error::{Result, StreamError};

// ─── Tone Generator ─────────────────────────────────────────────────────────

/// Sine wave on every channel, optionally limited in length.
#[derive(Debug, Clone)]
pub struct ToneSource {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
    channels: u16,
    phase: f64,
    /// Frames (samples per channel) left; `None` runs forever.
    remaining: Option<u64>,
}

impl ToneSource {
    pub fn new(frequency: f64, sample_rate: u32, channels: u16) -> Self {
        ToneSource {
            frequency,
            amplitude: 0.5,
            sample_rate,
            channels,
            phase: 0.0,
            remaining: None,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Stop after `seconds` of audio.
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.remaining = Some((seconds * self.sample_rate as f64).round() as u64);
        self
    }
}

impl SampleSource for ToneSource {
    fn prepare(&mut self) -> Result<()> {
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(StreamError::device("tone needs a sample rate and channels"));
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, frame: &mut [f32]) -> Result<usize> {
        let channels = self.channels as usize;
        let mut frames = (frame.len() / channels) as u64;
        if let Some(remaining) = self.remaining.as_mut() {
            frames = frames.min(*remaining);
            *remaining -= frames;
        }

        let step = TAU * self.frequency / self.sample_rate as f64;
        for chunk in frame.chunks_exact_mut(channels).take(frames as usize) {
            chunk.fill(self.amplitude * self.phase.sin() as f32);
            self.phase = (self.phase + step) % TAU;
        }
        Ok(frames as usize * channels)
    }
}

// ─── Raw PCM Files ──────────────────────────────────────────────────────────

pub struct RawPcmSource {
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    reader: Option<BufReader<File>>,
    scratch: Vec<u8>,
}

impl RawPcmSource {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32, channels: u16) -> Self {
        RawPcmSource {
            path: path.into(),
            sample_rate,
            channels,
            reader: None,
            scratch: Vec::new(),
        }
    }
}

impl SampleSource for RawPcmSource {
    fn prepare(&mut self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| {
            StreamError::device(format!("cannot open {}: {e}", self.path.display()))
        })?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, frame: &mut [f32]) -> Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(StreamError::device("source read before prepare"));
        };
        self.scratch.resize(frame.len() * SAMPLE_BYTES, 0);

        let mut filled = 0;
        while filled < self.scratch.len() {
            match reader.read(&mut self.scratch[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(StreamError::device(format!(
                        "reading {}: {e}",
                        self.path.display()
                    )))
                }
            }
        }

        // A trailing partial frame is dropped.
        let frame_bytes = self.channels as usize * SAMPLE_BYTES;
        let whole = filled - filled % frame_bytes;
        Ok(read_samples(&self.scratch[..whole], frame))
    }
}

pub struct RawPcmSink {
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    writer: Option<BufWriter<File>>,
    scratch: Vec<u8>,
}

impl RawPcmSink {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32, channels: u16) -> Self {
        RawPcmSink {
            path: path.into(),
            sample_rate,
            channels,
            writer: None,
            scratch: Vec::new(),
        }
    }
}

impl SampleSink for RawPcmSink {
    fn prepare(&mut self) -> Result<()> {
        let file = File::create(&self.path).map_err(|e| {
            StreamError::device(format!("cannot create {}: {e}", self.path.display()))
        })?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn write(&mut self, frame: &[f32]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(StreamError::device("sink written before prepare"));
        };
        self.scratch.resize(frame.len() * SAMPLE_BYTES, 0);
        write_samples(&mut self.scratch, frame);
        writer
            .write_all(&self.scratch)
            .map_err(|e| StreamError::device(format!("writing {}: {e}", self.path.display())))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| {
                StreamError::device(format!("flushing {}: {e}", self.path.display()))
            })?;
        }
        Ok(())
    }
}

// ─── In-Memory Sinks ────────────────────────────────────────────────────────

/// Discards everything.
#[derive(Debug, Clone)]
pub struct NullSink {
    sample_rate: u32,
    channels: u16,
}

impl NullSink {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        NullSink {
            sample_rate,
            channels,
        }
    }
}

impl SampleSink for NullSink {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn write(&mut self, _frame: &[f32]) -> Result<()> {
        Ok(())
    }
}

/// Appends everything played to a shared vector.
#[derive(Debug, Clone)]
pub struct VecSink {
    sample_rate: u32,
    channels: u16,
    samples: Arc<Mutex<Vec<f32>>>,
}

impl VecSink {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        VecSink {
            sample_rate,
            channels,
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle that stays valid after the sink moves into a bridge.
    pub fn samples(&self) -> Arc<Mutex<Vec<f32>>> {
        self.samples.clone()
    }
}

impl SampleSink for VecSink {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn write(&mut self, frame: &[f32]) -> Result<()> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(frame);
        Ok(())
    }
}
