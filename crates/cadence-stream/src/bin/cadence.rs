//! # cadence
//!
//! Streams audio over UDP with block FEC and a jitter buffer.
//!
//! ## Usage
//!
//! ```bash
//! # Send a 440 Hz tone
//! cadence send --peer 192.168.1.20:7000 --tone 440
//!
//! # Send raw interleaved f32le audio
//! cadence send --peer 192.168.1.20:7000 --input music.f32
//!
//! # Receive and write what is played
//! cadence recv --bind 0.0.0.0:7000 --output received.f32
//!
//! # Both ends in one process over an impaired in-memory link
//! cadence loopback --duration 10 --loss 0.05 --reorder 0.02
//! ```
//!
//! Stream parameters come from `--config stream.toml` (defaults otherwise).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_stream::bridge::{BridgeExit, BridgeStats, SampleSink};
use cadence_stream::device::{NullSink, RawPcmSink, RawPcmSource, ToneSource};
use cadence_stream::link::{Impairment, MemoryLink, UdpLink};
use cadence_stream::pipeline::{LogRateControl, ReceiverSession, SenderSession};
use cadence_transport::config::StreamConfig;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cadence", about = "Real-time audio streaming with block FEC")]
struct Cli {
    /// Stream configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seconds between stats reports.
    #[arg(long, global = true, default_value_t = 5)]
    stats_interval: u64,

    /// Print stats reports to stdout as JSON lines instead of logging them.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture and send.
    Send {
        /// Receiver address.
        #[arg(long)]
        peer: SocketAddr,

        /// Local address to send from.
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        #[command(flatten)]
        input: InputArgs,
    },
    /// Receive and play.
    Recv {
        #[arg(long, default_value = "0.0.0.0:7000")]
        bind: SocketAddr,

        /// Raw f32le output file; discarded when absent.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Sender and receiver in one process over an in-memory link.
    Loopback {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long)]
        output: Option<PathBuf>,

        /// Datagram loss probability.
        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        #[arg(long, default_value_t = 0.0)]
        duplicate: f64,

        #[arg(long, default_value_t = 0.0)]
        reorder: f64,

        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Raw f32le input file.
    #[arg(long, conflicts_with = "tone")]
    input: Option<PathBuf>,

    /// Test tone frequency in Hz.
    #[arg(long, default_value_t = 440.0)]
    tone: f64,

    /// Stop the tone after this many seconds.
    #[arg(long)]
    duration: Option<f64>,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let reporting = Reporting {
        interval: Duration::from_secs(cli.stats_interval.max(1)),
        json: cli.json,
    };

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    match cli.command {
        Command::Send { peer, bind, input } => {
            let link = UdpLink::connect(bind, peer)?;
            tracing::info!(%peer, local = %link.local_addr()?, "sending");
            let session = start_sender(&config, &input, link)?;
            run_sender(session, &running, reporting)
        }
        Command::Recv { bind, output } => {
            let link = UdpLink::bind(bind)?;
            tracing::info!(local = %link.local_addr()?, "receiving");
            let session = start_receiver(&config, link, output.as_deref())?;
            run_receiver(session, &running, reporting)
        }
        Command::Loopback {
            input,
            output,
            loss,
            duplicate,
            reorder,
            seed,
        } => {
            let impairment = Impairment {
                loss,
                duplicate,
                reorder,
                seed,
            };
            let (tx, rx) = MemoryLink::pair(config.pool_capacity, impairment);
            let link_stats = tx.stats_handle();
            let receiver = start_receiver(&config, rx, output.as_deref())?;
            let sender = start_sender(&config, &input, tx)?;

            let sender_exit = run_sender(sender, &running, reporting);
            // The sender dropping its link lets the receiver drain and end.
            let receiver_exit = run_receiver(receiver, &running, reporting);
            tracing::info!(link = ?link_stats.snapshot(), "link stats");
            sender_exit.and(receiver_exit)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StreamConfig> {
    let Some(path) = path else {
        return Ok(StreamConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = StreamConfig::from_toml_str(&text)?;
    config.validate()?;
    Ok(config)
}

fn start_sender<L>(
    config: &StreamConfig,
    input: &InputArgs,
    link: L,
) -> anyhow::Result<SenderSession>
where
    L: cadence_stream::link::DatagramSink,
{
    let session = match &input.input {
        Some(path) => {
            let source = RawPcmSource::new(path, config.sample_rate, config.channels());
            SenderSession::start(config.clone(), source, link)?
        }
        None => {
            let mut tone = ToneSource::new(input.tone, config.sample_rate, config.channels());
            if let Some(seconds) = input.duration {
                tone = tone.with_duration(seconds);
            }
            SenderSession::start(config.clone(), tone, link)?
        }
    };
    Ok(session)
}

fn start_receiver<L>(
    config: &StreamConfig,
    link: L,
    output: Option<&Path>,
) -> anyhow::Result<ReceiverSession>
where
    L: cadence_stream::link::DatagramSource,
{
    fn start<L, K>(config: &StreamConfig, link: L, sink: K) -> anyhow::Result<ReceiverSession>
    where
        L: cadence_stream::link::DatagramSource,
        K: SampleSink,
    {
        Ok(ReceiverSession::start(
            config.clone(),
            link,
            sink,
            LogRateControl,
        )?)
    }

    match output {
        Some(path) => start(
            config,
            link,
            RawPcmSink::new(path, config.sample_rate, config.channels()),
        ),
        None => start(
            config,
            link,
            NullSink::new(config.sample_rate, config.channels()),
        ),
    }
}

#[derive(Debug, Clone, Copy)]
struct Reporting {
    interval: Duration,
    json: bool,
}

#[derive(Serialize)]
struct StatsReport<'a, T: Serialize> {
    role: &'static str,
    stats: &'a T,
    bridge: BridgeStats,
}

fn emit_json<T: Serialize>(role: &'static str, stats: &T, bridge: BridgeStats) {
    let report = StatsReport {
        role,
        stats,
        bridge,
    };
    match serde_json::to_string(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize stats"),
    }
}

fn run_sender(
    session: SenderSession,
    running: &AtomicBool,
    reporting: Reporting,
) -> anyhow::Result<()> {
    let mut last_report = std::time::Instant::now();
    while running.load(Ordering::Relaxed) && !session.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= reporting.interval {
            let stats = session.stats();
            if reporting.json {
                emit_json("sender", &stats, session.capture_stats());
            } else {
                tracing::info!(
                    packets = stats.source_packets,
                    repairs = stats.repair_packets,
                    blocks = stats.blocks_completed,
                    bytes = stats.bytes_sent,
                    pool_exhausted = stats.pool_exhausted,
                    "sender stats"
                );
            }
            last_report = std::time::Instant::now();
        }
    }

    session.stop();
    let stats = session.stats();
    let exit = session.join();
    tracing::info!(
        packets = stats.source_packets,
        repairs = stats.repair_packets,
        ?exit,
        "sender stopped"
    );
    exit_result(exit)
}

fn run_receiver(
    session: ReceiverSession,
    running: &AtomicBool,
    reporting: Reporting,
) -> anyhow::Result<()> {
    let mut last_report = std::time::Instant::now();
    while running.load(Ordering::Relaxed) && !session.is_finished() {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= reporting.interval {
            let stats = session.stats();
            let playback = session.playback_stats();
            if reporting.json {
                emit_json("receiver", &stats, playback);
            } else {
                tracing::info!(
                    datagrams = stats.datagrams,
                    malformed = stats.malformed,
                    recovered = stats.jitter.blocks_recovered,
                    lost = stats.jitter.blocks_lost,
                    late = stats.jitter.late_packets,
                    duplicates = stats.jitter.duplicates,
                    latency_samples = stats.latency_samples as u64,
                    scaling = stats.scaling,
                    underruns = playback.underruns,
                    "receiver stats"
                );
            }
            last_report = std::time::Instant::now();
        }
    }

    session.stop();
    let stats = session.stats();
    let playback = session.playback_stats();
    let exit = session.join();
    tracing::info!(
        datagrams = stats.datagrams,
        blocks_lost = stats.jitter.blocks_lost,
        frames = playback.frames,
        underruns = playback.underruns,
        ?exit,
        "receiver stopped"
    );
    exit_result(exit)
}

fn exit_result(exit: BridgeExit) -> anyhow::Result<()> {
    match exit {
        BridgeExit::Failed(e) => Err(e.into()),
        BridgeExit::Stopped | BridgeExit::EndOfStream => Ok(()),
    }
}
