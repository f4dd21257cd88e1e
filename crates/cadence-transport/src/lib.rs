//! # cadence-transport
//!
//! Real-time audio transport core.
//!
//! Pooled zero-copy sample buffers, a fixed-width packet wire format,
//! systematic block FEC over GF(2^8), a per-block jitter buffer and
//! drift tracking. Pure logic: no threads, no sockets. The runtime glue
//! lives in `cadence-stream`.
//!
//! ## Crate structure
//!
//! - [`pool`] — Fixed-capacity buffer pool and sequence counters
//! - [`wire`] — Packet type and header serialization
//! - [`codec`] — Block FEC encoding/decoding (Cauchy Reed-Solomon / XOR)
//! - [`jitter`] — Block-ordered jitter buffer with deadline resolution
//! - [`timing`] — Latency tracking, drift controller, rate estimation
//! - [`sample`] — f32 frame ↔ payload byte conversion
//! - [`sender`] — Sender pipeline (samples → packets → repairs)
//! - [`receiver`] — Receiver pipeline (datagrams → jitter → samples)
//! - [`config`] — TOML stream configuration
//! - [`stats`] — Counters and smoothing
//! - [`error`] — Error taxonomy

pub mod codec;
pub mod config;
pub mod error;
pub mod jitter;
pub mod pool;
pub mod receiver;
pub mod sample;
pub mod sender;
pub mod stats;
pub mod timing;
pub mod wire;

pub use error::{Result, TransportError};
