//! # cadence-stream
//!
//! Runtime glue around `cadence-transport`: the threads that move audio.
//!
//! - [`bridge`] — Real-time I/O bridge threads (capture and playback)
//! - [`device`] — Sample sources and sinks: tone generator, raw PCM files
//! - [`link`] — Datagram links: UDP and an impaired in-memory pair
//! - [`pipeline`] — Sender and receiver sessions wiring it all together
//! - [`error`] — Runtime errors

pub mod bridge;
pub mod device;
pub mod error;
pub mod link;
pub mod pipeline;

pub use error::{Result, StreamError};
