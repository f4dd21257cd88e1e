//! Error taxonomy shared by every stage of the pipeline.
//!
//! Per-packet and per-block errors are absorbed by the pipeline and only
//! counted; callers see them when they drive the lower-level pieces
//! directly.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Buffer pool exhausted. Recoverable by backing off or by sizing the
    /// pool larger at configuration time.
    #[error("buffer pool exhausted ({capacity} buffers in use)")]
    OutOfBuffers { capacity: usize },

    /// Fewer than N packets of a block arrived.
    #[error("block {block_id} unrecoverable: {received} of {required} packets")]
    BlockUnrecoverable {
        block_id: u32,
        received: usize,
        required: usize,
    },

    /// A sample source or sink failed. Ends the bridge loop that owns it.
    #[error("device failure: {0}")]
    DeviceFailure(String),

    /// Wire bytes failed structural validation. The packet is dropped.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the stream can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::DeviceFailure(_) | TransportError::Config(_))
    }
}
