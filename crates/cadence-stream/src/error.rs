use cadence_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer end of a link went away.
    #[error("link closed")]
    Closed,

    #[error("{thread} thread panicked")]
    Panicked { thread: String },
}

impl StreamError {
    /// A source or sink failure.
    pub fn device(msg: impl Into<String>) -> Self {
        StreamError::Transport(TransportError::DeviceFailure(msg.into()))
    }

    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(TransportError::DeviceFailure(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_helper_wraps_transport_error() {
        let err = StreamError::device("no such file");
        assert!(err.is_device_failure());
        assert_eq!(err.to_string(), "device failure: no such file");
        assert!(!StreamError::Closed.is_device_failure());
    }
}
