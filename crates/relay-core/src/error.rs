use thiserror::Error;

/// Errors produced by the relay.
///
/// Every variant is scoped to one connection, tunnel or flow; none of them is
/// ever reported back to the peer that caused it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("resolution failed: {0}")]
    Resolve(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// True for errors that are part of a normal teardown (peer went away,
    /// deadline expired) rather than something worth surfacing loudly.
    pub fn is_teardown(&self) -> bool {
        match self {
            RelayError::Timeout => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
