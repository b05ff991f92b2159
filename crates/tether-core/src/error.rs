use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the tether connection layer.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("negotiation failed: {0}")]
    Negotiate(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no supported transport: {0}")]
    NoTransport(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport unsupported: {0}")]
    Unsupported(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("{0}")]
    StartFailed(Arc<TetherError>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Whether this error represents cancellation rather than a genuine fault.
    pub fn is_canceled(&self) -> bool {
        matches!(self, TetherError::Canceled(_))
    }
}

// `io::Error` is not `Clone`; duplicate it by kind and message.
impl Clone for TetherError {
    fn clone(&self) -> Self {
        match self {
            Self::Negotiate(s) => Self::Negotiate(s.clone()),
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::NoTransport(s) => Self::NoTransport(s.clone()),
            Self::Transport(s) => Self::Transport(s.clone()),
            Self::Unsupported(s) => Self::Unsupported(s.clone()),
            Self::Http(s) => Self::Http(s.clone()),
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::Canceled(s) => Self::Canceled(s.clone()),
            Self::Channel(s) => Self::Channel(s.clone()),
            Self::StartFailed(cause) => Self::StartFailed(cause.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
