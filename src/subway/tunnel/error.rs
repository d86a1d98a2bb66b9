use std::fmt;

use thiserror::Error;

use super::frame::{FrameError, ResetReason};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("session is not accepting streams")]
    SessionUnavailable,
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => TunnelError::Transport(e),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

impl TunnelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TunnelError::Protocol(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream was reset: {0}")]
    Reset(ResetReason),
    #[error("stream write half is closed")]
    WriteClosed,
    #[error("write of {requested} bytes exceeds send window of {available}")]
    WindowExceeded { requested: usize, available: u64 },
    #[error("session closed")]
    SessionClosed,
}

/// Why a session ended. Recorded once, on the first close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Transport(String),
    Protocol(String),
    IdleTimeout,
    Drained,
    Shutdown,
}

impl CloseReason {
    pub fn kind(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Transport(_) => "transport",
            CloseReason::Protocol(_) => "protocol",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Drained => "drained",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Transport(msg) => write!(f, "transport: {msg}"),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            other => f.write_str(other.kind()),
        }
    }
}

impl From<&TunnelError> for CloseReason {
    fn from(err: &TunnelError) -> Self {
        match err {
            TunnelError::Transport(e) => CloseReason::Transport(e.to_string()),
            other => CloseReason::Protocol(other.to_string()),
        }
    }
}
