//! Error types for the client session

use std::time::Duration;

use stagelink_codec::DecodeError;

use crate::types::ErrorInfo;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connect refused, reset, broken pipe, ...
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The host closed the connection, or no connection could be held open.
    #[error("connection closed")]
    Disconnected,

    /// No correlated reply before the deadline.
    #[error("no reply to `{command}` within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The host answered with a failure. Never retried.
    #[error("host rejected `{command}`: {error}")]
    Remote { command: String, error: ErrorInfo },

    /// The host sent bytes that do not decode.
    #[error("bad reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("a stream carries at most {0} axes")]
    TooManyAxes(usize),
}

impl ClientError {
    /// Transport and timeout failures are recovered by reconnect-and-retry;
    /// everything else goes straight back to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Disconnected
                | ClientError::Timeout { .. }
                | ClientError::Decode(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Disconnected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Host-side failure payload, if this is one.
    pub fn remote(&self) -> Option<&ErrorInfo> {
        match self {
            ClientError::Remote { error, .. } => Some(error),
            _ => None,
        }
    }
}
