//! Client error type.

use tether_core::CodecError;

/// Failure of a client call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server message (`{"error"}` body or plain text).
        message: String,
    },

    /// Connection, TLS or protocol failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A stream failed after it started.
    #[error("stream error: {0}")]
    Stream(String),

    /// The call was cancelled locally.
    #[error("request cancelled")]
    Cancelled,

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// A call argument that could not be encoded.
    pub fn unencodable_argument(err: &CodecError) -> Self {
        Self::InvalidRequest(format!("argument not encodable: {err}"))
    }

    /// Whether this is a local cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status, for [`ClientError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result alias for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;
