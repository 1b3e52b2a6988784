//! RPC error taxonomy.
//!
//! Every failure a call can produce maps to one [`RpcError`] variant and one
//! HTTP status. Application-level 4xx errors (bad arguments, explicit
//! business statuses) travel as JSON `{"error": ...}`; transport-level
//! 401/403/404/500 travel as plain text.

use crate::codec::CodecError;

/// Machine-readable codes, used as metric labels and in logs.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
/// Authenticated but lacking a required role.
pub const FORBIDDEN: &str = "FORBIDDEN";
/// No matching module or operation.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Malformed or mistyped arguments.
pub const BAD_REQUEST: &str = "BAD_REQUEST";
/// Business error with an explicit status.
pub const STATUS: &str = "STATUS";
/// Unhandled failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Failure after a stream started.
pub const STREAM_ERROR: &str = "STREAM_ERROR";
/// Call aborted by either side.
pub const CANCELLED: &str = "CANCELLED";

/// Status used for cancelled calls (client closed request).
pub const CANCELLED_STATUS: u16 = 499;

/// Error type returned by operations and the dispatch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Token missing or invalid where roles are required.
    #[error("Unauthorized")]
    Unauthorized,

    /// Token valid but no role overlap.
    #[error("Forbidden")]
    Forbidden,

    /// No matching module, prefix or operation.
    #[error("{message}")]
    NotFound {
        /// Diagnostic text.
        message: String,
    },

    /// Malformed, missing or mistyped arguments.
    #[error("{message}")]
    BadRequest {
        /// Description of what is wrong.
        message: String,
    },

    /// Business error carrying its own status; surfaced verbatim.
    #[error("{message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Human-readable message.
        message: String,
    },

    /// Unhandled failure; details are logged, never sent.
    #[error("{message}")]
    Internal {
        /// Description (server-side only).
        message: String,
    },

    /// Failure raised mid-stream.
    #[error("{message}")]
    Stream {
        /// Description.
        message: String,
    },

    /// The call was aborted.
    #[error("Request cancelled")]
    Cancelled,
}

impl RpcError {
    /// Shorthand for [`RpcError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Stream`].
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Business error with an explicit HTTP status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Machine-readable code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => UNAUTHORIZED,
            Self::Forbidden => FORBIDDEN,
            Self::NotFound { .. } => NOT_FOUND,
            Self::BadRequest { .. } => BAD_REQUEST,
            Self::Status { .. } => STATUS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Stream { .. } => STREAM_ERROR,
            Self::Cancelled => CANCELLED,
        }
    }

    /// HTTP status for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound { .. } => 404,
            Self::BadRequest { .. } => 400,
            Self::Status { status, .. } => *status,
            Self::Internal { .. } | Self::Stream { .. } => 500,
            Self::Cancelled => CANCELLED_STATUS,
        }
    }

    /// Whether the error is sent as a JSON `{"error"}` body.
    pub fn is_application_error(&self) -> bool {
        match self {
            Self::BadRequest { .. } => true,
            Self::Status { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Message safe to send to the client.
    ///
    /// Internal errors collapse to a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal { .. } => "Internal error".to_owned(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Join(message) => Self::Internal { message },
            other => Self::bad_request(other.to_string()),
        }
    }
}
