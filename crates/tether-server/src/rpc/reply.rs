//! What an operation hands back to the materializer.

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use serde::Serialize;
use tether_core::{RichValue, RpcError};

/// Lazily produced sequence of values, sent as SSE `data` frames.
pub type ValueStream = BoxStream<'static, Result<RichValue, RpcError>>;

/// Stream of raw byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, RpcError>>;

/// Result of a handler.
pub enum Reply {
    /// Nothing to send (204).
    Empty,
    /// A single value, sent as JSON.
    Value(RichValue),
    /// Binary body, streamed as `application/octet-stream`.
    Bytes(ByteStream),
    /// Pre-framed `text/event-stream` body, passed through untouched.
    EventStream(ByteStream),
    /// Values converted to SSE frames with an `end` terminator.
    Generator(ValueStream),
}

impl Reply {
    /// A single value.
    pub fn value(value: impl Into<RichValue>) -> Self {
        Self::Value(value.into())
    }

    /// Any serializable value.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, RpcError> {
        RichValue::from_serialize(value)
            .map(Self::Value)
            .map_err(|e| RpcError::internal(format!("reply not serializable: {e}")))
    }

    /// A complete binary body.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::Bytes(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    /// A streamed binary body.
    pub fn byte_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, RpcError>> + Send + 'static,
    {
        Self::Bytes(Box::pin(stream))
    }

    /// A pre-framed event stream.
    pub fn event_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, RpcError>> + Send + 'static,
    {
        Self::EventStream(Box::pin(stream))
    }

    /// A generator of values.
    pub fn generator<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<RichValue, RpcError>> + Send + 'static,
    {
        Self::Generator(Box::pin(stream))
    }

    /// Variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Value(_) => "value",
            Self::Bytes(_) => "bytes",
            Self::EventStream(_) => "event_stream",
            Self::Generator(_) => "generator",
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

impl From<RichValue> for Reply {
    fn from(value: RichValue) -> Self {
        Self::Value(value)
    }
}

impl From<()> for Reply {
    fn from((): ()) -> Self {
        Self::Empty
    }
}
