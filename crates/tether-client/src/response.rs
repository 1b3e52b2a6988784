//! Decoding of call responses by content type.

use std::fmt;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use tether_core::codec;
use tether_core::protocol::{ErrorBody, EVENT_END, EVENT_ERROR, STREAM_KIND_GENERATOR, STREAM_KIND_HEADER};
use tether_core::RichValue;
use tokio_util::sync::CancellationToken;

use crate::cancel::CallGuard;
use crate::errors::{ClientError, Result};

/// Values produced by a remote generator.
pub type ValueStream = BoxStream<'static, Result<RichValue>>;

/// Raw body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A decoded call result.
pub enum Response {
    /// 204, or an empty JSON body.
    Void,
    /// JSON value.
    Value(RichValue),
    /// `text/*` body.
    Text(String),
    /// Any other body, fully read.
    Bytes(Bytes),
    /// Raw event stream, octet stream, audio or video.
    ByteStream(ByteStream),
    /// Generator converted to SSE by the server.
    Generator(ValueStream),
}

impl Response {
    /// Variant name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Value(_) => "value",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::ByteStream(_) => "byte-stream",
            Self::Generator(_) => "generator",
        }
    }

    /// The value, with `Void` as null.
    pub fn into_value(self) -> Result<RichValue> {
        match self {
            Self::Void => Ok(RichValue::Null),
            Self::Value(value) => Ok(value),
            other => Err(ClientError::Decode(format!("expected a value, got {}", other.kind()))),
        }
    }

    /// Deserialize the value into `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        Ok(self.into_value()?.deserialize_into()?)
    }

    /// The generator's value stream.
    pub fn into_generator(self) -> Result<ValueStream> {
        match self {
            Self::Generator(stream) => Ok(stream),
            other => Err(ClientError::Decode(format!("expected a generator, got {}", other.kind()))),
        }
    }

    /// The body as a byte stream; complete bodies become a one-chunk stream.
    pub fn into_byte_stream(self) -> Result<ByteStream> {
        match self {
            Self::ByteStream(stream) => Ok(stream),
            Self::Bytes(data) => Ok(futures::stream::once(async move { Ok(data) }).boxed()),
            other => Err(ClientError::Decode(format!("expected bytes, got {}", other.kind()))),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// How a successful body is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Generator,
    ByteStream,
    Json,
    Text,
    Bytes,
}

pub(crate) fn classify(content_type: &str, stream_kind: Option<&str>) -> BodyKind {
    let content_type = content_type.to_ascii_lowercase();
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if mime == "text/event-stream" {
        return if stream_kind == Some(STREAM_KIND_GENERATOR) {
            BodyKind::Generator
        } else {
            BodyKind::ByteStream
        };
    }
    if mime == "application/octet-stream" || mime.starts_with("audio/") || mime.starts_with("video/") {
        BodyKind::ByteStream
    } else if mime == "application/json" || mime.ends_with("+json") {
        BodyKind::Json
    } else if mime.starts_with("text/") {
        BodyKind::Text
    } else {
        BodyKind::Bytes
    }
}

/// Message of an error response: the `{"error"}` field when present,
/// otherwise the text itself, otherwise the status reason.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.error;
    }
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("Request failed").to_owned()
    } else {
        body.to_owned()
    }
}

pub(crate) async fn status_error(resp: reqwest::Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ClientError::Status {
        status: status.as_u16(),
        message: error_message(status, &body),
    }
}

async fn read_body(resp: reqwest::Response, cancel: &CancellationToken) -> Result<Bytes> {
    tokio::select! {
        () = cancel.cancelled() => Err(ClientError::Cancelled),
        body = resp.bytes() => Ok(body?),
    }
}

/// Decode a response, keeping `guard` alive for as long as a stream is read.
pub(crate) async fn decode(resp: reqwest::Response, guard: CallGuard) -> Result<Response> {
    let status = resp.status();
    if !status.is_success() {
        return Err(status_error(resp).await);
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Response::Void);
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let stream_kind = resp
        .headers()
        .get(STREAM_KIND_HEADER)
        .and_then(|v| v.to_str().ok());

    match classify(content_type, stream_kind) {
        BodyKind::Generator => Ok(Response::Generator(generator(resp, guard))),
        BodyKind::ByteStream => Ok(Response::ByteStream(byte_stream(resp, guard))),
        BodyKind::Json => {
            let body = read_body(resp, guard.token()).await?;
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Response::Void);
            }
            Ok(Response::Value(codec::decode_slice(&body)?))
        }
        BodyKind::Text => {
            let body = read_body(resp, guard.token()).await?;
            Ok(Response::Text(String::from_utf8_lossy(&body).into_owned()))
        }
        BodyKind::Bytes => Ok(Response::Bytes(read_body(resp, guard.token()).await?)),
    }
}

fn generator(resp: reqwest::Response, guard: CallGuard) -> ValueStream {
    let cancel = guard.token().clone();
    let mut events = Box::pin(resp.bytes_stream().eventsource());
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                event = events.next() => Some(event),
            };
            match next {
                None => {
                    yield Err(ClientError::Cancelled);
                    break;
                }
                Some(None) => {
                    yield Err(ClientError::Stream("stream closed before end event".into()));
                    break;
                }
                Some(Some(Err(e))) => {
                    yield Err(ClientError::Stream(e.to_string()));
                    break;
                }
                Some(Some(Ok(event))) if event.event == EVENT_END => break,
                Some(Some(Ok(event))) if event.event == EVENT_ERROR => {
                    let message = serde_json::from_str::<ErrorBody>(&event.data)
                        .map_or(event.data, |body| body.error);
                    yield Err(ClientError::Stream(message));
                    break;
                }
                Some(Some(Ok(event))) => match codec::decode(&event.data) {
                    Ok(value) => {
                        yield Ok(value);
                    }
                    Err(e) => {
                        yield Err(ClientError::from(e));
                        break;
                    }
                },
            }
        }
    };
    stream.boxed()
}

fn byte_stream(resp: reqwest::Response, guard: CallGuard) -> ByteStream {
    let cancel = guard.token().clone();
    let mut chunks = Box::pin(resp.bytes_stream());
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                chunk = chunks.next() => Some(chunk),
            };
            match next {
                None => {
                    yield Err(ClientError::Cancelled);
                    break;
                }
                Some(None) => break,
                Some(Some(Ok(chunk))) => {
                    yield Ok(chunk);
                }
                Some(Some(Err(e))) => {
                    yield Err(ClientError::Transport(e));
                    break;
                }
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stream_with_generator_marker() {
        assert_eq!(classify("text/event-stream", Some("generator")), BodyKind::Generator);
    }

    #[test]
    fn event_stream_without_marker_is_raw() {
        assert_eq!(classify("text/event-stream", None), BodyKind::ByteStream);
        assert_eq!(classify("text/event-stream", Some("raw")), BodyKind::ByteStream);
    }

    #[test]
    fn media_types_stream() {
        assert_eq!(classify("application/octet-stream", None), BodyKind::ByteStream);
        assert_eq!(classify("audio/mpeg", None), BodyKind::ByteStream);
        assert_eq!(classify("video/mp4", None), BodyKind::ByteStream);
    }

    #[test]
    fn json_text_and_other() {
        assert_eq!(classify("application/json; charset=utf-8", None), BodyKind::Json);
        assert_eq!(classify("application/problem+json", None), BodyKind::Json);
        assert_eq!(classify("text/plain; charset=utf-8", None), BodyKind::Text);
        assert_eq!(classify("image/png", None), BodyKind::Bytes);
        assert_eq!(classify("", None), BodyKind::Bytes);
    }

    #[test]
    fn error_message_prefers_json_field() {
        let msg = error_message(StatusCode::BAD_REQUEST, r#"{"error":"Missing argument 0"}"#);
        assert_eq!(msg, "Missing argument 0");
    }

    #[test]
    fn error_message_falls_back_to_text_then_reason() {
        assert_eq!(error_message(StatusCode::FORBIDDEN, "Forbidden"), "Forbidden");
        assert_eq!(error_message(StatusCode::NOT_FOUND, "  "), "Not Found");
    }

    #[test]
    fn void_into_value_is_null() {
        assert!(Response::Void.into_value().unwrap().is_null());
    }

    #[test]
    fn text_is_not_a_value() {
        let err = Response::Text("hi".into()).into_value().unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn complete_bytes_become_a_stream() {
        let stream = Response::Bytes(Bytes::from_static(b"abc")).into_byte_stream().unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().as_ref(), b"abc");
    }
}
