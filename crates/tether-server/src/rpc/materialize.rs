//! Turns a [`Reply`] (or an error) into an HTTP response.
//!
//! | reply        | response                                                   |
//! |--------------|------------------------------------------------------------|
//! | `Empty`      | 204                                                        |
//! | `Bytes`      | 200 `application/octet-stream`, streamed                   |
//! | `Generator`  | 200 SSE, one `data` frame per value, then `event: end`     |
//! | `EventStream`| 200 `text/event-stream`, bytes passed through              |
//! | `Value`      | 200 JSON via the rich codec                                |
//!
//! Headers queued on the call's context are merged into every response.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tether_core::codec;
use tether_core::protocol::{
    CONTENT_TYPE_EVENT_STREAM, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, ErrorBody, EVENT_END,
    EVENT_ERROR, STREAM_KIND_GENERATOR, STREAM_KIND_HEADER, STREAM_KIND_RAW,
};
use tether_core::RpcError;
use tokio_util::sync::DropGuard;
use tracing::{error, warn};

use super::context::{RequestContext, ScopedStream};
use super::reply::{ByteStream, Reply, ValueStream};

/// Build the response for a handler's reply.
///
/// `guard` cancels the call when the response body is dropped, whether it
/// finished or the client went away.
pub async fn materialize(reply: Reply, ctx: &RequestContext, guard: DropGuard) -> Response {
    let response = match reply {
        Reply::Empty => StatusCode::NO_CONTENT.into_response(),
        Reply::Bytes(stream) => byte_response(stream, ctx, guard, CONTENT_TYPE_OCTET_STREAM, None),
        Reply::EventStream(stream) => byte_response(
            stream,
            ctx,
            guard,
            CONTENT_TYPE_EVENT_STREAM,
            Some(STREAM_KIND_RAW),
        ),
        Reply::Generator(stream) => generator_response(stream, ctx, guard),
        Reply::Value(value) => match codec::encode_auto(value).await {
            Ok(json) => json_response(StatusCode::OK, json),
            Err(e) => error_response(&RpcError::from(e)),
        },
    };
    with_headers(response, ctx.take_outgoing_headers())
}

/// Response for a failed call.
///
/// Application errors become JSON `{"error"}`; everything else is plain text,
/// with internal details replaced by a generic message.
pub fn error_response(err: &RpcError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if matches!(err, RpcError::Internal { .. }) {
        error!(code = err.code(), error = %err, "internal error");
    }

    if err.is_application_error() {
        let body = ErrorBody {
            error: err.public_message(),
        };
        match serde_json::to_string(&body) {
            Ok(json) => json_response(status, json),
            Err(_) => (status, err.public_message()).into_response(),
        }
    } else {
        (status, err.public_message()).into_response()
    }
}

/// Merge `extra` headers into `response`, keeping repeated values.
pub fn with_headers(mut response: Response, extra: HeaderMap) -> Response {
    let headers = response.headers_mut();
    let mut last = None;
    for (name, value) in extra {
        if let Some(name) = name {
            last = Some(name);
        }
        if let Some(name) = &last {
            let _ = headers.append(name.clone(), value);
        }
    }
    response
}

fn json_response(status: StatusCode, json: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON))],
        json,
    )
        .into_response()
}

fn byte_response(
    stream: ByteStream,
    ctx: &RequestContext,
    guard: DropGuard,
    content_type: &'static str,
    kind: Option<&'static str>,
) -> Response {
    let body = Body::from_stream(ScopedStream::new(ctx.clone(), stream).with_guard(guard));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(kind) = kind {
        let _ = headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let _ = headers.insert(STREAM_KIND_HEADER, HeaderValue::from_static(kind));
    }
    response
}

fn error_event(err: &RpcError) -> Event {
    let body = ErrorBody {
        error: err.public_message(),
    };
    let data = serde_json::to_string(&body).unwrap_or_else(|_| r#"{"error":"Stream error"}"#.into());
    Event::default().event(EVENT_ERROR).data(data)
}

fn generator_response(stream: ValueStream, ctx: &RequestContext, guard: DropGuard) -> Response {
    let call_id = ctx.call_id().to_owned();
    let mut values = ScopedStream::new(ctx.clone(), stream).with_guard(guard);
    let cancel = ctx.cancellation().clone();

    let frames = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = values.next().await {
            let encoded = match item {
                Ok(value) => codec::encode_auto(value).await.map_err(RpcError::from),
                Err(err) => Err(err),
            };
            match encoded {
                Ok(json) => yield Ok::<_, Infallible>(Event::default().data(json)),
                Err(err) => {
                    warn!(call_id = %call_id, code = err.code(), error = %err, "generator failed mid-stream");
                    failed = true;
                    yield Ok(error_event(&err));
                    break;
                }
            }
        }
        if !failed && !cancel.is_cancelled() {
            yield Ok(Event::default().event(EVENT_END).data("null"));
        }
    };

    let mut response = Sse::new(frames).into_response();
    let _ = response.headers_mut().insert(
        STREAM_KIND_HEADER,
        HeaderValue::from_static(STREAM_KIND_GENERATOR),
    );
    response
}
