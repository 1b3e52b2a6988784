//! HTTP entry point of the dispatcher: one request, one call.

use axum::body::to_bytes;
use axum::extract::Request;
use axum::response::Response;
use metrics::counter;
use tether_core::{RpcError, Verb};
use tracing::debug;

use super::args;
use super::context::{RequestContext, RequestParts};
use super::materialize::{error_response, materialize, with_headers};
use crate::auth::bearer_token;
use crate::metrics::RPC_REJECTED_TOTAL;
use crate::server::AppState;

fn reject(reason: &'static str, err: &RpcError) -> Response {
    counter!(RPC_REJECTED_TOTAL, "reason" => reason).increment(1);
    debug!(reason, code = err.code(), error = %err, "call rejected");
    error_response(err)
}

/// Resolve, authorize, decode arguments, invoke and materialize.
pub async fn handle_call(state: &AppState, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(verb) = Verb::parse(parts.method.as_str()) else {
        let err = RpcError::status(405, format!("Method {} not allowed", parts.method));
        return reject("method", &err);
    };

    let prefix = state.config.normalized_prefix();
    let Some(path) = parts.uri.path().strip_prefix(prefix.as_str()) else {
        let err = RpcError::not_found(format!(
            "Path '{}' is outside prefix '{prefix}'",
            parts.uri.path()
        ));
        return reject("prefix", &err);
    };

    let resolved = match state.dispatcher.resolve(verb, path) {
        Ok(resolved) => resolved,
        Err(err) => return reject("route", &err),
    };

    let required = &resolved.operation.descriptor().roles;
    let principal = match state.auth.authorize(bearer_token(&parts.headers), required).await {
        Ok(principal) => principal,
        Err(err) => return reject("auth", &err),
    };

    let body = match to_bytes(body, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            let err = RpcError::status(413, format!("Failed to read request body: {e}"));
            return reject("body", &err);
        }
    };
    let args = match args::collect(&resolved.path_args, &body) {
        Ok(args) => args,
        Err(err) => return reject("args", &err),
    };

    let ctx = RequestContext::new(RequestParts::from(&parts), principal, state.sessions.clone());
    let guard = ctx.drop_guard();
    match state.dispatcher.invoke(&resolved, args, ctx.clone()).await {
        Ok(reply) => materialize(reply, &ctx, guard).await,
        Err(err) => with_headers(error_response(&err), ctx.take_outgoing_headers()),
    }
}
