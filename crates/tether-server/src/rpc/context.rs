//! Per-call ambient context.
//!
//! Each dispatched call runs inside a task-local [`RequestContext`] scope, so
//! handlers can reach the principal, request metadata, outgoing headers,
//! session store and cancellation signal without threading them through
//! every signature. Streams returned by handlers are wrapped in
//! [`ScopedStream`], which re-enters the scope on every poll.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, request};
use futures::Stream;
use parking_lot::Mutex;
use tether_core::{Principal, RpcError};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::session::SessionProvider;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// The parts of the inbound request handlers may inspect.
#[derive(Clone, Debug)]
pub struct RequestParts {
    /// HTTP method.
    pub method: Method,
    /// Full request URI.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

impl From<&request::Parts> for RequestParts {
    fn from(parts: &request::Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
        }
    }
}

struct Shared {
    call_id: String,
    cancel: CancellationToken,
    request: RequestParts,
    outgoing: Mutex<HeaderMap>,
    sessions: Arc<dyn SessionProvider>,
}

/// Ambient state of one call. Cheap to clone.
#[derive(Clone)]
pub struct RequestContext {
    shared: Arc<Shared>,
    principal: Option<Arc<Principal>>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("call_id", &self.shared.call_id)
            .field("principal", &self.principal.as_ref().map(|p| p.id.as_str()))
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Fresh context for an inbound request.
    pub fn new(
        request: RequestParts,
        principal: Option<Principal>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                call_id: uuid::Uuid::now_v7().to_string(),
                cancel: CancellationToken::new(),
                request,
                outgoing: Mutex::new(HeaderMap::new()),
                sessions,
            }),
            principal: principal.map(Arc::new),
        }
    }

    /// Derived context with a different principal.
    ///
    /// Shares cancellation, request metadata and outgoing headers with `self`.
    #[must_use]
    pub fn with_principal(&self, principal: Option<Principal>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            principal: principal.map(Arc::new),
        }
    }

    /// Unique id of this call, used in logs.
    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    /// Caller identity; `None` for anonymous calls.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_deref()
    }

    /// Inbound request metadata.
    pub fn request(&self) -> &RequestParts {
        &self.shared.request
    }

    /// Session store for this server.
    pub fn sessions(&self) -> &Arc<dyn SessionProvider> {
        &self.shared.sessions
    }

    /// Cancellation signal, fired on client disconnect or explicit cancel.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Guard that cancels this call when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.shared.cancel.clone().drop_guard()
    }

    /// Whether the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the call is cancelled.
    pub fn ensure_active(&self) -> Result<(), RpcError> {
        if self.is_cancelled() {
            Err(RpcError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the call is cancelled.
    pub async fn cancelled(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Replace an outgoing response header.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        let _ = self.shared.outgoing.lock().insert(name, value);
    }

    /// Append an outgoing response header (e.g. a second `Set-Cookie`).
    pub fn append_header(&self, name: HeaderName, value: HeaderValue) {
        let _ = self.shared.outgoing.lock().append(name, value);
    }

    /// Drain outgoing headers for the response.
    pub fn take_outgoing_headers(&self) -> HeaderMap {
        std::mem::take(&mut *self.shared.outgoing.lock())
    }

    /// Run `fut` with this context installed.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Spawn `fut` on the runtime with this context installed.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(CURRENT.scope(self.clone(), fut))
    }
}

/// Context of the call being served by this task, if any.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Like [`current`], but an internal error outside a call.
pub fn require() -> Result<RequestContext, RpcError> {
    current().ok_or_else(|| RpcError::internal("no request context in scope"))
}

/// Principal of the current call.
pub fn current_principal() -> Option<Principal> {
    CURRENT
        .try_with(|ctx| ctx.principal().cloned())
        .ok()
        .flatten()
}

/// Run `fut` as `principal` within the current call.
///
/// Outside a call this just runs `fut`.
pub async fn as_principal<F: Future>(principal: Option<Principal>, fut: F) -> F::Output {
    match current() {
        Some(ctx) => ctx.with_principal(principal).scope(fut).await,
        None => fut.await,
    }
}

/// A stream polled inside a call's context.
///
/// Ends as soon as the call is cancelled, dropping the inner stream so the
/// producer can release resources. An optional [`DropGuard`] ties the call's
/// cancellation to the lifetime of this wrapper.
pub struct ScopedStream<S> {
    ctx: RequestContext,
    inner: Option<S>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    guard: Option<DropGuard>,
}

impl<S> ScopedStream<S>
where
    S: Stream + Unpin,
{
    /// Wrap `inner` in `ctx`.
    pub fn new(ctx: RequestContext, inner: S) -> Self {
        let cancelled = Box::pin(ctx.cancellation().clone().cancelled_owned());
        Self {
            ctx,
            inner: Some(inner),
            cancelled,
            guard: None,
        }
    }

    /// Cancel the call when this stream is dropped.
    #[must_use]
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self.guard = Some(guard);
        self
    }
}

impl<S> Stream for ScopedStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            debug!(call_id = %this.ctx.call_id(), "stream cancelled, releasing producer");
            this.inner = None;
            return Poll::Ready(None);
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        let polled = CURRENT.sync_scope(this.ctx.clone(), || Pin::new(inner).poll_next(cx));
        if matches!(polled, Poll::Ready(None)) {
            this.inner = None;
        }
        polled
    }
}
