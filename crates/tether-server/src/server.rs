//! `TetherServer`: the Axum router and its lifecycle.
//!
//! Fixed endpoints live at the root (`/login`, `/guest`, `/publish`,
//! `/subscribe`, `/health`, `/metrics`); everything under the configured
//! prefix goes to the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::de::DeserializeOwned;
use tether_core::protocol::{
    GUEST_PATH, LOGIN_PATH, LoginRequest, PUBLISH_PATH, PublishRequest, SUBSCRIBE_PATH,
    TOKEN_QUERY_PARAM,
};
use tether_core::{Principal, RpcError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, TokenAuthority, bearer_token};
use crate::config::{ServerConfig, SessionMode};
use crate::health::{self, HealthInputs, HealthResponse};
use crate::hub::{Hub, HubConfig};
use crate::rpc::handler::handle_call;
use crate::rpc::materialize::error_response;
use crate::rpc::Dispatcher;
use crate::session::{CookieSessionProvider, MemorySessionProvider, SessionProvider};
use crate::shutdown::ShutdownCoordinator;
use crate::users::{InMemoryUserProvider, UserProvider};

/// How often expired guests and idle sessions are swept.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration.
    pub config: Arc<ServerConfig>,
    /// Registered modules.
    pub dispatcher: Arc<Dispatcher>,
    /// Token verification and role checks.
    pub auth: Arc<AuthGate>,
    /// Session storage.
    pub sessions: Arc<dyn SessionProvider>,
    /// Push hub.
    pub hub: Arc<Hub>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The tether HTTP server.
pub struct TetherServer {
    state: AppState,
}

impl TetherServer {
    /// Server with an empty in-memory user table. Guests expire with their
    /// token.
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        let users = InMemoryUserProvider::new().with_created_ttl(config.token_ttl());
        Self::with_users(config, dispatcher, Arc::new(users))
    }

    /// Server backed by `users`.
    pub fn with_users(
        config: ServerConfig,
        dispatcher: Dispatcher,
        users: Arc<dyn UserProvider>,
    ) -> Self {
        let secret = match &config.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("no JWT secret configured, generated one; tokens will not survive a restart");
                rand::random::<[u8; 32]>().to_vec()
            }
        };

        let tokens = Arc::new(TokenAuthority::new(&secret, config.token_ttl()));
        let sessions: Arc<dyn SessionProvider> = match config.session_mode {
            SessionMode::Memory => Arc::new(
                MemorySessionProvider::new(config.session_cookie_name.clone())
                    .with_ttl(config.session_ttl()),
            ),
            SessionMode::Cookie => Arc::new(CookieSessionProvider::new(
                config.session_cookie_name.clone(),
                &secret,
            )),
        };
        let hub = Arc::new(Hub::new(
            HubConfig {
                keep_alive: config.keep_alive_interval(),
                buffer: config.subscription_buffer,
            },
            dispatcher.hooks(),
        ));

        Self {
            state: AppState {
                config: Arc::new(config),
                dispatcher: Arc::new(dispatcher),
                auth: Arc::new(AuthGate::new(tokens, users)),
                sessions,
                hub,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Replace the session store.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.state.sessions = sessions;
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let prefix = self.state.config.normalized_prefix();
        let max_body = self.state.config.max_body_bytes;

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(LOGIN_PATH, post(login_handler))
            .route(GUEST_PATH, post(guest_handler))
            .route(PUBLISH_PATH, post(publish_handler))
            .route(SUBSCRIBE_PATH, get(subscribe_handler))
            .route(&format!("{prefix}/{{*path}}"), any(rpc_handler))
            .with_state(self.state.clone())
            .layer(DefaultBodyLimit::max(max_body))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Push hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.state.hub
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Auth gate (token authority and user provider).
    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.state.auth
    }

    /// Serve on `listener` until shutdown is requested.
    ///
    /// Shutdown closes every hub subscription so long-lived SSE responses do
    /// not hold the graceful drain open, then waits for the eviction sweep
    /// and the hub's background tasks.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let router = self.router();
        let hub = Arc::clone(&self.state.hub);
        let shutdown = Arc::clone(&self.state.shutdown);
        let addr = listener.local_addr()?;
        info!(
            %addr,
            prefix = %self.state.config.normalized_prefix(),
            modules = self.state.dispatcher.module_count(),
            operations = self.state.dispatcher.operation_count(),
            "tether server listening"
        );

        let sweeper = tokio::spawn(evict_expired_periodically(
            Arc::clone(&self.state.auth),
            Arc::clone(&self.state.sessions),
            EVICTION_INTERVAL,
            shutdown.token(),
        ));

        let closing = Arc::clone(&shutdown);
        let closing_hub = Arc::clone(&hub);
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                closing.wait().await;
                closing_hub.close_all();
            })
            .await;

        let mut tasks = hub.take_tasks();
        tasks.push(sweeper);
        shutdown.drain(tasks, None).await;
        served?;
        info!("tether server stopped");
        Ok(())
    }

    /// Bind the configured address and serve in the background.
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::clone(&self.state.shutdown);
        let task = tokio::spawn(self.serve(listener));
        Ok(ServerHandle {
            addr,
            shutdown,
            task,
        })
    }
}

/// Handle to a server started with [`TetherServer::start`].
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://host:port`.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Request shutdown and wait for the server task.
    pub async fn stop(self) -> std::io::Result<()> {
        self.shutdown.shutdown();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

/// Sweep expired guests and idle sessions every `interval` until `cancel`
/// fires.
async fn evict_expired_periodically(
    auth: Arc<AuthGate>,
    sessions: Arc<dyn SessionProvider>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let users = auth.users().evict_expired().await;
                let sessions = sessions.evict_expired().await;
                if users + sessions > 0 {
                    debug!(users, sessions, "eviction sweep");
                }
            }
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<T, RpcError> {
    serde_json::from_slice(body).map_err(|e| RpcError::bad_request(format!("Invalid {what} body: {e}")))
}

fn respond<T: serde::Serialize>(result: Result<T, RpcError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn require_principal(state: &AppState, token: Option<&str>) -> Result<Principal, RpcError> {
    state
        .auth
        .principal_for(token)
        .await
        .ok_or(RpcError::Unauthorized)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(HealthInputs {
        start_time: state.start_time,
        subscriptions: state.hub.subscription_count(),
        modules: state.dispatcher.module_count(),
        operations: state.dispatcher.operation_count(),
        shutting_down: state.shutdown.is_shutting_down(),
    }))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// POST /login
async fn login_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let result = async {
        let request: LoginRequest = parse_body(&body, "login")?;
        state.auth.login(&request).await
    };
    respond(result.await)
}

/// POST /guest
async fn guest_handler(State(state): State<AppState>) -> Response {
    respond(state.auth.register_guest().await)
}

/// POST /publish
async fn publish_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        let sender = require_principal(&state, bearer_token(&headers)).await?;
        let request: PublishRequest = parse_body(&body, "publish")?;
        state.hub.publish(&sender.id, request)
    };
    respond(result.await)
}

/// GET /subscribe
async fn subscribe_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let token = bearer_token(&headers).or_else(|| query.get(TOKEN_QUERY_PARAM).map(String::as_str));
    let principal = match require_principal(&state, token).await {
        Ok(principal) => principal,
        Err(err) => return error_response(&err),
    };
    Sse::new(state.hub.connect(&principal.id).await).into_response()
}

/// Everything under the dispatcher prefix.
async fn rpc_handler(State(state): State<AppState>, request: Request) -> Response {
    handle_call(&state, request).await
}
