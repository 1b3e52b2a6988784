//! Per-user session storage behind a cookie.
//!
//! Two providers ship with the server: [`MemorySessionProvider`] keeps data in
//! process memory keyed by a session-id cookie, [`CookieSessionProvider`]
//! signs the whole session into the cookie. Handlers use the free functions
//! [`load`], [`save`] and [`destroy`], which act on the current call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, header};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::RpcError;
use tokio::time::Instant;
use tracing::debug;

use crate::rpc::context::{self, RequestContext};

/// Session data for one browser/client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    id: String,
    values: Map<String, Value>,
    is_new: bool,
}

impl Session {
    fn fresh() -> Self {
        Self {
            id: uuid::Uuid::now_v7().simple().to_string(),
            values: Map::new(),
            is_new: true,
        }
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this session did not exist before this call.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Typed read; `None` when absent or of a different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    /// Store a value.
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), RpcError> {
        let value = serde_json::to_value(value)
            .map_err(|e| RpcError::internal(format!("session value not serializable: {e}")))?;
        let _ = self.values.insert(key.into(), value);
        Ok(())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Pluggable session storage.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Load the session for the call, or start a fresh one.
    async fn load(&self, ctx: &RequestContext) -> Result<Session, RpcError>;

    /// Persist `session` and emit the cookie on the response.
    async fn save(&self, ctx: &RequestContext, session: Session) -> Result<(), RpcError>;

    /// Forget the session and expire the cookie.
    async fn destroy(&self, ctx: &RequestContext) -> Result<(), RpcError>;

    /// Drop server-held sessions that have gone idle. Returns how many.
    async fn evict_expired(&self) -> usize {
        0
    }
}

/// Idle time after which a server-held session is forgotten.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Load the current call's session.
pub async fn load() -> Result<Session, RpcError> {
    let ctx = context::require()?;
    ctx.sessions().load(&ctx).await
}

/// Save the current call's session.
pub async fn save(session: Session) -> Result<(), RpcError> {
    let ctx = context::require()?;
    ctx.sessions().save(&ctx, session).await
}

/// Destroy the current call's session.
pub async fn destroy() -> Result<(), RpcError> {
    let ctx = context::require()?;
    ctx.sessions().destroy(&ctx).await
}

/// Value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_owned())
}

fn set_cookie(ctx: &RequestContext, name: &str, value: &str, max_age: Option<u64>) -> Result<(), RpcError> {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax");
    if let Some(age) = max_age {
        cookie.push_str(&format!("; Max-Age={age}"));
    }
    let value = HeaderValue::from_str(&cookie)
        .map_err(|e| RpcError::internal(format!("invalid cookie header: {e}")))?;
    ctx.append_header(header::SET_COOKIE, value);
    Ok(())
}

struct StoredSession {
    values: Map<String, Value>,
    last_saved: Instant,
}

/// Session data in server memory, addressed by an opaque id cookie.
///
/// A session not saved for longer than the TTL is treated as gone.
pub struct MemorySessionProvider {
    cookie_name: String,
    ttl: Duration,
    store: RwLock<HashMap<String, StoredSession>>,
}

impl MemorySessionProvider {
    /// Provider using cookie `cookie_name`.
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            ttl: DEFAULT_SESSION_TTL,
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Idle lifetime of a stored session.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Stored session count.
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

#[async_trait]
impl SessionProvider for MemorySessionProvider {
    async fn load(&self, ctx: &RequestContext) -> Result<Session, RpcError> {
        let Some(id) = cookie_value(&ctx.request().headers, &self.cookie_name) else {
            return Ok(Session::fresh());
        };
        let values = self
            .store
            .read()
            .get(&id)
            .filter(|stored| stored.last_saved.elapsed() < self.ttl)
            .map(|stored| stored.values.clone());
        match values {
            Some(values) => Ok(Session {
                id,
                values,
                is_new: false,
            }),
            None => {
                debug!(session_id = %id, "unknown session id, starting fresh");
                Ok(Session::fresh())
            }
        }
    }

    async fn save(&self, ctx: &RequestContext, session: Session) -> Result<(), RpcError> {
        let stored = StoredSession {
            values: session.values,
            last_saved: Instant::now(),
        };
        let _ = self.store.write().insert(session.id.clone(), stored);
        set_cookie(ctx, &self.cookie_name, &session.id, None)
    }

    async fn destroy(&self, ctx: &RequestContext) -> Result<(), RpcError> {
        if let Some(id) = cookie_value(&ctx.request().headers, &self.cookie_name) {
            let _ = self.store.write().remove(&id);
        }
        set_cookie(ctx, &self.cookie_name, "", Some(0))
    }

    async fn evict_expired(&self) -> usize {
        let mut store = self.store.write();
        let before = store.len();
        store.retain(|_, stored| stored.last_saved.elapsed() < self.ttl);
        let evicted = before - store.len();
        if evicted > 0 {
            debug!(evicted, remaining = store.len(), "evicted idle sessions");
        }
        evicted
    }
}

#[derive(Serialize, Deserialize)]
struct SessionClaims {
    sid: String,
    data: Map<String, Value>,
}

/// Session data signed into the cookie itself (HS256).
pub struct CookieSessionProvider {
    cookie_name: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl CookieSessionProvider {
    /// Provider signing with `secret`.
    pub fn new(cookie_name: impl Into<String>, secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        Self {
            cookie_name: cookie_name.into(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl SessionProvider for CookieSessionProvider {
    async fn load(&self, ctx: &RequestContext) -> Result<Session, RpcError> {
        let Some(raw) = cookie_value(&ctx.request().headers, &self.cookie_name) else {
            return Ok(Session::fresh());
        };
        match jsonwebtoken::decode::<SessionClaims>(&raw, &self.decoding, &self.validation) {
            Ok(data) => Ok(Session {
                id: data.claims.sid,
                values: data.claims.data,
                is_new: false,
            }),
            Err(e) => {
                debug!(error = %e, "discarding unverifiable session cookie");
                Ok(Session::fresh())
            }
        }
    }

    async fn save(&self, ctx: &RequestContext, session: Session) -> Result<(), RpcError> {
        let claims = SessionClaims {
            sid: session.id,
            data: session.values,
        };
        let signed = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| RpcError::internal(format!("failed to sign session: {e}")))?;
        set_cookie(ctx, &self.cookie_name, &signed, None)
    }

    async fn destroy(&self, ctx: &RequestContext) -> Result<(), RpcError> {
        set_cookie(ctx, &self.cookie_name, "", Some(0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, Uri};

    use super::*;
    use crate::rpc::context::RequestParts;

    fn ctx_with_cookie(provider: Arc<dyn SessionProvider>, cookie: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie {
            let _ = headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
        }
        let parts = RequestParts {
            method: Method::POST,
            uri: Uri::from_static("/api/cart/item"),
            headers,
        };
        RequestContext::new(parts, None, provider)
    }

    /// Cookie pair (`name=value`) from the first `Set-Cookie` header.
    fn issued_cookie(ctx: &RequestContext) -> String {
        let headers = ctx.take_outgoing_headers();
        let raw = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        raw.split(';').next().unwrap().to_owned()
    }

    #[test]
    fn cookie_lookup_scans_all_pairs() {
        let mut headers = HeaderMap::new();
        let _ = headers.append(header::COOKIE, HeaderValue::from_static("a=1; sid=abc"));
        let _ = headers.append(header::COOKIE, HeaderValue::from_static("b=2"));
        assert_eq!(cookie_value(&headers, "sid").as_deref(), Some("abc"));
        assert_eq!(cookie_value(&headers, "b").as_deref(), Some("2"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn session_typed_access() {
        let mut session = Session::fresh();
        session.insert("count", &3_u32).unwrap();
        assert_eq!(session.get::<u32>("count"), Some(3));
        assert_eq!(session.get::<String>("count"), None);
        assert!(session.remove("count").is_some());
        assert!(session.is_empty());
    }

    async fn round_trip(provider: Arc<dyn SessionProvider>) {
        let first = ctx_with_cookie(provider.clone(), None);
        let mut session = provider.load(&first).await.unwrap();
        assert!(session.is_new());
        session.insert("cart", &vec!["apple"]).unwrap();
        let id = session.id().to_owned();
        provider.save(&first, session).await.unwrap();
        let cookie = issued_cookie(&first);

        let second = ctx_with_cookie(provider.clone(), Some(&cookie));
        let session = provider.load(&second).await.unwrap();
        assert!(!session.is_new());
        assert_eq!(session.id(), id);
        assert_eq!(session.get::<Vec<String>>("cart").unwrap(), vec!["apple"]);
    }

    #[tokio::test]
    async fn memory_sessions_round_trip() {
        round_trip(Arc::new(MemorySessionProvider::new("sid"))).await;
    }

    #[tokio::test]
    async fn cookie_sessions_round_trip() {
        round_trip(Arc::new(CookieSessionProvider::new("sid", b"secret"))).await;
    }

    #[tokio::test]
    async fn tampered_cookie_session_starts_fresh() {
        let provider: Arc<dyn SessionProvider> = Arc::new(CookieSessionProvider::new("sid", b"secret"));
        let forged = CookieSessionProvider::new("sid", b"other");
        let ctx = ctx_with_cookie(provider.clone(), None);
        let mut session = forged.load(&ctx).await.unwrap();
        session.insert("admin", &true).unwrap();
        forged.save(&ctx, session).await.unwrap();
        let cookie = issued_cookie(&ctx);

        let replay = ctx_with_cookie(provider.clone(), Some(&cookie));
        let session = provider.load(&replay).await.unwrap();
        assert!(session.is_new());
        assert_eq!(session.get::<bool>("admin"), None);
    }

    #[tokio::test]
    async fn destroy_expires_cookie_and_forgets_data() {
        let memory = Arc::new(MemorySessionProvider::new("sid"));
        let provider: Arc<dyn SessionProvider> = memory.clone();
        let ctx = ctx_with_cookie(provider.clone(), None);
        let session = provider.load(&ctx).await.unwrap();
        provider.save(&ctx, session).await.unwrap();
        let cookie = issued_cookie(&ctx);
        assert_eq!(memory.len(), 1);

        let ctx = ctx_with_cookie(provider.clone(), Some(&cookie));
        provider.destroy(&ctx).await.unwrap();
        assert!(memory.is_empty());
        let headers = ctx.take_outgoing_headers();
        let set = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set.contains("Max-Age=0"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_memory_sessions_expire_and_are_evicted() {
        let memory = Arc::new(MemorySessionProvider::new("sid").with_ttl(Duration::from_secs(60)));
        let provider: Arc<dyn SessionProvider> = memory.clone();
        let ctx = ctx_with_cookie(provider.clone(), None);
        let mut session = provider.load(&ctx).await.unwrap();
        session.insert("cart", &vec!["apple"]).unwrap();
        provider.save(&ctx, session).await.unwrap();
        let cookie = issued_cookie(&ctx);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(provider.evict_expired().await, 0);
        let again = ctx_with_cookie(provider.clone(), Some(&cookie));
        assert!(!provider.load(&again).await.unwrap().is_new());

        tokio::time::advance(Duration::from_secs(2)).await;
        let late = ctx_with_cookie(provider.clone(), Some(&cookie));
        assert!(provider.load(&late).await.unwrap().is_new());
        assert_eq!(provider.evict_expired().await, 1);
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn free_functions_use_the_current_call() {
        let provider: Arc<dyn SessionProvider> = Arc::new(MemorySessionProvider::new("sid"));
        let ctx = ctx_with_cookie(provider, None);
        let outgoing = ctx.clone();
        ctx.scope(async {
            let mut session = load().await.unwrap();
            session.insert("step", &1).unwrap();
            save(session).await.unwrap();
        })
        .await;
        assert!(outgoing.take_outgoing_headers().contains_key(header::SET_COOKIE));
        assert!(load().await.is_err());
    }
}
