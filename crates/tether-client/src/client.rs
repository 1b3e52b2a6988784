//! `RpcClient`: calls module operations over HTTP.
//!
//! Method names map to requests with the same convention the server uses:
//! `getUser(1)` is `GET {prefix}/{module}/user/1`, unless forced POST is on,
//! in which case calls with arguments become `POST {prefix}/{module}/getUser`
//! with a JSON array body.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, SET_COOKIE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tether_core::codec;
use tether_core::protocol::{
    AuthResponse, CONTENT_TYPE_JSON, DEFAULT_PREFIX, GUEST_PATH, LOGIN_PATH, LoginRequest,
    PUBLISH_PATH, PublishAck, PublishRequest, SUBSCRIBE_PATH,
};
use tether_core::route::{self, Verb};
use tether_core::RichValue;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::CancellationManager;
use crate::errors::{ClientError, Result};
use crate::push::{self, PushStream};
use crate::response::{self, Response};

/// Characters left unescaped in path arguments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Client settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server origin, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Dispatcher prefix.
    pub prefix: String,
    /// Send GET/DELETE calls that carry arguments as POST.
    pub force_post_for_args: bool,
    /// Store `Set-Cookie` values and send them back.
    pub manual_cookies: bool,
    /// Per-request timeout; `None` leaves streams unbounded.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            prefix: DEFAULT_PREFIX.into(),
            force_post_for_args: true,
            manual_cookies: true,
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn method_of(verb: Verb) -> Method {
    match verb {
        Verb::Get => Method::GET,
        Verb::Post => Method::POST,
        Verb::Put => Method::PUT,
        Verb::Delete => Method::DELETE,
    }
}

/// Parse a `Set-Cookie` value into `(name, value, expired)`, `None` if
/// malformed.
fn parse_set_cookie(header: &str) -> Option<(String, String, bool)> {
    let mut attrs = header.split(';');
    let (name, value) = attrs.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let expired = attrs.any(|attr| {
        attr.trim()
            .split_once('=')
            .is_some_and(|(k, v)| k.trim().eq_ignore_ascii_case("max-age") && v.trim() == "0")
    });
    Some((name.to_owned(), value.trim().to_owned(), expired))
}

struct Inner {
    config: ClientConfig,
    base_url: String,
    prefix: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    cookies: Mutex<BTreeMap<String, String>>,
    cancellation: Arc<CancellationManager>,
}

/// Handle to a tether server. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Build a client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;
        Ok(Self::with_http(config, http))
    }

    /// Build a client around an existing `reqwest::Client`.
    pub fn with_http(config: ClientConfig, http: reqwest::Client) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_owned();
        let prefix = normalize_prefix(&config.prefix);
        Self {
            inner: Arc::new(Inner {
                config,
                base_url,
                prefix,
                http,
                token: RwLock::new(None),
                cookies: Mutex::new(BTreeMap::new()),
                cancellation: Arc::new(CancellationManager::new()),
            }),
        }
    }

    /// Settings.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Proxy for the module `name`.
    pub fn module(&self, name: impl Into<String>) -> ModuleProxy {
        ModuleProxy {
            client: self.clone(),
            name: name.into(),
        }
    }

    /// In-flight call tracking.
    pub fn cancellation(&self) -> &Arc<CancellationManager> {
        &self.inner.cancellation
    }

    /// Current bearer token.
    pub fn token(&self) -> Option<String> {
        self.inner.token.read().clone()
    }

    /// Use `token` for subsequent calls.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.inner.token.write() = Some(token.into());
    }

    /// Forget the bearer token.
    pub fn clear_token(&self) {
        *self.inner.token.write() = None;
    }

    /// Stored cookies.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.inner.cookies.lock().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.base_url)
    }

    fn call_url(&self, module: &str, segment: &str, path_args: &[String]) -> String {
        let mut url = format!(
            "{}{}/{}/{}",
            self.inner.base_url,
            self.inner.prefix,
            utf8_percent_encode(module, SEGMENT),
            utf8_percent_encode(segment, SEGMENT),
        );
        for arg in path_args {
            url.push('/');
            url.push_str(arg);
        }
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self.inner.http.request(method, url);
        if let Some(token) = self.inner.token.read().as_deref() {
            request = request.bearer_auth(token);
        }
        if self.inner.config.manual_cookies {
            let cookies = self.inner.cookies.lock();
            if !cookies.is_empty() {
                let header = cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                request = request.header(COOKIE, header);
            }
        }
        request
    }

    fn store_cookies(&self, headers: &HeaderMap) {
        if !self.inner.config.manual_cookies {
            return;
        }
        let mut cookies = self.inner.cookies.lock();
        for value in headers.get_all(SET_COOKIE) {
            let Some((name, value, expired)) = value.to_str().ok().and_then(parse_set_cookie) else {
                continue;
            };
            if expired || value.is_empty() {
                let _ = cookies.remove(&name);
            } else {
                let _ = cookies.insert(name, value);
            }
        }
    }

    /// Call `module.method(args)`.
    pub async fn invoke(&self, module: &str, method: &str, args: Vec<RichValue>) -> Result<Response> {
        self.invoke_with_signal(module, method, args, None).await
    }

    /// Call `module.method(args)`, cancellable through `signal`.
    pub async fn invoke_with_signal(
        &self,
        module: &str,
        method: &str,
        args: Vec<RichValue>,
        signal: Option<CancellationToken>,
    ) -> Result<Response> {
        let guard = self.inner.cancellation.begin(signal);
        let plan = route::plan_call(method, !args.is_empty(), self.inner.config.force_post_for_args);

        let request = if plan.args_in_path {
            let segments = args
                .iter()
                .map(|arg| {
                    codec::encode(arg)
                        .map(|json| utf8_percent_encode(&json, SEGMENT).to_string())
                        .map_err(|e| ClientError::unencodable_argument(&e))
                })
                .collect::<Result<Vec<_>>>()?;
            self.request(method_of(plan.verb), &self.call_url(module, &plan.segment, &segments))
        } else {
            let url = self.call_url(module, &plan.segment, &[]);
            let mut request = self.request(method_of(plan.verb), &url);
            if plan.verb.carries_body() {
                let body = codec::encode_auto(RichValue::Array(args))
                    .await
                    .map_err(|e| ClientError::unencodable_argument(&e))?;
                request = request.header(CONTENT_TYPE, CONTENT_TYPE_JSON).body(body);
            }
            request
        };

        debug!(
            request_id = guard.id(),
            module,
            method,
            verb = %plan.verb,
            forced_post = plan.forced_post,
            "rpc call"
        );

        let token = guard.token().clone();
        let resp = tokio::select! {
            () = token.cancelled() => return Err(ClientError::Cancelled),
            resp = request.send() => resp?,
        };
        self.store_cookies(resp.headers());
        response::decode(resp, guard).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .request(Method::POST, &self.url(path))
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(serde_json::to_vec(body)?)
            .send()
            .await?;
        self.store_cookies(resp.headers());
        if !resp.status().is_success() {
            return Err(response::status_error(resp).await);
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Log in and keep the issued token.
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthResponse> {
        let auth: AuthResponse = self
            .post_json(
                LOGIN_PATH,
                &LoginRequest {
                    username: username.to_owned(),
                    password: password.to_owned(),
                },
            )
            .await?;
        self.set_token(auth.token.clone());
        Ok(auth)
    }

    /// Obtain a guest identity and keep its token.
    pub async fn register_guest(&self) -> Result<AuthResponse> {
        let auth: AuthResponse = self.post_json(GUEST_PATH, &serde_json::Value::Null).await?;
        self.set_token(auth.token.clone());
        Ok(auth)
    }

    /// Send `payload` to `to` through the hub.
    pub async fn publish(&self, to: &str, payload: impl Into<RichValue>) -> Result<PublishAck> {
        let request = PublishRequest {
            to: to.to_owned(),
            payload: payload.into(),
        };
        self.post_json(PUBLISH_PATH, &request).await
    }

    /// Open this identity's push subscription.
    pub async fn subscribe(&self) -> Result<PushStream> {
        let resp = self.request(Method::GET, &self.url(SUBSCRIBE_PATH)).send().await?;
        if !resp.status().is_success() {
            return Err(response::status_error(resp).await);
        }
        Ok(push::push_stream(resp))
    }
}

/// Calls operations of one module by name.
#[derive(Clone)]
pub struct ModuleProxy {
    client: RpcClient,
    name: String,
}

impl ModuleProxy {
    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call `method` with `args`.
    pub async fn call(&self, method: &str, args: Vec<RichValue>) -> Result<Response> {
        self.client.invoke(&self.name, method, args).await
    }

    /// Call `method`, cancellable through `signal`.
    pub async fn call_with_signal(
        &self,
        method: &str,
        args: Vec<RichValue>,
        signal: CancellationToken,
    ) -> Result<Response> {
        self.client
            .invoke_with_signal(&self.name, method, args, Some(signal))
            .await
    }

    /// Call `method` and deserialize its value.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<RichValue>) -> Result<T> {
        self.call(method, args).await?.deserialize()
    }
}

/// Build an argument list: `args![1, "two", true]`.
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::RichValue>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::RichValue::from($arg)),+]
    };
}
