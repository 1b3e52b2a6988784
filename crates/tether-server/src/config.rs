//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its JSON over defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)
//!
//! Invalid environment values are logged and ignored.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::protocol::DEFAULT_PREFIX;
use tracing::{debug, warn};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON or has the wrong shape.
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// How per-request sessions are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Session id cookie, data held in server memory.
    #[default]
    Memory,
    /// Whole session signed into the cookie.
    Cookie,
}

/// Tether server settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port; `0` picks a free port.
    pub port: u16,
    /// Path prefix of the RPC dispatcher.
    pub prefix: String,
    /// HS256 signing secret. A random one is generated at startup when unset.
    pub jwt_secret: Option<String>,
    /// Bearer token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Interval between hub keep-alive comments.
    pub keep_alive_interval_ms: u64,
    /// Maximum accepted request body.
    pub max_body_bytes: usize,
    /// Per-subscription outbound buffer (events).
    pub subscription_buffer: usize,
    /// Session storage strategy.
    pub session_mode: SessionMode,
    /// Name of the session cookie.
    pub session_cookie_name: String,
    /// Idle lifetime of server-held sessions, in seconds.
    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            prefix: DEFAULT_PREFIX.into(),
            jwt_secret: None,
            token_ttl_secs: 3600,
            keep_alive_interval_ms: 8000,
            max_body_bytes: 16 * 1024 * 1024,
            subscription_buffer: 256,
            session_mode: SessionMode::Memory,
            session_cookie_name: "tether_session".into(),
            session_ttl_secs: 86_400,
        }
    }
}

impl ServerConfig {
    /// Prefix with a leading slash and no trailing slash; `""` for root.
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }

    /// Token lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Session idle lifetime.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Keep-alive cadence.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values that would make the server misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "tokenTtlSecs",
                reason: "must be positive".into(),
            });
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sessionTtlSecs",
                reason: "must be positive".into(),
            });
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "keepAliveIntervalMs",
                reason: "must be positive".into(),
            });
        }
        if self.subscription_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "subscriptionBuffer",
                reason: "must be positive".into(),
            });
        }
        if self.session_cookie_name.is_empty()
            || self
                .session_cookie_name
                .contains(|c: char| c.is_whitespace() || matches!(c, ';' | '=' | ','))
        {
            return Err(ConfigError::Invalid {
                field: "sessionCookieName",
                reason: format!("`{}` is not a valid cookie name", self.session_cookie_name),
            });
        }
        Ok(())
    }
}

/// Normalize a dispatcher prefix.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Load configuration from an optional JSON file plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            warn!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive JSON merge: objects merge per key, everything else is replaced.
/// `null` in `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` overrides read through `lookup`.
pub fn apply_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TETHER_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16("TETHER_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = env.string("TETHER_PREFIX") {
        config.prefix = v;
    }
    if let Some(v) = env.string("TETHER_JWT_SECRET") {
        config.jwt_secret = Some(v);
    }
    if let Some(v) = env.u64("TETHER_TOKEN_TTL_SECS", 1, 31_536_000) {
        config.token_ttl_secs = v;
    }
    if let Some(v) = env.u64("TETHER_SESSION_TTL_SECS", 1, 31_536_000) {
        config.session_ttl_secs = v;
    }
    if let Some(v) = env.u64("TETHER_KEEP_ALIVE_MS", 100, 600_000) {
        config.keep_alive_interval_ms = v;
    }
    if let Some(v) = env.usize("TETHER_MAX_BODY_BYTES", 1024, 1_073_741_824) {
        config.max_body_bytes = v;
    }
    if let Some(v) = env.string("TETHER_SESSION_MODE") {
        match parse_session_mode(&v) {
            Some(mode) => config.session_mode = mode,
            None => warn!(key = "TETHER_SESSION_MODE", value = %v, "unknown session mode, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a session mode name (case-insensitive).
pub fn parse_session_mode(val: &str) -> Option<SessionMode> {
    match val.to_ascii_lowercase().as_str() {
        "memory" => Some(SessionMode::Memory),
        "cookie" => Some(SessionMode::Cookie),
        _ => None,
    }
}

/// Parse a `u16` within `[min, max]`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a `usize` within `[min, max]`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, |v| parse_usize_range(v, min, max))
    }
}
