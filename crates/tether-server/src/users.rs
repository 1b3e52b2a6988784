//! User lookup and creation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tether_core::{Principal, RpcError};
use tokio::time::Instant;
use tracing::debug;

/// How long a user added through [`UserProvider::create`] is kept.
pub const DEFAULT_CREATED_USER_TTL: Duration = Duration::from_secs(3600);

/// Source of principals for the auth gate and the login endpoints.
#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Look up a user by id.
    async fn find(&self, id: &str) -> Option<Principal>;

    /// Persist a new user. Fails with 409 if the id is taken.
    async fn create(&self, principal: Principal) -> Result<Principal, RpcError>;

    /// Drop users whose lifetime has run out. Returns how many were dropped.
    async fn evict_expired(&self) -> usize {
        0
    }
}

struct UserEntry {
    principal: Principal,
    expires_at: Option<Instant>,
}

impl UserEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local user table.
///
/// Users added with [`insert`](Self::insert) stay until replaced. Users
/// added through [`UserProvider::create`] (guests) expire after the
/// configured TTL and are dropped by [`evict_expired`](UserProvider::evict_expired).
pub struct InMemoryUserProvider {
    users: RwLock<HashMap<String, UserEntry>>,
    created_ttl: Duration,
}

impl Default for InMemoryUserProvider {
    fn default() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            created_ttl: DEFAULT_CREATED_USER_TTL,
        }
    }
}

impl InMemoryUserProvider {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime of users added through [`UserProvider::create`].
    #[must_use]
    pub fn with_created_ttl(mut self, ttl: Duration) -> Self {
        self.created_ttl = ttl;
        self
    }

    /// Builder-style insert, replacing any user with the same id.
    #[must_use]
    pub fn with_user(self, principal: Principal) -> Self {
        self.insert(principal);
        self
    }

    /// Insert or replace a user.
    pub fn insert(&self, principal: Principal) {
        let entry = UserEntry {
            principal,
            expires_at: None,
        };
        let _ = self.users.write().insert(entry.principal.id.clone(), entry);
    }

    /// Number of stored users, expired or not.
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl UserProvider for InMemoryUserProvider {
    async fn find(&self, id: &str) -> Option<Principal> {
        let now = Instant::now();
        self.users
            .read()
            .get(id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.principal.clone())
    }

    async fn create(&self, principal: Principal) -> Result<Principal, RpcError> {
        let now = Instant::now();
        let mut users = self.users.write();
        if users.get(&principal.id).is_some_and(|entry| entry.is_live(now)) {
            return Err(RpcError::status(
                409,
                format!("User '{}' already exists", principal.id),
            ));
        }
        let entry = UserEntry {
            principal: principal.clone(),
            expires_at: Some(now + self.created_ttl),
        };
        let _ = users.insert(principal.id.clone(), entry);
        Ok(principal)
    }

    async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut users = self.users.write();
        let before = users.len();
        users.retain(|_, entry| entry.is_live(now));
        let evicted = before - users.len();
        if evicted > 0 {
            debug!(evicted, remaining = users.len(), "evicted expired users");
        }
        evicted
    }
}
