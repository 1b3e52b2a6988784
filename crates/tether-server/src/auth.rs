//! Bearer tokens and the role gate.
//!
//! Tokens are HS256 JWTs carrying `{userId, iat, exp}`. The gate resolves a
//! token to a [`Principal`] through the [`UserProvider`] and checks it against
//! the roles an operation declares:
//!
//! | token            | roles declared | outcome            |
//! |------------------|----------------|--------------------|
//! | missing/invalid  | none           | anonymous call     |
//! | missing/invalid  | some           | 401 Unauthorized   |
//! | valid            | none           | call as principal  |
//! | valid, overlap   | some           | call as principal  |
//! | valid, no overlap| some           | 403 Forbidden      |
//!
//! A token whose user no longer exists counts as invalid.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tether_core::principal::GUEST_ROLE;
use tether_core::protocol::{AuthResponse, LoginRequest};
use tether_core::{Principal, RpcError};
use tracing::{debug, info};

use crate::users::UserProvider;

/// JWT payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Token verification failures. Never surfaced to clients directly.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Signature, shape or expiry check failed.
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Issues and verifies bearer tokens.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenAuthority {
    /// Authority signing with `secret`.
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    /// Sign a token for `user_id` valid for the configured lifetime.
    pub fn issue(&self, user_id: &str) -> Result<String, RpcError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        self.sign(&Claims {
            user_id: user_id.to_owned(),
            iat: now,
            exp: now.saturating_add(ttl),
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, RpcError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| RpcError::internal(format!("failed to sign token: {e}")))
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }
}

/// Extract the token from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// SHA-256 hex digest of `"{user_id}:{password}"`.
pub fn hash_credential(user_id: &str, password: &str) -> String {
    format!("{:x}", Sha256::digest(format!("{user_id}:{password}")))
}

/// Combines token verification with user lookup.
pub struct AuthGate {
    tokens: Arc<TokenAuthority>,
    users: Arc<dyn UserProvider>,
}

impl AuthGate {
    /// Gate over `tokens` and `users`.
    pub fn new(tokens: Arc<TokenAuthority>, users: Arc<dyn UserProvider>) -> Self {
        Self { tokens, users }
    }

    /// Token authority.
    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    /// User provider.
    pub fn users(&self) -> &Arc<dyn UserProvider> {
        &self.users
    }

    /// Resolve a token to a live principal.
    pub async fn principal_for(&self, token: Option<&str>) -> Option<Principal> {
        let claims = match self.tokens.verify(token?) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "rejecting bearer token");
                return None;
            }
        };
        let principal = self.users.find(&claims.user_id).await;
        if principal.is_none() {
            debug!(user_id = %claims.user_id, "token subject no longer exists");
        }
        principal
    }

    /// Apply the role table to a call.
    ///
    /// Returns the principal the call runs as, `None` for anonymous calls.
    pub async fn authorize(
        &self,
        token: Option<&str>,
        required: &BTreeSet<String>,
    ) -> Result<Option<Principal>, RpcError> {
        match self.principal_for(token).await {
            None if required.is_empty() => Ok(None),
            None => Err(RpcError::Unauthorized),
            Some(principal) if required.is_empty() || principal.has_any_role(required) => {
                Ok(Some(principal))
            }
            Some(_) => Err(RpcError::Forbidden),
        }
    }

    /// Check credentials and issue a token.
    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, RpcError> {
        let rejected = || RpcError::status(401, "Invalid username or password");
        let principal = self
            .users
            .find(&request.username)
            .await
            .ok_or_else(rejected)?;
        let expected = hash_credential(&request.username, &request.password);
        if principal.credential_hash.as_deref() != Some(expected.as_str()) {
            debug!(user_id = %request.username, "credential mismatch");
            return Err(rejected());
        }

        let token = self.tokens.issue(&principal.id)?;
        info!(user_id = %principal.id, "login succeeded");
        Ok(AuthResponse {
            token,
            user: principal.view(),
        })
    }

    /// Create an anonymous guest identity and issue a token for it.
    pub async fn register_guest(&self) -> Result<AuthResponse, RpcError> {
        let id = format!("guest-{}", uuid::Uuid::now_v7().simple());
        let principal = self
            .users
            .create(Principal::new(id).with_roles([GUEST_ROLE]))
            .await?;
        let token = self.tokens.issue(&principal.id)?;
        info!(user_id = %principal.id, "guest registered");
        Ok(AuthResponse {
            token,
            user: principal.view(),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    use super::*;
    use crate::users::InMemoryUserProvider;

    const SECRET: &[u8] = b"test-secret";

    fn authority() -> Arc<TokenAuthority> {
        Arc::new(TokenAuthority::new(SECRET, Duration::from_secs(3600)))
    }

    fn gate() -> AuthGate {
        let users = InMemoryUserProvider::new()
            .with_user(
                Principal::new("alice")
                    .with_roles(["admin"])
                    .with_credential_hash(hash_credential("alice", "wonderland")),
            )
            .with_user(Principal::new("bob").with_roles(["user"]));
        AuthGate::new(authority(), Arc::new(users))
    }

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn issued_token_verifies() {
        let tokens = authority();
        let token = tokens.issue("alice").unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.user_id, "alice");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn claims_use_user_id_key() {
        let claims = Claims {
            user_id: "u1".into(),
            iat: 1,
            exp: 2,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["userId"], "u1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = authority();
        let now = Utc::now().timestamp();
        let token = tokens
            .sign(&Claims {
                user_id: "alice".into(),
                iat: now - 100,
                exp: now - 10,
            })
            .unwrap();
        assert_matches!(tokens.verify(&token), Err(AuthError::Invalid(_)));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let other = TokenAuthority::new(b"other", Duration::from_secs(60));
        let token = other.issue("alice").unwrap();
        assert!(authority().verify(&token).is_err());
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(bearer_token(&headers), Some("xyz"));
        let _ = headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn credential_hash_is_sha256_hex() {
        let hash = hash_credential("alice", "wonderland");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, hash_credential("alice", "wonderlane"));
    }

    #[tokio::test]
    async fn anonymous_allowed_without_roles() {
        let gate = gate();
        assert_eq!(gate.authorize(None, &roles(&[])).await.unwrap(), None);
        assert_eq!(
            gate.authorize(Some("garbage"), &roles(&[])).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn missing_token_with_roles_is_unauthorized() {
        let gate = gate();
        assert_matches!(
            gate.authorize(None, &roles(&["admin"])).await,
            Err(RpcError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn role_overlap_decides_forbidden() {
        let gate = gate();
        let bob = gate.tokens().issue("bob").unwrap();
        assert_matches!(
            gate.authorize(Some(&bob), &roles(&["admin"])).await,
            Err(RpcError::Forbidden)
        );

        let alice = gate.tokens().issue("alice").unwrap();
        let principal = gate
            .authorize(Some(&alice), &roles(&["admin"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.id, "alice");
    }

    #[tokio::test]
    async fn valid_token_without_roles_runs_as_principal() {
        let gate = gate();
        let bob = gate.tokens().issue("bob").unwrap();
        let principal = gate.authorize(Some(&bob), &roles(&[])).await.unwrap();
        assert_eq!(principal.unwrap().id, "bob");
    }

    #[tokio::test]
    async fn token_for_deleted_user_is_invalid() {
        let gate = gate();
        let ghost = gate.tokens().issue("ghost").unwrap();
        assert_matches!(
            gate.authorize(Some(&ghost), &roles(&["admin"])).await,
            Err(RpcError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let gate = gate();
        let ok = gate
            .login(&LoginRequest {
                username: "alice".into(),
                password: "wonderland".into(),
            })
            .await
            .unwrap();
        assert_eq!(ok.user.id, "alice");
        assert_eq!(gate.tokens().verify(&ok.token).unwrap().user_id, "alice");

        let err = gate
            .login(&LoginRequest {
                username: "alice".into(),
                password: "nope".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 401);
        assert!(err.is_application_error());
    }

    #[tokio::test]
    async fn guests_get_a_fresh_identity() {
        let gate = gate();
        let a = gate.register_guest().await.unwrap();
        let b = gate.register_guest().await.unwrap();
        assert_ne!(a.user.id, b.user.id);
        assert_eq!(a.user.roles, vec![GUEST_ROLE.to_owned()]);
        assert!(gate.principal_for(Some(&a.token)).await.is_some());
    }
}
