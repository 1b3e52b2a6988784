//! Caller identity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Role given to identities issued by the guest endpoint.
pub const GUEST_ROLE: &str = "guest";

/// An authenticated or anonymous identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable user id (also the login name).
    pub id: String,
    /// Hex-encoded credential hash; `None` for guests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_hash: Option<String>,
    /// Granted roles.
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    /// Create a principal with no credential and no roles.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential_hash: None,
            roles: BTreeSet::new(),
        }
    }

    /// Add roles.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Attach a credential hash.
    #[must_use]
    pub fn with_credential_hash(mut self, hash: impl Into<String>) -> Self {
        self.credential_hash = Some(hash.into());
        self
    }

    /// Whether this principal holds any of `required`.
    pub fn has_any_role(&self, required: &BTreeSet<String>) -> bool {
        !self.roles.is_disjoint(required)
    }

    /// Public view without the credential hash.
    pub fn view(&self) -> PrincipalView {
        PrincipalView {
            id: self.id.clone(),
            roles: self.roles.iter().cloned().collect(),
        }
    }
}

/// What clients get to see of a principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalView {
    /// User id.
    pub id: String,
    /// Granted roles.
    pub roles: Vec<String>,
}
