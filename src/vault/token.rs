//! Authentication token types shared by both clients.

use crate::vault::common::{call, require_token};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// What a token is able to do beyond plain path access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TokenKind {
    #[default]
    Plain,
    /// Bound to an identity entity; can self-issue JWTs.
    Identity,
    Root,
}

/// Bearer credential held by a client. The value never shows up in Debug
/// output and is wiped from memory on drop.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct AuthToken {
    value: String,
    #[zeroize(skip)]
    kind: TokenKind,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    pub fn plain(value: impl Into<String>) -> Self {
        Self::new(value, TokenKind::Plain)
    }

    /// The bearer value. Never log the result.
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"[REDACTED]")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Introspection record for a token or accessor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    /// Unix timestamp
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub expire_time: Option<String>,
    /// Remaining TTL in seconds; 0 for tokens that never expire.
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub period: Option<i64>,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

impl TokenMetadata {
    pub fn kind(&self) -> TokenKind {
        if self.policies.iter().any(|p| p == "root") {
            TokenKind::Root
        } else if !self.entity_id.is_empty() {
            TokenKind::Identity
        } else {
            TokenKind::Plain
        }
    }
}

/// Looks up the token itself (`auth/token/lookup-self`).
pub async fn lookup_self(
    transport: &dyn Transport,
    token: &str,
) -> Result<TokenMetadata, SecretsError> {
    require_token(token)?;
    let body = call(
        transport,
        BackendRequest::get("/v1/auth/token/lookup-self").with_token(token),
    )
    .await?;
    let data = body
        .get("data")
        .cloned()
        .ok_or_else(|| SecretsError::malformed("token lookup without data"))?;
    Ok(serde_json::from_value(data)?)
}

/// Single-writer slot for the token a client currently holds.
///
/// Readers take a snapshot per request, so a replacement racing an
/// in-flight call never hands out a partially written token.
#[derive(Debug, Default)]
pub struct TokenHolder {
    current: RwLock<AuthToken>,
}

impl TokenHolder {
    pub fn new(token: AuthToken) -> Self {
        Self {
            current: RwLock::new(token),
        }
    }

    pub async fn snapshot(&self) -> AuthToken {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, token: AuthToken) {
        *self.current.write().await = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_value() {
        let token = AuthToken::new("hvs.very-secret", TokenKind::Identity);
        let printed = format!("{:?}", token);
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("Identity"));
    }

    #[test]
    fn test_kind_from_metadata() {
        let mut meta = TokenMetadata {
            policies: vec!["default".into()],
            ..Default::default()
        };
        assert_eq!(meta.kind(), TokenKind::Plain);
        meta.entity_id = "b5c3a0d2".into();
        assert_eq!(meta.kind(), TokenKind::Identity);
        meta.policies.push("root".into());
        assert_eq!(meta.kind(), TokenKind::Root);
    }

    #[test]
    fn test_metadata_tolerates_null_fields() {
        let meta: TokenMetadata = serde_json::from_value(serde_json::json!({
            "accessor": "acc-1",
            "policies": ["default", "app"],
            "expire_time": null,
            "meta": null,
            "ttl": 3600,
            "renewable": true
        }))
        .unwrap();
        assert_eq!(meta.accessor, "acc-1");
        assert_eq!(meta.expire_time, None);
        assert!(meta.renewable);
    }

    #[tokio::test]
    async fn test_holder_replaces_whole_token() {
        let holder = TokenHolder::new(AuthToken::plain("old"));
        let before = holder.snapshot().await;
        holder
            .replace(AuthToken::new("new", TokenKind::Identity))
            .await;
        let after = holder.snapshot().await;
        assert_eq!(before.expose(), "old");
        assert_eq!(after.expose(), "new");
        assert_eq!(after.kind(), TokenKind::Identity);
    }
}
