//! Token issuance, introspection and revocation.

use crate::vault::common::{call, require_name, require_token, string_list};
use crate::vault::token::{lookup_self, TokenMetadata};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::info;

/// Parameters for `auth/token/create`.
///
/// The parameter object is passed through to the backend untouched. The
/// setters cover the recognized keys: `policies`, `ttl`, `period`,
/// `renewable`, `display_name`, `meta`, `no_parent`, `num_uses`,
/// `entity_alias` and `type`. Anything else can be added with
/// [`CreateTokenParameters::set`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreateTokenParameters(Map<String, Value>);

impl CreateTokenParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn policies(self, policies: &[&str]) -> Self {
        self.set("policies", json!(policies))
    }

    pub fn ttl(self, ttl: &str) -> Self {
        self.set("ttl", json!(ttl))
    }

    /// Makes the token periodic: it never expires as long as it is renewed
    /// within `period`.
    pub fn period(self, period: &str) -> Self {
        self.set("period", json!(period))
    }

    pub fn renewable(self, renewable: bool) -> Self {
        self.set("renewable", json!(renewable))
    }

    pub fn display_name(self, display_name: &str) -> Self {
        self.set("display_name", json!(display_name))
    }

    pub fn meta(self, meta: &HashMap<String, String>) -> Self {
        self.set("meta", json!(meta))
    }

    pub fn no_parent(self, no_parent: bool) -> Self {
        self.set("no_parent", json!(no_parent))
    }

    pub fn num_uses(self, num_uses: u32) -> Self {
        self.set("num_uses", json!(num_uses))
    }

    pub fn entity_alias(self, alias: &str) -> Self {
        self.set("entity_alias", json!(alias))
    }

    /// "service" or "batch".
    pub fn token_type(self, token_type: &str) -> Self {
        self.set("type", json!(token_type))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for CreateTokenParameters {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Creates a child token of `token`. Returns the `auth` section of the
/// response (`client_token`, `accessor`, `policies`, ...).
pub async fn create_token(
    transport: &dyn Transport,
    token: &str,
    parameters: &CreateTokenParameters,
) -> Result<Map<String, Value>, SecretsError> {
    require_token(token)?;
    let body = call(
        transport,
        BackendRequest::post("/v1/auth/token/create")
            .with_token(token)
            .with_body(Value::Object(parameters.as_map().clone())),
    )
    .await?;

    match body.get("auth") {
        Some(Value::Object(auth)) => {
            let accessor = auth.get("accessor").and_then(Value::as_str).unwrap_or("?");
            info!("Created token with accessor {}", accessor);
            Ok(auth.clone())
        }
        _ => Err(SecretsError::malformed("token creation without auth section")),
    }
}

pub async fn list_token_accessors(
    transport: &dyn Transport,
    token: &str,
) -> Result<Vec<String>, SecretsError> {
    require_token(token)?;
    let body = call(
        transport,
        BackendRequest::list("/v1/auth/token/accessors").with_token(token),
    )
    .await?;
    Ok(string_list(&body, "/data/keys"))
}

pub async fn revoke_token_accessor(
    transport: &dyn Transport,
    token: &str,
    accessor: &str,
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(accessor, "accessor")?;
    call(
        transport,
        BackendRequest::post("/v1/auth/token/revoke-accessor")
            .with_token(token)
            .with_body(json!({ "accessor": accessor })),
    )
    .await?;
    info!("Revoked token with accessor {}", accessor);
    Ok(())
}

pub async fn lookup_token_accessor(
    transport: &dyn Transport,
    token: &str,
    accessor: &str,
) -> Result<TokenMetadata, SecretsError> {
    require_token(token)?;
    require_name(accessor, "accessor")?;
    let body = call(
        transport,
        BackendRequest::post("/v1/auth/token/lookup-accessor")
            .with_token(token)
            .with_body(json!({ "accessor": accessor })),
    )
    .await?;
    let data = body
        .get("data")
        .cloned()
        .ok_or_else(|| SecretsError::malformed("accessor lookup without data"))?;
    Ok(serde_json::from_value(data)?)
}

pub async fn lookup_token(
    transport: &dyn Transport,
    token: &str,
) -> Result<TokenMetadata, SecretsError> {
    lookup_self(transport, token).await
}

/// Revokes `token` itself (and its children).
pub async fn revoke_token(transport: &dyn Transport, token: &str) -> Result<(), SecretsError> {
    require_token(token)?;
    call(
        transport,
        BackendRequest::post("/v1/auth/token/revoke-self").with_token(token),
    )
    .await?;
    info!("Revoked token");
    Ok(())
}
