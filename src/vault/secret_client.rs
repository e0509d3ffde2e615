//! Application facing secret client.
//!
//! A [`VaultSecretClient`] holds exactly one token and resolves every sub
//! path against the configured mount and base path. It never caches secret
//! values or derived tokens and never renews its token on its own.

use crate::interface::{SecretClient, SecretSet};
use crate::vault::common::{call, check_response, require_segment, str_field, string_list};
use crate::vault::path::SecretPath;
use crate::vault::token::{lookup_self, AuthToken, TokenHolder, TokenKind};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::{HttpTransport, KvVersion, SecretConfig, SecretsError};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct VaultSecretClient {
    config: SecretConfig,
    transport: Arc<dyn Transport>,
    token: TokenHolder,
}

/// Raw values read from a path plus the KV v2 version they were read at.
/// A missing or deleted secret reads as empty data.
struct StoredSecrets {
    data: Map<String, Value>,
    version: u64,
}

impl VaultSecretClient {
    /// Creates a client without a token. Calls fail with `Unauthorized`
    /// until [`SecretClient::set_auth_token`] succeeds.
    pub fn new(config: SecretConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            token: TokenHolder::default(),
        }
    }

    /// Creates a client over HTTP using the address and TLS settings in `config`.
    pub fn from_config(config: SecretConfig) -> Result<Self, SecretsError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// Creates a client and installs `token`, looking it up once.
    pub async fn with_token(
        config: SecretConfig,
        transport: Arc<dyn Transport>,
        token: &str,
    ) -> Result<Self, SecretsError> {
        let client = Self::new(config, transport);
        client
            .set_auth_token(&CancellationToken::new(), token)
            .await?;
        Ok(client)
    }

    pub fn config(&self) -> &SecretConfig {
        &self.config
    }

    /// Kind of the token currently held.
    pub async fn auth_token_kind(&self) -> TokenKind {
        self.token.snapshot().await.kind()
    }

    fn secret_path(&self, sub_path: &str) -> Result<SecretPath, SecretsError> {
        SecretPath::new(&self.config.mount, &self.config.base_path, sub_path)
    }

    async fn current_token(&self) -> Result<AuthToken, SecretsError> {
        let token = self.token.snapshot().await;
        if token.is_empty() {
            return Err(SecretsError::Unauthorized(
                "no secret store token has been set".to_string(),
            ));
        }
        Ok(token)
    }

    async fn read_secrets(
        &self,
        path: &SecretPath,
        token: &AuthToken,
    ) -> Result<StoredSecrets, SecretsError> {
        let kv_version = self.config.kv_version;
        let request_path = path.data_path(kv_version);
        let response = self
            .transport
            .send(BackendRequest::get(request_path.clone()).with_token(token.expose()))
            .await?;

        // KV v2 answers 404 for a deleted or destroyed latest version but
        // still reports that version, which the next check-and-set needs
        let not_found = response.status == 404;
        let body = if not_found {
            response.body
        } else {
            check_response(response, &request_path)?
        };

        let (data, version) = match kv_version {
            KvVersion::V1 => (body.get("data"), 0),
            KvVersion::V2 => (
                body.pointer("/data/data"),
                body.pointer("/data/metadata/version")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            ),
        };
        if not_found {
            debug!("Nothing stored at {} (version {})", path, version);
            return Ok(StoredSecrets {
                data: Map::new(),
                version,
            });
        }

        let data = match data {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                return Err(SecretsError::malformed(format!(
                    "secret data at {} is not an object: {}",
                    path, other
                )))
            }
        };

        Ok(StoredSecrets { data, version })
    }
}

/// Secret values are strings. Values of other JSON types written by other
/// tools are returned in their JSON text form.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SecretClient for VaultSecretClient {
    async fn get_secrets(&self, sub_path: &str, keys: &[&str]) -> Result<SecretSet, SecretsError> {
        let path = self.secret_path(sub_path)?;
        let token = self.current_token().await?;
        debug!("Reading secrets at {}", path);

        let stored = self.read_secrets(&path, &token).await?;
        if stored.data.is_empty() {
            return Err(SecretsError::NotFound(format!("no secrets at {}", path)));
        }
        if keys.is_empty() {
            return Ok(stored
                .data
                .iter()
                .map(|(key, value)| (key.clone(), value_to_string(value)))
                .collect());
        }

        let mut selected = SecretSet::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match stored.data.get(*key) {
                Some(value) => {
                    selected.insert(key.to_string(), value_to_string(value));
                }
                None => missing.push(key.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(SecretsError::NotFound(format!(
                "no value for keys [{}] at {}",
                missing.join(", "),
                path
            )));
        }
        Ok(selected)
    }

    async fn store_secrets(&self, sub_path: &str, secrets: &SecretSet) -> Result<(), SecretsError> {
        if secrets.is_empty() {
            return Err(SecretsError::Invalid("no secrets to store".to_string()));
        }
        if secrets.keys().any(|key| key.trim().is_empty()) {
            return Err(SecretsError::Invalid(
                "secret keys must not be empty".to_string(),
            ));
        }

        let path = self.secret_path(sub_path)?;
        let token = self.current_token().await?;

        // Keys the caller does not mention keep their stored JSON values
        let existing = self.read_secrets(&path, &token).await?;
        let mut merged = existing.data;
        for (key, value) in secrets {
            merged.insert(key.clone(), Value::String(value.clone()));
        }

        let body = match self.config.kv_version {
            KvVersion::V1 => Value::Object(merged),
            // cas turns a concurrent writer into a Conflict instead of a lost update
            KvVersion::V2 => json!({
                "data": merged,
                "options": { "cas": existing.version },
            }),
        };

        call(
            self.transport.as_ref(),
            BackendRequest::post(path.data_path(self.config.kv_version))
                .with_token(token.expose())
                .with_body(body),
        )
        .await?;
        debug!("Stored {} secret(s) at {}", secrets.len(), path);
        Ok(())
    }

    async fn generate_consul_token(&self, service_key: &str) -> Result<String, SecretsError> {
        require_segment(service_key, "service key")?;
        let token = self.current_token().await?;
        let path = format!(
            "/v1/{}/creds/{}",
            self.config.consul_mount.trim_matches('/'),
            service_key
        );

        let body = call(
            self.transport.as_ref(),
            BackendRequest::get(path).with_token(token.expose()),
        )
        .await?;
        let consul_token = str_field(&body, "/data/token")?;
        info!("Generated Consul token for service '{}'", service_key);
        Ok(consul_token)
    }

    async fn set_auth_token(
        &self,
        cancel: &CancellationToken,
        token: &str,
    ) -> Result<(), SecretsError> {
        if token.trim().is_empty() {
            return Err(SecretsError::Invalid("auth token must not be empty".to_string()));
        }

        let metadata = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SecretsError::Cancelled(
                    "auth token replacement was cancelled".to_string(),
                ));
            }
            result = lookup_self(self.transport.as_ref(), token) => result?,
        };

        let kind = metadata.kind();
        self.token.replace(AuthToken::new(token, kind)).await;
        info!(
            "Secret store token replaced (kind: {:?}, ttl: {}s)",
            kind, metadata.ttl
        );
        Ok(())
    }

    async fn get_keys(&self, sub_path: &str) -> Result<Vec<String>, SecretsError> {
        let path = self.secret_path(sub_path)?;
        let token = self.current_token().await?;

        let body = call(
            self.transport.as_ref(),
            BackendRequest::list(path.list_path(self.config.kv_version)).with_token(token.expose()),
        )
        .await?;
        if body.pointer("/data/keys").is_none() {
            return Err(SecretsError::NotFound(format!("no keys at {}", path)));
        }
        Ok(string_list(&body, "/data/keys"))
    }

    async fn get_self_jwt(&self, service_key: &str) -> Result<String, SecretsError> {
        require_segment(service_key, "service key")?;
        let token = self.current_token().await?;
        if token.kind() != TokenKind::Identity {
            return Err(SecretsError::Unsupported(format!(
                "a {:?} token cannot issue JWTs; an identity based token is required",
                token.kind()
            )));
        }

        let body = call(
            self.transport.as_ref(),
            BackendRequest::get(format!("/v1/identity/oidc/token/{}", service_key))
                .with_token(token.expose()),
        )
        .await?;
        str_field(&body, "/data/token")
    }

    async fn is_jwt_valid(&self, jwt: &str) -> Result<bool, SecretsError> {
        if jsonwebtoken::decode_header(jwt).is_err() {
            debug!("Rejecting structurally invalid JWT without introspection");
            return Ok(false);
        }
        let token = self.current_token().await?;

        let result = call(
            self.transport.as_ref(),
            BackendRequest::post("/v1/identity/oidc/introspect")
                .with_token(token.expose())
                .with_body(json!({ "token": jwt })),
        )
        .await;

        match result {
            Ok(body) => Ok(body.get("active").and_then(Value::as_bool).unwrap_or(false)),
            // Introspection answers 400 for tokens it evaluated and rejected
            Err(SecretsError::Invalid(reason)) => {
                debug!("JWT rejected by introspection: {}", reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
