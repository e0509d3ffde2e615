//! Capability traits for the secret store.
//!
//! Application code depends on [`SecretClient`]; bootstrap code depends on
//! [`SecretStoreClient`]. The two share no base trait so each caller only
//! sees the operations it needs.

use crate::vault::engines::ConsulRole;
use crate::vault::init::{InitResponse, UnsealProgress};
use crate::vault::token::TokenMetadata;
use crate::vault::tokens::CreateTokenParameters;
use crate::vault::SecretsError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Secret key to secret value, for one secret path.
pub type SecretSet = HashMap<String, String>;

/// Storing and retrieving secrets with the token a service was given.
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Retrieves secrets at `sub_path` (appended to the configured base path).
    /// With no `keys`, every key at the path is returned. Non-string values
    /// written by other tools come back as their JSON text.
    async fn get_secrets(&self, sub_path: &str, keys: &[&str]) -> Result<SecretSet, SecretsError>;

    /// Upserts `secrets` at `sub_path`: existing keys are overwritten, new
    /// keys added, keys not mentioned are left alone with their stored JSON
    /// values.
    async fn store_secrets(&self, sub_path: &str, secrets: &SecretSet) -> Result<(), SecretsError>;

    /// Issues a new Consul token for `service_key`.
    ///
    /// Every call creates a fresh token. Callers should cache the result at
    /// least for the lifetime of their process instead of calling this per
    /// request.
    async fn generate_consul_token(&self, service_key: &str) -> Result<String, SecretsError>;

    /// Replaces the held token. The new token is looked up first; the
    /// lookup is abandoned with `Cancelled` when `cancel` fires.
    async fn set_auth_token(
        &self,
        cancel: &CancellationToken,
        token: &str,
    ) -> Result<(), SecretsError>;

    /// Key names at `sub_path`, without their values. Sub paths end in '/'.
    async fn get_keys(&self, sub_path: &str) -> Result<Vec<String>, SecretsError>;

    /// Encoded JWT for the identity behind the held token.
    async fn get_self_jwt(&self, service_key: &str) -> Result<String, SecretsError>;

    /// Whether `jwt` was issued by this backend and is still current.
    /// Errors only when the question cannot be answered.
    async fn is_jwt_valid(&self, jwt: &str) -> Result<bool, SecretsError>;
}

/// Lifecycle and administration of the secret store itself.
#[async_trait]
pub trait SecretStoreClient: Send + Sync {
    async fn health_check(&self) -> Result<u16, SecretsError>;
    async fn init(
        &self,
        secret_threshold: u8,
        secret_shares: u8,
    ) -> Result<InitResponse, SecretsError>;
    async fn unseal(&self, keys_base64: &[String]) -> Result<UnsealProgress, SecretsError>;
    async fn install_policy(
        &self,
        token: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), SecretsError>;
    async fn check_secret_engine_installed(
        &self,
        token: &str,
        mount_point: &str,
        engine: &str,
    ) -> Result<bool, SecretsError>;
    async fn enable_kv_secret_engine(
        &self,
        token: &str,
        mount_point: &str,
        kv_version: &str,
    ) -> Result<(), SecretsError>;
    async fn enable_consul_secret_engine(
        &self,
        token: &str,
        mount_point: &str,
        default_lease_ttl: &str,
    ) -> Result<(), SecretsError>;
    async fn regen_root_token(&self, keys: &[String]) -> Result<String, SecretsError>;
    async fn create_token(
        &self,
        token: &str,
        parameters: &CreateTokenParameters,
    ) -> Result<Map<String, Value>, SecretsError>;
    async fn list_token_accessors(&self, token: &str) -> Result<Vec<String>, SecretsError>;
    async fn revoke_token_accessor(&self, token: &str, accessor: &str) -> Result<(), SecretsError>;
    async fn lookup_token_accessor(
        &self,
        token: &str,
        accessor: &str,
    ) -> Result<TokenMetadata, SecretsError>;
    async fn lookup_token(&self, token: &str) -> Result<TokenMetadata, SecretsError>;
    async fn revoke_token(&self, token: &str) -> Result<(), SecretsError>;
    async fn configure_consul_access(
        &self,
        secret_store_token: &str,
        bootstrap_acl_token: &str,
        consul_host: &str,
        consul_port: u16,
    ) -> Result<(), SecretsError>;
    async fn create_role(
        &self,
        secret_store_token: &str,
        consul_role: &ConsulRole,
    ) -> Result<(), SecretsError>;
    async fn create_or_update_identity(
        &self,
        token: &str,
        name: &str,
        metadata: &HashMap<String, String>,
        policies: &[String],
    ) -> Result<String, SecretsError>;
    async fn delete_identity(&self, token: &str, name: &str) -> Result<(), SecretsError>;
    async fn lookup_identity(&self, token: &str, name: &str) -> Result<String, SecretsError>;
    async fn check_auth_method_enabled(
        &self,
        token: &str,
        mount_point: &str,
        auth_type: &str,
    ) -> Result<bool, SecretsError>;
    async fn enable_password_auth(&self, token: &str, mount_point: &str)
        -> Result<(), SecretsError>;
    async fn lookup_auth_handle(&self, token: &str, mount_point: &str)
        -> Result<String, SecretsError>;
    async fn create_or_update_user(
        &self,
        token: &str,
        mount_point: &str,
        username: &str,
        password: &str,
        token_ttl: &str,
        token_policies: &[String],
    ) -> Result<(), SecretsError>;
    async fn delete_user(
        &self,
        token: &str,
        mount_point: &str,
        username: &str,
    ) -> Result<(), SecretsError>;
    async fn bind_user_to_identity(
        &self,
        token: &str,
        identity_id: &str,
        auth_handle: &str,
        username: &str,
    ) -> Result<(), SecretsError>;
    async fn internal_service_login(
        &self,
        token: &str,
        auth_engine: &str,
        username: &str,
        password: &str,
    ) -> Result<Map<String, Value>, SecretsError>;
    async fn check_identity_key_exists(
        &self,
        token: &str,
        key_name: &str,
    ) -> Result<bool, SecretsError>;
    async fn create_named_identity_key(
        &self,
        token: &str,
        key_name: &str,
        algorithm: &str,
    ) -> Result<(), SecretsError>;
    async fn create_or_update_identity_role(
        &self,
        token: &str,
        role_name: &str,
        key_name: &str,
        template: &str,
        jwt_ttl: &str,
    ) -> Result<(), SecretsError>;
}
