//! Bootstrap client for the secret store itself.
//!
//! [`VaultSecretStoreClient`] tracks the backend lifecycle
//! (uninitialized, sealed, unsealed, ready) and refuses administrative
//! calls while the backend is not ready, instead of letting them fail
//! with a transport error halfway through a bootstrap sequence.

use crate::interface::SecretStoreClient;
use crate::vault::engines::{self, ConsulRole};
use crate::vault::init::{self, InitResponse, UnsealProgress};
use crate::vault::status::{self, BackendState};
use crate::vault::token::TokenMetadata;
use crate::vault::tokens::{self, CreateTokenParameters};
use crate::vault::transport::Transport;
use crate::vault::{auth, identity, ErrorKind, HttpTransport, SecretConfig, SecretsError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct VaultSecretStoreClient {
    config: SecretConfig,
    transport: Arc<dyn Transport>,
    /// Last observed lifecycle state; `None` until the first health check.
    state: Mutex<Option<BackendState>>,
    /// Decoded unseal shares accepted since the backend was last sealed.
    submitted_shares: Mutex<HashSet<Vec<u8>>>,
}

impl VaultSecretStoreClient {
    pub fn new(config: SecretConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            state: Mutex::new(None),
            submitted_shares: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: SecretConfig) -> Result<Self, SecretsError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &SecretConfig {
        &self.config
    }

    /// Queries the backend and returns its current lifecycle state.
    pub async fn current_state(&self) -> Result<BackendState, SecretsError> {
        self.refresh_state().await
    }

    async fn refresh_state(&self) -> Result<BackendState, SecretsError> {
        let code = status::health_code(self.transport.as_ref()).await;
        let code = match code {
            Ok(code) => code,
            Err(e) => {
                *self.state.lock().await = None;
                return Err(e);
            }
        };
        let state = BackendState::from_health_code(code).ok_or_else(|| {
            SecretsError::Backend(code, "unexpected health status".to_string())
        })?;
        let mut cached = self.state.lock().await;
        if *cached != Some(state) {
            debug!("Secret store state: {:?} -> {:?}", *cached, state);
        }
        *cached = Some(state);
        Ok(state)
    }

    /// Waits until the backend is unsealed and active.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SecretsError> {
        status::wait_for_ready(self.transport.as_ref(), timeout, READY_POLL_INTERVAL).await?;
        *self.state.lock().await = Some(BackendState::Ready);
        Ok(())
    }

    async fn require_ready(&self) -> Result<(), SecretsError> {
        if *self.state.lock().await == Some(BackendState::Ready) {
            return Ok(());
        }
        match self.refresh_state().await? {
            BackendState::Ready => Ok(()),
            state => Err(SecretsError::PreconditionFailed(format!(
                "secret store is {:?}, administrative operations need it ready",
                state
            ))),
        }
    }

    /// Runs an administrative operation once the backend is ready. A lost
    /// connection drops the cached state so the next call checks again.
    async fn when_ready<T, F>(&self, operation: F) -> Result<T, SecretsError>
    where
        F: Future<Output = Result<T, SecretsError>> + Send,
    {
        self.require_ready().await?;
        let result = operation.await;
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Unreachable {
                warn!("Secret store became unreachable: {}", e);
                *self.state.lock().await = None;
            }
        }
        result
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

#[async_trait]
impl SecretStoreClient for VaultSecretStoreClient {
    async fn health_check(&self) -> Result<u16, SecretsError> {
        let code = status::health_code(self.transport()).await?;
        *self.state.lock().await = BackendState::from_health_code(code);
        Ok(code)
    }

    async fn init(
        &self,
        secret_threshold: u8,
        secret_shares: u8,
    ) -> Result<InitResponse, SecretsError> {
        init::validate_init_params(secret_threshold, secret_shares)?;
        if self.refresh_state().await?.is_initialized() {
            return Err(SecretsError::AlreadyInitialized);
        }

        let response = init::init(self.transport(), secret_threshold, secret_shares).await?;
        *self.state.lock().await = Some(BackendState::Sealed);
        self.submitted_shares.lock().await.clear();
        Ok(response)
    }

    async fn unseal(&self, keys_base64: &[String]) -> Result<UnsealProgress, SecretsError> {
        match self.refresh_state().await? {
            BackendState::Uninitialized => {
                return Err(SecretsError::PreconditionFailed(
                    "secret store must be initialized before it can be unsealed".to_string(),
                ))
            }
            BackendState::Unsealed | BackendState::Ready => {
                info!("Secret store already unsealed");
                let seal = status::seal_status(self.transport()).await?;
                return Ok(UnsealProgress {
                    sealed: false,
                    progress: 0,
                    threshold: seal.t,
                });
            }
            BackendState::Sealed => {}
        }

        let mut submitted = self.submitted_shares.lock().await;
        // Progress was reset on the backend (resealed, or reset by another
        // operator), so earlier shares may be submitted again
        if !submitted.is_empty() && status::seal_status(self.transport()).await?.progress == 0 {
            debug!("Unseal progress was reset, forgetting submitted shares");
            submitted.clear();
        }

        let progress = init::unseal(self.transport(), keys_base64, &mut submitted).await?;
        if !progress.sealed {
            info!("Secret store unsealed");
            submitted.clear();
            *self.state.lock().await = None;
        }
        Ok(progress)
    }

    async fn install_policy(
        &self,
        token: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(engines::install_policy(
            self.transport(),
            token,
            policy_name,
            policy_document,
        ))
        .await
    }

    async fn check_secret_engine_installed(
        &self,
        token: &str,
        mount_point: &str,
        engine: &str,
    ) -> Result<bool, SecretsError> {
        self.when_ready(engines::check_secret_engine_installed(
            self.transport(),
            token,
            mount_point,
            engine,
        ))
        .await
    }

    async fn enable_kv_secret_engine(
        &self,
        token: &str,
        mount_point: &str,
        kv_version: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(engines::enable_kv_secret_engine(
            self.transport(),
            token,
            mount_point,
            kv_version,
        ))
        .await
    }

    async fn enable_consul_secret_engine(
        &self,
        token: &str,
        mount_point: &str,
        default_lease_ttl: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(engines::enable_consul_secret_engine(
            self.transport(),
            token,
            mount_point,
            default_lease_ttl,
        ))
        .await
    }

    async fn regen_root_token(&self, keys: &[String]) -> Result<String, SecretsError> {
        let token = self
            .when_ready(init::regen_root_token(self.transport(), keys))
            .await?;
        warn!("A new root token was generated; revoke it once bootstrap is complete");
        Ok(token)
    }

    async fn create_token(
        &self,
        token: &str,
        parameters: &CreateTokenParameters,
    ) -> Result<Map<String, Value>, SecretsError> {
        self.when_ready(tokens::create_token(self.transport(), token, parameters))
            .await
    }

    async fn list_token_accessors(&self, token: &str) -> Result<Vec<String>, SecretsError> {
        self.when_ready(tokens::list_token_accessors(self.transport(), token))
            .await
    }

    async fn revoke_token_accessor(&self, token: &str, accessor: &str) -> Result<(), SecretsError> {
        self.when_ready(tokens::revoke_token_accessor(self.transport(), token, accessor))
            .await
    }

    async fn lookup_token_accessor(
        &self,
        token: &str,
        accessor: &str,
    ) -> Result<TokenMetadata, SecretsError> {
        self.when_ready(tokens::lookup_token_accessor(self.transport(), token, accessor))
            .await
    }

    async fn lookup_token(&self, token: &str) -> Result<TokenMetadata, SecretsError> {
        self.when_ready(tokens::lookup_token(self.transport(), token))
            .await
    }

    async fn revoke_token(&self, token: &str) -> Result<(), SecretsError> {
        self.when_ready(tokens::revoke_token(self.transport(), token))
            .await
    }

    async fn configure_consul_access(
        &self,
        secret_store_token: &str,
        bootstrap_acl_token: &str,
        consul_host: &str,
        consul_port: u16,
    ) -> Result<(), SecretsError> {
        self.when_ready(engines::configure_consul_access(
            self.transport(),
            secret_store_token,
            &self.config.consul_mount,
            bootstrap_acl_token,
            consul_host,
            consul_port,
        ))
        .await
    }

    async fn create_role(
        &self,
        secret_store_token: &str,
        consul_role: &ConsulRole,
    ) -> Result<(), SecretsError> {
        self.when_ready(engines::create_role(
            self.transport(),
            secret_store_token,
            &self.config.consul_mount,
            consul_role,
        ))
        .await
    }

    async fn create_or_update_identity(
        &self,
        token: &str,
        name: &str,
        metadata: &HashMap<String, String>,
        policies: &[String],
    ) -> Result<String, SecretsError> {
        self.when_ready(identity::create_or_update_identity(
            self.transport(),
            token,
            name,
            metadata,
            policies,
        ))
        .await
    }

    async fn delete_identity(&self, token: &str, name: &str) -> Result<(), SecretsError> {
        self.when_ready(identity::delete_identity(self.transport(), token, name))
            .await
    }

    async fn lookup_identity(&self, token: &str, name: &str) -> Result<String, SecretsError> {
        self.when_ready(identity::lookup_identity(self.transport(), token, name))
            .await
    }

    async fn check_auth_method_enabled(
        &self,
        token: &str,
        mount_point: &str,
        auth_type: &str,
    ) -> Result<bool, SecretsError> {
        self.when_ready(auth::check_auth_method_enabled(
            self.transport(),
            token,
            mount_point,
            auth_type,
        ))
        .await
    }

    async fn enable_password_auth(
        &self,
        token: &str,
        mount_point: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(auth::enable_password_auth(self.transport(), token, mount_point))
            .await
    }

    async fn lookup_auth_handle(
        &self,
        token: &str,
        mount_point: &str,
    ) -> Result<String, SecretsError> {
        self.when_ready(auth::lookup_auth_handle(self.transport(), token, mount_point))
            .await
    }

    async fn create_or_update_user(
        &self,
        token: &str,
        mount_point: &str,
        username: &str,
        password: &str,
        token_ttl: &str,
        token_policies: &[String],
    ) -> Result<(), SecretsError> {
        self.when_ready(auth::create_or_update_user(
            self.transport(),
            token,
            mount_point,
            username,
            password,
            token_ttl,
            token_policies,
        ))
        .await
    }

    async fn delete_user(
        &self,
        token: &str,
        mount_point: &str,
        username: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(auth::delete_user(self.transport(), token, mount_point, username))
            .await
    }

    async fn bind_user_to_identity(
        &self,
        token: &str,
        identity_id: &str,
        auth_handle: &str,
        username: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(identity::bind_user_to_identity(
            self.transport(),
            token,
            identity_id,
            auth_handle,
            username,
        ))
        .await
    }

    async fn internal_service_login(
        &self,
        token: &str,
        auth_engine: &str,
        username: &str,
        password: &str,
    ) -> Result<Map<String, Value>, SecretsError> {
        self.when_ready(auth::internal_service_login(
            self.transport(),
            token,
            auth_engine,
            username,
            password,
        ))
        .await
    }

    async fn check_identity_key_exists(
        &self,
        token: &str,
        key_name: &str,
    ) -> Result<bool, SecretsError> {
        self.when_ready(identity::check_identity_key_exists(
            self.transport(),
            token,
            key_name,
        ))
        .await
    }

    async fn create_named_identity_key(
        &self,
        token: &str,
        key_name: &str,
        algorithm: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(identity::create_named_identity_key(
            self.transport(),
            token,
            key_name,
            algorithm,
        ))
        .await
    }

    async fn create_or_update_identity_role(
        &self,
        token: &str,
        role_name: &str,
        key_name: &str,
        template: &str,
        jwt_ttl: &str,
    ) -> Result<(), SecretsError> {
        self.when_ready(identity::create_or_update_identity_role(
            self.transport(),
            token,
            role_name,
            key_name,
            template,
            jwt_ttl,
        ))
        .await
    }
}
