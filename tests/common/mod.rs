//! Shared fixtures for the integration tests: logging, the in-memory
//! backend wiring and a Vault container for the `#[ignore]`d tests.

#![allow(dead_code)]

use merka_secrets::{
    InMemoryBackend, KvVersion, SecretConfig, VaultSecretClient, VaultSecretStoreClient,
};
use std::sync::Arc;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

/// Set up logging for tests
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer() // This ensures output goes to both stdout and test output
        .try_init();
}

/// Policy granting a service the paths below `edge/` on both KV mounts,
/// Consul credentials and self-issued JWTs.
pub const SERVICE_POLICY: &str = r#"
path "secret/edge/*" { capabilities = ["create", "read", "update", "list"] }
path "kv/data/edge/*" { capabilities = ["create", "read", "update"] }
path "kv/metadata/edge/*" { capabilities = ["list"] }
path "consul/creds/*" { capabilities = ["read"] }
path "identity/oidc/token/*" { capabilities = ["read"] }
"#;

pub fn service_config(kv_version: KvVersion, service: &str) -> SecretConfig {
    let mount = match kv_version {
        KvVersion::V1 => "secret",
        KvVersion::V2 => "kv",
    };
    SecretConfig::default()
        .with_base_path(mount, &format!("edge/{}", service))
        .with_kv_version(kv_version)
}

/// A dev backend with the service policy installed, and a client for
/// `service` holding a token with that policy.
pub async fn service_client(
    kv_version: KvVersion,
    service: &str,
) -> (Arc<InMemoryBackend>, VaultSecretClient) {
    let backend = Arc::new(InMemoryBackend::dev());
    backend.put_policy("service", SERVICE_POLICY);
    let token = backend.issue_token(&["service"], None);
    let client =
        VaultSecretClient::with_token(service_config(kv_version, service), backend.clone(), &token)
            .await
            .unwrap();
    (backend, client)
}

pub fn store_client(backend: &Arc<InMemoryBackend>) -> VaultSecretStoreClient {
    VaultSecretStoreClient::new(SecretConfig::default(), backend.clone())
}

/// Indicates the mode in which to run the Vault container.
/// Use `Dev` for development mode with relaxed security and `Regular` for a production-like configuration.
pub enum VaultMode {
    // Regular mode starts uninitialized and sealed.
    Regular,
    Dev,
}

pub async fn setup_vault_container(mode: VaultMode) -> ContainerAsync<GenericImage> {
    match mode {
        VaultMode::Dev => GenericImage::new("hashicorp/vault", "1.18.4")
            .with_exposed_port(8200.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Vault server started!"))
            .with_env_var("VAULT_DEV_ROOT_TOKEN_ID", "root")
            .with_env_var("VAULT_DEV_LISTEN_ADDRESS", "0.0.0.0:8200")
            .with_cmd(vec!["server", "-dev", "-dev-root-token-id=root"])
            .start()
            .await
            .unwrap(),
        VaultMode::Regular => {
            let vault_local_config = r#"
            {"storage": {"file": {"path": "/vault/file"}},
             "listener": [{"tcp": { "address": "0.0.0.0:8200", "tls_disable": true}}],
             "default_lease_ttl": "168h", "max_lease_ttl": "720h", "ui": true}
            "#;
            GenericImage::new("hashicorp/vault", "1.18.4")
                .with_exposed_port(8200.tcp())
                .with_wait_for(WaitFor::message_on_stdout("Vault server started!"))
                .with_env_var("VAULT_LOCAL_CONFIG", vault_local_config)
                .with_cmd(vec!["server"])
                .with_cap_add("IPC_LOCK")
                .start()
                .await
                .unwrap()
        }
    }
}

/// Client config pointing at a running container.
pub async fn container_config(container: &ContainerAsync<GenericImage>) -> SecretConfig {
    let host = container.get_host().await.unwrap().to_string();
    let port = container.get_host_port_ipv4(8200).await.unwrap();
    SecretConfig::new(&host, port)
}
