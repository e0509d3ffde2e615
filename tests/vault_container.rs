//! Tests against a real Vault server in a container. They need Docker and
//! are skipped by default; run them with `cargo test -- --ignored`.

mod common;

use common::{container_config, init_logging, setup_vault_container, VaultMode};
use merka_secrets::{
    BackendState, ErrorKind, KvVersion, SecretClient, SecretStoreClient, VaultSecretClient,
    VaultSecretStoreClient,
};
use std::collections::HashMap;
use std::time::Duration;

#[tokio::test]
#[ignore] // Requires Docker
async fn test_dev_server_secret_round_trip() {
    init_logging();
    let container = setup_vault_container(VaultMode::Dev).await;
    // Dev mode mounts a KV v2 engine at "secret/"
    let config = container_config(&container)
        .await
        .with_base_path("secret", "edge/core-data")
        .with_kv_version(KvVersion::V2);

    let store = VaultSecretStoreClient::from_config(config.clone()).unwrap();
    assert_eq!(store.health_check().await.unwrap(), 200);
    assert_eq!(store.current_state().await.unwrap(), BackendState::Ready);

    let client = VaultSecretClient::from_config(config).unwrap();
    client
        .set_auth_token(&Default::default(), "root")
        .await
        .unwrap();

    let written = HashMap::from([
        ("username".to_string(), "edge".to_string()),
        ("password".to_string(), "hunter2".to_string()),
    ]);
    client.store_secrets("database", &written).await.unwrap();
    assert_eq!(client.get_secrets("database", &[]).await.unwrap(), written);
    assert_eq!(
        client.get_secrets("missing", &[]).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_dev_server_engine_setup() {
    init_logging();
    let container = setup_vault_container(VaultMode::Dev).await;
    let store = VaultSecretStoreClient::from_config(container_config(&container).await).unwrap();

    assert!(!store.check_secret_engine_installed("root", "edge", "kv").await.unwrap());
    store.enable_kv_secret_engine("root", "edge", "1").await.unwrap();
    store.enable_kv_secret_engine("root", "edge", "1").await.unwrap();
    assert!(store.check_secret_engine_installed("root", "edge", "kv").await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_regular_server_init_and_unseal() {
    init_logging();
    let container = setup_vault_container(VaultMode::Regular).await;
    let store = VaultSecretStoreClient::from_config(container_config(&container).await).unwrap();

    assert_eq!(store.current_state().await.unwrap(), BackendState::Uninitialized);
    let init = store.init(2, 3).await.unwrap();
    let progress = store.unseal(&init.keys_base64[..2]).await.unwrap();
    assert!(!progress.sealed);

    store.wait_until_ready(Duration::from_secs(30)).await.unwrap();
    let meta = store.lookup_token(&init.root_token).await.unwrap();
    assert!(meta.policies.contains(&"root".to_string()));
}
