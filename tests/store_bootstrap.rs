//! End to end bootstrap of a fresh secret store followed by service access,
//! run against the in-memory backend.

mod common;

use common::{init_logging, store_client, SERVICE_POLICY};
use merka_secrets::{
    BackendState, ConsulRole, CreateTokenParameters, ErrorKind, InMemoryBackend, KvVersion,
    SecretClient, SecretConfig, SecretStoreClient, VaultSecretClient,
};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_fresh_store_to_working_service() {
    init_logging();
    let backend = Arc::new(InMemoryBackend::new());
    let store = store_client(&backend);

    assert_eq!(store.current_state().await.unwrap(), BackendState::Uninitialized);
    assert_eq!(
        store.unseal(&["c2hhcmU=".to_string()]).await.unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );

    let init = store.init(3, 5).await.unwrap();
    assert_eq!(init.keys_base64.len(), 5);
    assert_eq!(store.init(3, 5).await.unwrap_err().kind(), ErrorKind::AlreadyInitialized);

    for (i, key) in init.keys_base64.iter().take(3).enumerate() {
        let progress = store.unseal(std::slice::from_ref(key)).await.unwrap();
        assert_eq!(progress.sealed, i < 2, "after share {}", i + 1);
    }
    assert_eq!(store.current_state().await.unwrap(), BackendState::Ready);

    let root = init.root_token.as_str();
    store.install_policy(root, "service", SERVICE_POLICY).await.unwrap();
    store.enable_kv_secret_engine(root, "secret", "1").await.unwrap();
    store.enable_kv_secret_engine(root, "secret", "1").await.unwrap();
    assert_eq!(
        store.enable_kv_secret_engine(root, "secret", "2").await.unwrap_err().kind(),
        ErrorKind::Conflict
    );

    let auth = store
        .create_token(
            root,
            &CreateTokenParameters::new()
                .policies(&["service"])
                .ttl("1h")
                .display_name("core-data"),
        )
        .await
        .unwrap();
    let service_token = auth["client_token"].as_str().unwrap().to_string();

    let config = SecretConfig::default()
        .with_base_path("secret", "edge/core-data")
        .with_kv_version(KvVersion::V1);
    let client = VaultSecretClient::with_token(config, backend.clone(), &service_token)
        .await
        .unwrap();
    let written: HashMap<String, String> =
        HashMap::from([("password".to_string(), "s3cr3t".to_string())]);
    client.store_secrets("db", &written).await.unwrap();
    assert_eq!(client.get_secrets("db", &["password"]).await.unwrap(), written);
}

#[tokio::test]
async fn test_revoked_accessor_locks_out_service() {
    let backend = Arc::new(InMemoryBackend::dev());
    let store = store_client(&backend);
    store.install_policy("root", "service", SERVICE_POLICY).await.unwrap();

    let auth = store
        .create_token("root", &CreateTokenParameters::new().policies(&["service"]))
        .await
        .unwrap();
    let token = auth["client_token"].as_str().unwrap().to_string();
    let accessor = auth["accessor"].as_str().unwrap().to_string();

    let meta = store.lookup_token_accessor("root", &accessor).await.unwrap();
    assert!(meta.policies.contains(&"service".to_string()));
    assert_eq!(store.lookup_token(&token).await.unwrap().accessor, accessor);

    store.revoke_token_accessor("root", &accessor).await.unwrap();
    assert_eq!(
        store.lookup_token(&token).await.unwrap_err().kind(),
        ErrorKind::Unauthorized
    );
}

#[tokio::test]
async fn test_consul_bootstrap_order() {
    let backend = Arc::new(InMemoryBackend::dev());
    let store = store_client(&backend);
    let role = ConsulRole::new("core-data", vec!["core-data-acl".to_string()]);

    assert_eq!(
        store
            .configure_consul_access("root", "bootstrap", "localhost", 8500)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::PreconditionFailed
    );

    store.enable_consul_secret_engine("root", "consul", "1h").await.unwrap();
    assert!(store
        .check_secret_engine_installed("root", "consul", "consul")
        .await
        .unwrap());
    store
        .configure_consul_access("root", "bootstrap", "localhost", 8500)
        .await
        .unwrap();
    store.create_role("root", &role).await.unwrap();

    store.install_policy("root", "service", SERVICE_POLICY).await.unwrap();
    let token = backend.issue_token(&["service"], None);
    let client = VaultSecretClient::with_token(SecretConfig::default(), backend.clone(), &token)
        .await
        .unwrap();
    let first = client.generate_consul_token("core-data").await.unwrap();
    assert_ne!(first, client.generate_consul_token("core-data").await.unwrap());
}

#[tokio::test]
async fn test_service_login_carries_identity() {
    let backend = Arc::new(InMemoryBackend::dev());
    let store = store_client(&backend);
    let policies = vec!["service".to_string()];
    store.install_policy("root", "service", SERVICE_POLICY).await.unwrap();

    store.enable_password_auth("root", "userpass").await.unwrap();
    store
        .create_or_update_user("root", "userpass", "core-data", "pw", "1h", &policies)
        .await
        .unwrap();
    let handle = store.lookup_auth_handle("root", "userpass").await.unwrap();

    assert_eq!(
        store
            .bind_user_to_identity("root", "missing-entity", &handle, "core-data")
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::PreconditionFailed
    );
    let id = store
        .create_or_update_identity("root", "core-data", &HashMap::new(), &policies)
        .await
        .unwrap();
    store
        .bind_user_to_identity("root", &id, &handle, "core-data")
        .await
        .unwrap();

    store
        .create_named_identity_key("root", "edgex-identity", "ES384")
        .await
        .unwrap();
    store
        .create_or_update_identity_role("root", "core-data", "edgex-identity", "", "1h")
        .await
        .unwrap();

    let auth = store
        .internal_service_login("", "userpass", "core-data", "pw")
        .await
        .unwrap();
    let token = auth["client_token"].as_str().unwrap();
    let client = VaultSecretClient::with_token(SecretConfig::default(), backend.clone(), token)
        .await
        .unwrap();
    let jwt = client.get_self_jwt("core-data").await.unwrap();
    assert!(client.is_jwt_valid(&jwt).await.unwrap());
}
