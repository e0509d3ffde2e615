//! Behaviour of the application facing secret client, run against the
//! in-memory backend through the public API only.

mod common;

use common::{init_logging, service_client, service_config};
use merka_secrets::{ErrorKind, KvVersion, SecretClient, SecretSet, TokenKind, VaultSecretClient};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn secrets(pairs: &[(&str, &str)]) -> SecretSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_read_after_write_on_both_kv_versions() {
    init_logging();
    for version in [KvVersion::V1, KvVersion::V2] {
        let (_backend, client) = service_client(version, "core-data").await;
        let written = secrets(&[("username", "edge"), ("password", "hunter2")]);
        client.store_secrets("database", &written).await.unwrap();

        assert_eq!(client.get_secrets("database", &[]).await.unwrap(), written);
        assert_eq!(
            client.get_secrets("database", &["username"]).await.unwrap(),
            secrets(&[("username", "edge")])
        );
    }
}

#[tokio::test]
async fn test_upsert_keeps_unrelated_keys() {
    let (_backend, client) = service_client(KvVersion::V2, "core-data").await;
    client.store_secrets("mqtt", &secrets(&[("user", "a"), ("password", "b")])).await.unwrap();
    client.store_secrets("mqtt", &secrets(&[("password", "c")])).await.unwrap();

    let stored = client.get_secrets("mqtt", &[]).await.unwrap();
    assert_eq!(stored, secrets(&[("user", "a"), ("password", "c")]));
}

#[tokio::test]
async fn test_partial_key_sets_are_not_found() {
    let (_backend, client) = service_client(KvVersion::V1, "core-data").await;
    client.store_secrets("redis", &secrets(&[("password", "p")])).await.unwrap();

    let err = client
        .get_secrets("redis", &["password", "username"])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_services_cannot_read_each_other() {
    let (backend, core_data) = service_client(KvVersion::V1, "core-data").await;
    core_data.store_secrets("db", &secrets(&[("password", "p")])).await.unwrap();

    backend.put_policy(
        "metadata",
        r#"path "secret/edge/core-metadata/*" { capabilities = ["read"] }"#,
    );
    let token = backend.issue_token(&["metadata"], None);
    let config = service_config(KvVersion::V1, "core-data");
    let other = VaultSecretClient::with_token(config, backend.clone(), &token)
        .await
        .unwrap();

    let err = other.get_secrets("db", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_key_listing_does_not_expose_values() {
    let (_backend, client) = service_client(KvVersion::V2, "core-data").await;
    client.store_secrets("db", &secrets(&[("password", "p")])).await.unwrap();
    client.store_secrets("certs/tls", &secrets(&[("cert", "c")])).await.unwrap();

    let keys = client.get_keys("").await.unwrap();
    assert_eq!(keys, vec!["certs/".to_string(), "db".to_string()]);
}

#[tokio::test]
async fn test_every_consul_token_is_new() {
    let (backend, client) = service_client(KvVersion::V1, "core-data").await;
    backend.enable_consul("consul", &["core-data"]);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        assert!(seen.insert(client.generate_consul_token("core-data").await.unwrap()));
    }
}

#[tokio::test]
async fn test_jwt_issue_and_validation() {
    let (backend, plain) = service_client(KvVersion::V1, "core-data").await;
    assert_eq!(
        plain.get_self_jwt("core-data").await.unwrap_err().kind(),
        ErrorKind::Unsupported
    );

    backend.create_oidc_role("core-data", "edgex-identity", 900);
    let entity = backend.create_entity("core-data");
    let token = backend.issue_token(&["service"], Some(&entity));
    plain
        .set_auth_token(&CancellationToken::new(), &token)
        .await
        .unwrap();
    assert_eq!(plain.auth_token_kind().await, TokenKind::Identity);

    let jwt = plain.get_self_jwt("core-data").await.unwrap();
    assert_eq!(jwt.split('.').count(), 3);
    assert!(plain.is_jwt_valid(&jwt).await.unwrap());
    assert!(!plain.is_jwt_valid("a.b.c").await.unwrap());
    assert!(!plain.is_jwt_valid("").await.unwrap());
}

#[tokio::test]
async fn test_concurrent_writers_on_shared_client() {
    let (_backend, client) = service_client(KvVersion::V1, "core-data").await;
    let client = Arc::new(client);

    let mut writers = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        writers.push(tokio::spawn(async move {
            let path = format!("worker-{}", i);
            let id = i.to_string();
            client
                .store_secrets(&path, &secrets(&[("id", id.as_str())]))
                .await
                .unwrap();
            client.get_secrets(&path, &["id"]).await.unwrap()
        }));
    }
    for (i, writer) in writers.into_iter().enumerate() {
        assert_eq!(writer.await.unwrap()["id"], i.to_string());
    }
}
