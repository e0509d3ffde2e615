//! Vault module for the Merka Secrets library
//!
//! This module implements the client side of the secret store contract.
//! It provides the backend operations that the capability traits in
//! `interface` are built from.
//!
//! ## Architectural role:
//! - `transport` / `client` own the wire (the `Transport` seam and its reqwest implementation)
//! - `common`, `path` and `token` hold the plumbing shared by both clients
//! - `secret_client` is the application facing client
//! - `status`, `init`, `engines`, `tokens`, `auth` and `identity` hold the
//!   administrative operations driven by `store_client`
//!
//! ## Testing strategy:
//! - Each module contains its own unit tests within a `#[cfg(test)] mod tests` block
//! - Tests run against the in-memory backend from `test_utils.rs`, which
//!   emulates the backend semantics the clients rely on
//! - Tests that need a real Vault use Docker containers and are `#[ignore]`d

pub mod auth;
pub mod client;
pub mod common;
pub mod engines;
pub mod error;
pub mod identity;
pub mod init;
pub mod path;
pub mod secret_client;
pub mod status;
pub mod store_client;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
pub mod token;
pub mod tokens;
pub mod transport;

// Re-export key types and traits for convenience
pub use client::HttpTransport;
pub use error::{ErrorKind, SecretsError};
pub use transport::{BackendRequest, BackendResponse, RequestMethod, Transport};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version of the key/value engine the secret client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KvVersion {
    #[default]
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2")]
    V2,
}

impl std::str::FromStr for KvVersion {
    type Err = SecretsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "v1" => Ok(KvVersion::V1),
            "2" | "v2" => Ok(KvVersion::V2),
            other => Err(SecretsError::Invalid(format!(
                "unsupported kv version '{}'",
                other
            ))),
        }
    }
}

impl KvVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvVersion::V1 => "1",
            KvVersion::V2 => "2",
        }
    }
}

/// Retry behaviour of the transport for connection failures.
///
/// A single attempt is the default: the clients never retry on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Secret store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    /// "http" or "https".
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Optional namespace for namespaced (enterprise) backends
    pub namespace: Option<String>,
    /// Optional PEM CA certificate for verifying the server
    pub root_ca_cert_path: Option<String>,
    /// Mount point of the key/value engine, e.g. "secret".
    pub mount: String,
    /// Path below the mount that every sub path is resolved against.
    pub base_path: String,
    pub kv_version: KvVersion,
    /// Mount point of the Consul secrets engine.
    pub consul_mount: String,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8200,
            namespace: None,
            root_ca_cert_path: None,
            mount: "secret".to_string(),
            base_path: String::new(),
            kv_version: KvVersion::V1,
            consul_mount: "consul".to_string(),
            timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl SecretConfig {
    /// Create a config pointing at `host:port` with all other settings defaulted.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set the key/value mount and the base path below it
    pub fn with_base_path(mut self, mount: &str, base_path: &str) -> Self {
        self.mount = mount.to_string();
        self.base_path = base_path.to_string();
        self
    }

    pub fn with_kv_version(mut self, kv_version: KvVersion) -> Self {
        self.kv_version = kv_version;
        self
    }

    /// Set namespace
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Use https and verify the server against the given CA bundle
    pub fn with_tls(mut self, ca_cert_path: &str) -> Self {
        self.protocol = "https".to_string();
        self.root_ca_cert_path = Some(ca_cert_path.to_string());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Base URL of the backend, e.g. "http://127.0.0.1:8200".
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Build a config from `SECRETSTORE_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, SecretsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, SecretsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(protocol) = lookup("SECRETSTORE_PROTOCOL") {
            config.protocol = protocol;
        }
        if let Some(host) = lookup("SECRETSTORE_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("SECRETSTORE_PORT") {
            config.port = port
                .parse()
                .map_err(|_| SecretsError::Invalid(format!("invalid port '{}'", port)))?;
        }
        config.namespace = lookup("SECRETSTORE_NAMESPACE").filter(|ns| !ns.is_empty());
        config.root_ca_cert_path = lookup("SECRETSTORE_ROOT_CA_CERT").filter(|p| !p.is_empty());
        if let Some(mount) = lookup("SECRETSTORE_MOUNT") {
            config.mount = mount;
        }
        if let Some(base_path) = lookup("SECRETSTORE_BASE_PATH") {
            config.base_path = base_path;
        }
        if let Some(version) = lookup("SECRETSTORE_KV_VERSION") {
            config.kv_version = version.parse()?;
        }
        Ok(config)
    }
}
