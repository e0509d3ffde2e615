//! merka-secrets - Secret store client library
//!
//! This crate lets services read and write their secrets in a Vault-like
//! secret store without knowing the backend's API, and lets bootstrap code
//! drive the store through initialization, unsealing and provisioning.
//!
//! ## Architecture
//!
//! - `interface` module - the two capability traits, `SecretClient` (application
//!   facing) and `SecretStoreClient` (bootstrap/administration)
//! - `vault` module - the implementations and the backend plumbing (private to
//!   the crate; its public types are re-exported below)
//! - `cli` module - the bootstrap command-line interface
//!
//! Everything talks to the backend through the `Transport` trait, so the
//! HTTP transport can be swapped for the in-memory backend in tests.

pub mod cli;
pub mod interface;

// Vault module is private to the crate; callers use the re-exports
pub(crate) mod vault;

pub use interface::{SecretClient, SecretSet, SecretStoreClient};
pub use vault::engines::{ConsulRole, MountInfo};
pub use vault::identity::KEY_ALGORITHMS;
pub use vault::init::{InitResponse, UnsealProgress};
pub use vault::path::SecretPath;
pub use vault::secret_client::VaultSecretClient;
pub use vault::status::{BackendState, SealStatus};
pub use vault::store_client::VaultSecretStoreClient;
pub use vault::token::{AuthToken, TokenKind, TokenMetadata};
pub use vault::tokens::CreateTokenParameters;
pub use vault::{
    BackendRequest, BackendResponse, ErrorKind, HttpTransport, KvVersion, RequestMethod,
    RetryPolicy, SecretConfig, SecretsError, Transport,
};

#[cfg(any(test, feature = "testing"))]
pub use vault::test_utils::InMemoryBackend;

/// Initialize logging for tests
#[allow(dead_code)]
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer() // This ensures output goes to both stdout and test output
        .try_init();
}
