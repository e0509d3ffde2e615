//! Helpers for checking backend health and lifecycle state

use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Lifecycle of the backend as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Uninitialized,
    /// Initialized but sealed.
    Sealed,
    /// Unsealed but not the active node yet (standby, recovering).
    Unsealed,
    /// Unsealed and serving requests.
    Ready,
}

impl BackendState {
    /// Maps the `sys/health` status code onto a lifecycle state.
    pub fn from_health_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(BackendState::Ready),
            429 | 472 | 473 => Some(BackendState::Unsealed),
            501 => Some(BackendState::Uninitialized),
            503 => Some(BackendState::Sealed),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self != BackendState::Uninitialized
    }
}

/// Answer of the `sys/seal-status` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SealStatus {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub sealed: bool,
    /// Threshold
    #[serde(default)]
    pub t: u8,
    /// Number of shares
    #[serde(default)]
    pub n: u8,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub nonce: String,
}

/// Calls `sys/health` and returns its status code. Any answer, including the
/// 5xx codes used for sealed and uninitialized backends, is a valid health
/// result; only a missing answer is an error.
pub async fn health_code(transport: &dyn Transport) -> Result<u16, SecretsError> {
    let response = transport
        .send(BackendRequest::get("/v1/sys/health"))
        .await?;
    debug!("Health check returned {}", response.status);
    Ok(response.status)
}

/// Calls `sys/seal-status`.
pub async fn seal_status(transport: &dyn Transport) -> Result<SealStatus, SecretsError> {
    let response = transport
        .send(BackendRequest::get("/v1/sys/seal-status"))
        .await?;
    // An uninitialized backend may answer 400 here
    if response.status == 400 {
        return Ok(SealStatus {
            sealed: true,
            ..Default::default()
        });
    }
    let body = crate::vault::common::check_response(response, "/v1/sys/seal-status")?;
    Ok(serde_json::from_value(body)?)
}

/// Polls `sys/health` until the backend reports [`BackendState::Ready`].
pub async fn wait_for_ready(
    transport: &dyn Transport,
    timeout: Duration,
    interval: Duration,
) -> Result<(), SecretsError> {
    let start = Instant::now();
    loop {
        match health_code(transport).await {
            Ok(code) if BackendState::from_health_code(code) == Some(BackendState::Ready) => {
                info!("Secret store is ready");
                return Ok(());
            }
            Ok(code) => debug!("Waiting for secret store (health status {})", code),
            Err(e) => debug!("Waiting for secret store: {}", e),
        }
        if start.elapsed() > timeout {
            return Err(SecretsError::Unreachable(format!(
                "secret store not ready after {:?}",
                timeout
            )));
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::test_utils::InMemoryBackend;
    use crate::vault::ErrorKind;

    #[test]
    fn test_health_code_mapping() {
        assert_eq!(BackendState::from_health_code(200), Some(BackendState::Ready));
        assert_eq!(BackendState::from_health_code(429), Some(BackendState::Unsealed));
        assert_eq!(BackendState::from_health_code(501), Some(BackendState::Uninitialized));
        assert_eq!(BackendState::from_health_code(503), Some(BackendState::Sealed));
        assert_eq!(BackendState::from_health_code(418), None);
    }

    #[tokio::test]
    async fn test_seal_status_of_fresh_backend() {
        let backend = InMemoryBackend::new();
        let status = seal_status(&backend).await.unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);
        assert_eq!(health_code(&backend).await.unwrap(), 501);
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out_on_sealed_backend() {
        let backend = InMemoryBackend::new();
        let err = wait_for_ready(&backend, Duration::from_millis(30), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_wait_for_ready_on_dev_backend() {
        let backend = InMemoryBackend::dev();
        wait_for_ready(&backend, Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
    }
}
