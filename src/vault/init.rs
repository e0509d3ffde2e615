//! Backend initialization, unsealing and root token regeneration.
//!
//! This module provides the raw operations; `store_client` decides when
//! they are allowed to run.

use crate::vault::common::{call, str_field};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use tracing::{info, warn};

/// Response returned from backend initialization.
#[derive(Clone, Serialize, Deserialize)]
pub struct InitResponse {
    /// Unseal key shares (hex).
    pub keys: Vec<String>,
    /// The same shares in base64.
    #[serde(default)]
    pub keys_base64: Vec<String>,
    /// Root token for the initialized backend.
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &format!("[{} shares]", self.keys.len()))
            .field("root_token", &"[REDACTED]")
            .finish()
    }
}

/// Structure representing the result of an unseal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealProgress {
    pub sealed: bool,
    pub progress: u8,
    #[serde(rename = "t")]
    pub threshold: u8,
}

/// Checks `0 < threshold <= shares`.
pub fn validate_init_params(secret_threshold: u8, secret_shares: u8) -> Result<(), SecretsError> {
    if secret_threshold == 0 || secret_shares == 0 {
        return Err(SecretsError::Invalid(
            "secret threshold and secret shares must be greater than zero".to_string(),
        ));
    }
    if secret_threshold > secret_shares {
        return Err(SecretsError::Invalid(format!(
            "secret threshold {} exceeds secret shares {}",
            secret_threshold, secret_shares
        )));
    }
    Ok(())
}

/// Initializes the backend via `sys/init`.
pub async fn init(
    transport: &dyn Transport,
    secret_threshold: u8,
    secret_shares: u8,
) -> Result<InitResponse, SecretsError> {
    validate_init_params(secret_threshold, secret_shares)?;

    let body = call(
        transport,
        BackendRequest::put("/v1/sys/init").with_body(json!({
            "secret_shares": secret_shares,
            "secret_threshold": secret_threshold,
        })),
    )
    .await?;
    let response: InitResponse = serde_json::from_value(body)?;

    if response.keys.len() != usize::from(secret_shares) {
        warn!(
            "Requested {} key shares but received {}",
            secret_shares,
            response.keys.len()
        );
    }
    info!(
        "Secret store initialized with {} shares, threshold {}",
        response.keys.len(),
        secret_threshold
    );
    Ok(response)
}

/// Decodes an unseal key share given either in hex or in base64.
pub fn decode_share(key: &str) -> Result<Vec<u8>, SecretsError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(SecretsError::Invalid("empty unseal key".to_string()));
    }
    if key.len() % 2 == 0 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(decode_hex(key));
    }
    STANDARD
        .decode(key)
        .or_else(|_| STANDARD_NO_PAD.decode(key))
        .map_err(|_| SecretsError::Invalid("malformed unseal key".to_string()))
}

fn decode_hex(key: &str) -> Vec<u8> {
    key.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0);
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0);
            (hi * 16 + lo) as u8
        })
        .collect()
}

/// Decodes every share and rejects duplicates, both inside `keys` and
/// against shares already accepted in `submitted`.
pub fn validate_shares(
    keys: &[String],
    submitted: &HashSet<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, SecretsError> {
    if keys.is_empty() {
        return Err(SecretsError::Invalid("no unseal keys provided".to_string()));
    }
    let mut seen = HashSet::new();
    let mut decoded = Vec::with_capacity(keys.len());
    for key in keys {
        let share = decode_share(key)?;
        if submitted.contains(&share) || !seen.insert(share.clone()) {
            return Err(SecretsError::Invalid("duplicate unseal key".to_string()));
        }
        decoded.push(share);
    }
    Ok(decoded)
}

/// Submits shares to `sys/unseal` until the backend unseals or the shares
/// run out. Accepted shares are added to `submitted`.
pub async fn unseal(
    transport: &dyn Transport,
    keys: &[String],
    submitted: &mut HashSet<Vec<u8>>,
) -> Result<UnsealProgress, SecretsError> {
    let shares = validate_shares(keys, submitted)?;

    let mut progress = None;
    for (key, share) in keys.iter().zip(shares) {
        let body = call(
            transport,
            BackendRequest::put("/v1/sys/unseal").with_body(json!({ "key": key.trim() })),
        )
        .await?;
        let current: UnsealProgress = serde_json::from_value(body)?;
        submitted.insert(share);
        progress = Some(current);
        if !current.sealed {
            break;
        }
        info!("Unseal progress: {}/{}", current.progress, current.threshold);
    }

    progress.ok_or_else(|| SecretsError::malformed("no unseal response"))
}

/// Regenerates the root token from unseal key shares using the one-time
/// password flow of `sys/generate-root`.
pub async fn regen_root_token(
    transport: &dyn Transport,
    keys: &[String],
) -> Result<String, SecretsError> {
    validate_shares(keys, &HashSet::new())?;

    // Cancel anything left behind by an earlier run
    call(transport, BackendRequest::delete("/v1/sys/generate-root/attempt")).await?;

    let attempt = call(
        transport,
        BackendRequest::put("/v1/sys/generate-root/attempt").with_body(json!({})),
    )
    .await?;
    let otp = str_field(&attempt, "/otp")?;
    let nonce = str_field(&attempt, "/nonce")?;
    let required = attempt
        .get("required")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;

    if keys.len() < required {
        cancel_root_generation(transport).await;
        return Err(SecretsError::Invalid(format!(
            "{} key shares provided but {} are required",
            keys.len(),
            required
        )));
    }

    for key in keys {
        let update = call(
            transport,
            BackendRequest::put("/v1/sys/generate-root/update")
                .with_body(json!({ "key": key.trim(), "nonce": nonce })),
        )
        .await;
        let update = match update {
            Ok(update) => update,
            Err(e) => {
                cancel_root_generation(transport).await;
                return Err(e);
            }
        };

        if update.get("complete").and_then(|v| v.as_bool()) == Some(true) {
            let encoded = str_field(&update, "/encoded_token")?;
            let token = decode_root_token(&encoded, &otp)?;
            info!("Root token regenerated; the previous root token must be treated as revoked");
            return Ok(token);
        }
    }

    cancel_root_generation(transport).await;
    Err(SecretsError::Invalid(
        "root token generation did not complete with the provided shares".to_string(),
    ))
}

async fn cancel_root_generation(transport: &dyn Transport) {
    if let Err(e) = call(transport, BackendRequest::delete("/v1/sys/generate-root/attempt")).await {
        warn!("Failed to cancel root token generation: {}", e);
    }
}

/// Decodes the `encoded_token` of a finished generate-root attempt by
/// XOR-ing it with the attempt's one-time password.
pub fn decode_root_token(encoded: &str, otp: &str) -> Result<String, SecretsError> {
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .map_err(|e| SecretsError::malformed(format!("encoded root token: {}", e)))?;
    if bytes.len() != otp.len() {
        return Err(SecretsError::malformed(format!(
            "encoded root token length {} does not match otp length {}",
            bytes.len(),
            otp.len()
        )));
    }
    let decoded: Vec<u8> = bytes
        .iter()
        .zip(otp.as_bytes())
        .map(|(b, o)| b ^ o)
        .collect();
    String::from_utf8(decoded)
        .map_err(|_| SecretsError::malformed("decoded root token is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::test_utils::InMemoryBackend;
    use crate::vault::ErrorKind;

    #[test]
    fn test_init_param_validation() {
        assert!(validate_init_params(3, 5).is_ok());
        assert!(validate_init_params(1, 1).is_ok());
        assert_eq!(validate_init_params(0, 5).unwrap_err().kind(), ErrorKind::Invalid);
        assert_eq!(validate_init_params(6, 5).unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_share_decoding_accepts_hex_and_base64() {
        assert_eq!(decode_share("0aff").unwrap(), vec![0x0a, 0xff]);
        assert_eq!(decode_share("Cv8=").unwrap(), vec![0x0a, 0xff]);
        assert_eq!(decode_share("%%%").unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_duplicate_shares_across_forms_are_rejected() {
        let keys = vec!["0aff".to_string(), "Cv8=".to_string()];
        let err = validate_shares(&keys, &HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let mut submitted = HashSet::new();
        submitted.insert(vec![0x0a, 0xff]);
        let err = validate_shares(&["Cv8=".to_string()], &submitted).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn test_root_token_decoding() {
        let otp = "abcdefgh";
        let token = "hvs.1234";
        let xored: Vec<u8> = token.bytes().zip(otp.bytes()).map(|(t, o)| t ^ o).collect();
        let encoded = STANDARD_NO_PAD.encode(xored);
        assert_eq!(decode_root_token(&encoded, otp).unwrap(), token);
        assert!(decode_root_token(&encoded, "short").is_err());
    }

    #[tokio::test]
    async fn test_init_returns_requested_shares() {
        let backend = InMemoryBackend::new();
        let response = init(&backend, 3, 5).await.unwrap();
        assert_eq!(response.keys.len(), 5);
        assert_eq!(response.keys_base64.len(), 5);
        assert!(!response.root_token.is_empty());
        assert!(!format!("{:?}", response).contains(&response.root_token));

        let err = init(&backend, 3, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
    }

    #[tokio::test]
    async fn test_unseal_accumulates_across_calls() {
        let backend = InMemoryBackend::new();
        let response = init(&backend, 3, 5).await.unwrap();
        let mut submitted = HashSet::new();

        let first = unseal(&backend, &response.keys_base64[..2], &mut submitted)
            .await
            .unwrap();
        assert!(first.sealed);
        assert_eq!(first.progress, 2);

        let second = unseal(&backend, &response.keys_base64[2..], &mut submitted)
            .await
            .unwrap();
        assert!(!second.sealed);
    }

    #[tokio::test]
    async fn test_unseal_with_unknown_share_is_invalid() {
        let backend = InMemoryBackend::new();
        init(&backend, 2, 3).await.unwrap();
        let bogus = STANDARD.encode([7u8; 32]);
        let err = unseal(&backend, &[bogus], &mut HashSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_regen_root_token() {
        let backend = InMemoryBackend::new();
        let response = init(&backend, 2, 3).await.unwrap();
        unseal(&backend, &response.keys, &mut HashSet::new())
            .await
            .unwrap();

        let err = regen_root_token(&backend, &response.keys[..1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let new_root = regen_root_token(&backend, &response.keys[1..])
            .await
            .unwrap();
        assert_ne!(new_root, response.root_token);
        assert!(backend.is_root_token(&new_root));
        assert!(!backend.is_root_token(&response.root_token));
    }
}
