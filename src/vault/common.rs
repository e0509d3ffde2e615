//! Common helper functions for backend operations.

use crate::vault::transport::{BackendRequest, BackendResponse, Transport};
use crate::vault::SecretsError;
use serde_json::Value;
use tracing::debug;

/// Extracts the first message of Vault's `{"errors": [..]}` body, or the
/// raw text for non-JSON error pages.
pub fn error_message(body: &Value) -> Option<String> {
    match body {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Object(_) => body
            .get("errors")
            .and_then(|v| v.as_array())
            .and_then(|errors| errors.first())
            .and_then(|msg| msg.as_str())
            .map(|msg| msg.to_string()),
        _ => None,
    }
}

/// Checks the response from the backend. If successful, returns the JSON body;
/// otherwise maps the status onto the error taxonomy.
pub fn check_response(response: BackendResponse, context: &str) -> Result<Value, SecretsError> {
    if response.is_success() {
        return Ok(response.body);
    }

    let status = response.status;
    let message = error_message(&response.body).unwrap_or_else(|| context.to_string());
    debug!("Backend returned {} for {}: {}", status, context, message);

    let err = match status {
        400 if message.contains("already initialized") => SecretsError::AlreadyInitialized,
        400 if message.contains("check-and-set") => SecretsError::Conflict(message),
        400 => SecretsError::Invalid(message),
        401 | 403 => SecretsError::Unauthorized(message),
        404 => SecretsError::NotFound(message),
        409 => SecretsError::Conflict(message),
        412 => SecretsError::PreconditionFailed(message),
        500..=599 => SecretsError::Unreachable(format!("HTTP status {}: {}", status, message)),
        _ => SecretsError::Backend(status, message),
    };
    Err(err)
}

/// Sends a request and checks the response in one step.
pub async fn call(
    transport: &dyn Transport,
    request: BackendRequest,
) -> Result<Value, SecretsError> {
    let context = request.path.clone();
    let response = transport.send(request).await?;
    check_response(response, &context)
}

/// Reads a string at a JSON pointer such as `/data/token`.
pub fn str_field(body: &Value, pointer: &str) -> Result<String, SecretsError> {
    body.pointer(pointer)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| SecretsError::malformed(format!("missing string field {}", pointer)))
}

/// Reads a list of strings at a JSON pointer; a missing field is an empty list.
pub fn string_list(body: &Value, pointer: &str) -> Vec<String> {
    body.pointer(pointer)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Rejects empty admin tokens before they reach the backend.
pub fn require_token(token: &str) -> Result<(), SecretsError> {
    if token.trim().is_empty() {
        return Err(SecretsError::Unauthorized(
            "no secret store token provided".to_string(),
        ));
    }
    Ok(())
}

/// Rejects empty names (mount points, usernames, role names, ...).
pub fn require_name(value: &str, what: &str) -> Result<(), SecretsError> {
    if value.trim().is_empty() {
        return Err(SecretsError::Invalid(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Requires `value` to be a single URL path segment, so it cannot move a
/// request to another endpoint.
pub fn require_segment(value: &str, what: &str) -> Result<(), SecretsError> {
    require_name(value, what)?;
    if value == "." || value == ".." || value.contains(['/', '\\', '?', '#', '%']) {
        return Err(SecretsError::Invalid(format!(
            "{} '{}' is not a single path segment",
            what, value
        )));
    }
    Ok(())
}

/// Normalizes a mount point to the "name/" form used as key in the mount tables.
pub fn mount_key(mount_point: &str) -> String {
    format!("{}/", mount_point.trim_matches('/'))
}

/// Parses a duration string such as "30s", "15m", "1h", "768h" or a plain
/// number of seconds.
pub fn parse_ttl(ttl: &str) -> Option<u64> {
    let ttl = ttl.trim();
    if ttl.is_empty() {
        return None;
    }
    if let Ok(seconds) = ttl.parse::<u64>() {
        return Some(seconds);
    }
    let (split, _) = ttl.char_indices().last()?;
    let (number, unit) = ttl.split_at(split);
    let number: u64 = number.parse().ok()?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    number.checked_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::ErrorKind;
    use serde_json::json;

    fn failing(status: u16, body: Value) -> ErrorKind {
        check_response(BackendResponse::new(status, body), "/v1/test")
            .unwrap_err()
            .kind()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(failing(403, json!({"errors": ["permission denied"]})), ErrorKind::Unauthorized);
        assert_eq!(failing(404, json!({"errors": []})), ErrorKind::NotFound);
        assert_eq!(failing(400, json!({"errors": ["missing key"]})), ErrorKind::Invalid);
        assert_eq!(
            failing(400, json!({"errors": ["Vault is already initialized"]})),
            ErrorKind::AlreadyInitialized
        );
        assert_eq!(
            failing(400, json!({"errors": ["check-and-set parameter did not match the current version"]})),
            ErrorKind::Conflict
        );
        assert_eq!(failing(503, json!({"errors": ["Vault is sealed"]})), ErrorKind::Unreachable);
        assert_eq!(failing(418, json!({})), ErrorKind::Backend);
    }

    #[test]
    fn test_message_falls_back_to_context() {
        let err = check_response(BackendResponse::new(404, json!({"errors": []})), "/v1/secret/x")
            .unwrap_err();
        assert_eq!(err.to_string(), "Not found: /v1/secret/x");
    }

    #[test]
    fn test_field_helpers() {
        let body = json!({"data": {"token": "abc", "keys": ["a", "b", 3]}});
        assert_eq!(str_field(&body, "/data/token").unwrap(), "abc");
        assert!(str_field(&body, "/data/missing").is_err());
        assert_eq!(string_list(&body, "/data/keys"), vec!["a", "b"]);
        assert!(string_list(&body, "/data/none").is_empty());
    }

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("3600"), Some(3600));
        assert_eq!(parse_ttl("30s"), Some(30));
        assert_eq!(parse_ttl("15m"), Some(900));
        assert_eq!(parse_ttl("768h"), Some(768 * 3600));
        assert_eq!(parse_ttl("1w"), None);
        assert_eq!(parse_ttl(""), None);
    }

    #[test]
    fn test_parse_ttl_rejects_overflow() {
        assert_eq!(parse_ttl("10000000000000000h"), None);
        assert_eq!(parse_ttl("300000000000000000d"), None);
        assert_eq!(parse_ttl("5124095576030431h"), Some(5124095576030431 * 3600));
    }

    #[test]
    fn test_require_segment() {
        assert!(require_segment("core-data", "service key").is_ok());
        assert!(require_segment("core.data", "service key").is_ok());
        for bad in ["", "..", ".", "../../sys/mounts", "a/b", "a?list=true", "a%2F..", "a#b"] {
            let err = require_segment(bad, "service key").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Invalid, "{}", bad);
        }
    }

    #[test]
    fn test_mount_key_normalization() {
        assert_eq!(mount_key("secret"), "secret/");
        assert_eq!(mount_key("/consul/"), "consul/");
    }
}
