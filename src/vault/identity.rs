//! Identity entities, entity aliases and the OIDC signing keys and roles
//! behind self-issued JWTs.

use crate::vault::auth::auth_handle_exists;
use crate::vault::common::{call, require_name, require_token, str_field, string_list};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

/// Signing algorithms accepted for named identity keys.
pub const KEY_ALGORITHMS: &[&str] = &["RS256", "RS384", "RS512", "ES256", "ES384", "ES512", "EdDSA"];

/// Creates the entity `name`, or updates its metadata and policies if it
/// exists. Returns the entity id.
pub async fn create_or_update_identity(
    transport: &dyn Transport,
    token: &str,
    name: &str,
    metadata: &HashMap<String, String>,
    policies: &[String],
) -> Result<String, SecretsError> {
    require_token(token)?;
    require_name(name, "identity name")?;

    let body = call(
        transport,
        BackendRequest::post("/v1/identity/entity")
            .with_token(token)
            .with_body(json!({
                "name": name,
                "metadata": metadata,
                "policies": policies,
            })),
    )
    .await?;

    // Updates of an existing entity answer 204 without a body
    match body.pointer("/data/id").and_then(Value::as_str) {
        Some(id) => {
            info!("Created identity '{}'", name);
            Ok(id.to_string())
        }
        None => {
            debug!("Identity '{}' updated in place, looking up its id", name);
            lookup_identity(transport, token, name).await
        }
    }
}

pub async fn delete_identity(
    transport: &dyn Transport,
    token: &str,
    name: &str,
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(name, "identity name")?;
    call(
        transport,
        BackendRequest::delete(format!("/v1/identity/entity/name/{}", name)).with_token(token),
    )
    .await?;
    info!("Deleted identity '{}'", name);
    Ok(())
}

/// Returns the entity id for `name`.
pub async fn lookup_identity(
    transport: &dyn Transport,
    token: &str,
    name: &str,
) -> Result<String, SecretsError> {
    require_token(token)?;
    require_name(name, "identity name")?;
    let body = call(
        transport,
        BackendRequest::get(format!("/v1/identity/entity/name/{}", name)).with_token(token),
    )
    .await?;
    body.pointer("/data/id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SecretsError::NotFound(format!("identity '{}'", name)))
}

async fn identity_exists(
    transport: &dyn Transport,
    token: &str,
    identity_id: &str,
) -> Result<bool, SecretsError> {
    let result = call(
        transport,
        BackendRequest::get(format!("/v1/identity/entity/id/{}", identity_id)).with_token(token),
    )
    .await;
    match result {
        Ok(body) => Ok(body.pointer("/data/id").is_some()),
        Err(SecretsError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Binds `username` of the auth method behind `auth_handle` to the entity
/// `identity_id`, so logins as that user carry the entity.
pub async fn bind_user_to_identity(
    transport: &dyn Transport,
    token: &str,
    identity_id: &str,
    auth_handle: &str,
    username: &str,
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(identity_id, "identity id")?;
    require_name(auth_handle, "auth handle")?;
    require_name(username, "username")?;

    if !auth_handle_exists(transport, token, auth_handle).await? {
        return Err(SecretsError::PreconditionFailed(format!(
            "auth handle '{}' does not belong to an enabled auth method",
            auth_handle
        )));
    }
    if !identity_exists(transport, token, identity_id).await? {
        return Err(SecretsError::PreconditionFailed(format!(
            "identity '{}' does not exist",
            identity_id
        )));
    }

    let result = call(
        transport,
        BackendRequest::post("/v1/identity/entity-alias")
            .with_token(token)
            .with_body(json!({
                "name": username,
                "canonical_id": identity_id,
                "mount_accessor": auth_handle,
            })),
    )
    .await;
    match result {
        Ok(_) => {
            info!("Bound user '{}' to identity {}", username, identity_id);
            Ok(())
        }
        Err(SecretsError::Invalid(reason)) if reason.contains("already") => {
            Err(SecretsError::Conflict(reason))
        }
        Err(e) => Err(e),
    }
}

pub async fn check_identity_key_exists(
    transport: &dyn Transport,
    token: &str,
    key_name: &str,
) -> Result<bool, SecretsError> {
    require_token(token)?;
    require_name(key_name, "key name")?;
    let result = call(
        transport,
        BackendRequest::list("/v1/identity/oidc/key").with_token(token),
    )
    .await;
    match result {
        Ok(body) => Ok(string_list(&body, "/data/keys")
            .iter()
            .any(|key| key == key_name)),
        // Listing an empty key set answers 404
        Err(SecretsError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn create_named_identity_key(
    transport: &dyn Transport,
    token: &str,
    key_name: &str,
    algorithm: &str,
) -> Result<(), SecretsError> {
    if !KEY_ALGORITHMS.contains(&algorithm) {
        return Err(SecretsError::Invalid(format!(
            "unsupported signing algorithm '{}'",
            algorithm
        )));
    }

    if check_identity_key_exists(transport, token, key_name).await? {
        let body = call(
            transport,
            BackendRequest::get(format!("/v1/identity/oidc/key/{}", key_name)).with_token(token),
        )
        .await?;
        let existing = str_field(&body, "/data/algorithm")?;
        if existing == algorithm {
            info!("Identity key '{}' already exists, continuing", key_name);
            return Ok(());
        }
        return Err(SecretsError::Conflict(format!(
            "identity key '{}' exists with algorithm {}, requested {}",
            key_name, existing, algorithm
        )));
    }

    call(
        transport,
        BackendRequest::post(format!("/v1/identity/oidc/key/{}", key_name))
            .with_token(token)
            .with_body(json!({
                "algorithm": algorithm,
                "allowed_client_ids": ["*"],
            })),
    )
    .await?;
    info!("Created identity key '{}' ({})", key_name, algorithm);
    Ok(())
}

/// A role template must be a JSON object, given raw or base64 encoded.
fn validate_template(template: &str) -> Result<(), SecretsError> {
    if template.trim().is_empty() {
        return Ok(());
    }
    let raw = match serde_json::from_str::<Value>(template) {
        Ok(value) => value,
        Err(_) => STANDARD
            .decode(template.trim())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .ok_or_else(|| {
                SecretsError::Invalid("role template is neither JSON nor base64 JSON".to_string())
            })?,
    };
    if !raw.is_object() {
        return Err(SecretsError::Invalid(
            "role template must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

pub async fn create_or_update_identity_role(
    transport: &dyn Transport,
    token: &str,
    role_name: &str,
    key_name: &str,
    template: &str,
    jwt_ttl: &str,
) -> Result<(), SecretsError> {
    require_name(role_name, "role name")?;
    validate_template(template)?;

    if !check_identity_key_exists(transport, token, key_name).await? {
        return Err(SecretsError::PreconditionFailed(format!(
            "identity key '{}' must exist before role '{}' can use it",
            key_name, role_name
        )));
    }

    call(
        transport,
        BackendRequest::post(format!("/v1/identity/oidc/role/{}", role_name))
            .with_token(token)
            .with_body(json!({
                "key": key_name,
                "template": template,
                "ttl": jwt_ttl,
            })),
    )
    .await?;
    info!("Created or updated identity role '{}'", role_name);
    Ok(())
}
