//! Authentication method setup and the username/password service login.

use crate::vault::common::{call, mount_key, require_name, require_token};
use crate::vault::engines::mount_table;
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Auth method type used for service logins.
pub const PASSWORD_AUTH_TYPE: &str = "userpass";

async fn find_auth_mount(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
) -> Result<Option<crate::vault::engines::MountInfo>, SecretsError> {
    let mut mounts = mount_table(transport, token, "/v1/sys/auth").await?;
    Ok(mounts.remove(&mount_key(mount_point)))
}

pub async fn check_auth_method_enabled(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    auth_type: &str,
) -> Result<bool, SecretsError> {
    require_name(mount_point, "mount point")?;
    Ok(find_auth_mount(transport, token, mount_point)
        .await?
        .is_some_and(|mount| mount.engine == auth_type))
}

/// Enables the username/password auth method at `mount_point`.
pub async fn enable_password_auth(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
) -> Result<(), SecretsError> {
    require_name(mount_point, "mount point")?;
    if let Some(existing) = find_auth_mount(transport, token, mount_point).await? {
        if existing.engine == PASSWORD_AUTH_TYPE {
            info!("Password auth already enabled at '{}', continuing", mount_point);
            return Ok(());
        }
        return Err(SecretsError::Conflict(format!(
            "auth mount '{}' is already in use by {}",
            mount_point, existing.engine
        )));
    }

    call(
        transport,
        BackendRequest::post(format!("/v1/sys/auth/{}", mount_point.trim_matches('/')))
            .with_token(token)
            .with_body(json!({ "type": PASSWORD_AUTH_TYPE })),
    )
    .await?;
    info!("Enabled password auth at '{}'", mount_point);
    Ok(())
}

/// Returns the mount accessor ("auth handle") of the auth method at `mount_point`.
pub async fn lookup_auth_handle(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
) -> Result<String, SecretsError> {
    require_name(mount_point, "mount point")?;
    match find_auth_mount(transport, token, mount_point).await? {
        Some(mount) if !mount.accessor.is_empty() => Ok(mount.accessor),
        Some(_) => Err(SecretsError::malformed(format!(
            "auth mount '{}' has no accessor",
            mount_point
        ))),
        None => Err(SecretsError::NotFound(format!(
            "no auth method enabled at '{}'",
            mount_point
        ))),
    }
}

/// Whether `accessor` belongs to any enabled auth method.
pub async fn auth_handle_exists(
    transport: &dyn Transport,
    token: &str,
    accessor: &str,
) -> Result<bool, SecretsError> {
    let mounts = mount_table(transport, token, "/v1/sys/auth").await?;
    Ok(mounts.values().any(|mount| mount.accessor == accessor))
}

pub async fn create_or_update_user(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    username: &str,
    password: &str,
    token_ttl: &str,
    token_policies: &[String],
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(mount_point, "mount point")?;
    require_name(username, "username")?;
    require_name(password, "password")?;

    call(
        transport,
        BackendRequest::post(format!(
            "/v1/auth/{}/users/{}",
            mount_point.trim_matches('/'),
            username
        ))
        .with_token(token)
        .with_body(json!({
            "password": password,
            "token_ttl": token_ttl,
            "token_policies": token_policies,
        })),
    )
    .await?;
    info!("Created or updated user '{}' at '{}'", username, mount_point);
    Ok(())
}

pub async fn delete_user(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    username: &str,
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(mount_point, "mount point")?;
    require_name(username, "username")?;

    call(
        transport,
        BackendRequest::delete(format!(
            "/v1/auth/{}/users/{}",
            mount_point.trim_matches('/'),
            username
        ))
        .with_token(token),
    )
    .await?;
    info!("Deleted user '{}' at '{}'", username, mount_point);
    Ok(())
}

/// Logs a service in with username and password. Returns the `auth`
/// section of the login response, which carries the new `client_token`.
///
/// When `token` is non-empty it is used to confirm the auth mount exists
/// first, so a missing mount is reported as `NotFound`.
pub async fn internal_service_login(
    transport: &dyn Transport,
    token: &str,
    auth_engine: &str,
    username: &str,
    password: &str,
) -> Result<Map<String, Value>, SecretsError> {
    require_name(auth_engine, "auth engine")?;
    require_name(username, "username")?;

    if !token.trim().is_empty() && find_auth_mount(transport, token, auth_engine).await?.is_none() {
        return Err(SecretsError::NotFound(format!(
            "no auth method enabled at '{}'",
            auth_engine
        )));
    }

    let request = BackendRequest::post(format!(
        "/v1/auth/{}/login/{}",
        auth_engine.trim_matches('/'),
        username
    ))
    .with_body(json!({ "password": password }));

    let body = match call(transport, request).await {
        Ok(body) => body,
        // The backend reports bad credentials as a 400
        Err(SecretsError::Invalid(reason)) => {
            debug!("Login for '{}' rejected: {}", username, reason);
            return Err(SecretsError::Unauthorized(format!(
                "login failed for '{}'",
                username
            )));
        }
        Err(e) => return Err(e),
    };

    match body.get("auth") {
        Some(Value::Object(auth)) => {
            info!("Service '{}' logged in via '{}'", username, auth_engine);
            Ok(auth.clone())
        }
        _ => Err(SecretsError::malformed("login response without auth section")),
    }
}
