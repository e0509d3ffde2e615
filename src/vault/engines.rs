//! Policy installation and secrets engine management.
//!
//! Enable operations are idempotent: a mount that already matches the
//! requested configuration is left alone, a mount with a different
//! configuration is a `Conflict`.

use crate::vault::common::{call, mount_key, parse_ttl, require_name, require_token};
use crate::vault::transport::{BackendRequest, Transport};
use crate::vault::SecretsError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

/// A Consul ACL role served by the Consul secrets engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsulRole {
    pub role_name: String,
    /// "client" or "management".
    pub token_type: String,
    pub policies: Vec<String>,
    pub local: bool,
    pub ttl: String,
}

impl ConsulRole {
    pub fn new(role_name: &str, policies: Vec<String>) -> Self {
        Self {
            role_name: role_name.to_string(),
            token_type: "client".to_string(),
            policies,
            local: true,
            ttl: "1h".to_string(),
        }
    }

    fn validate(&self) -> Result<(), SecretsError> {
        require_name(&self.role_name, "consul role name")?;
        match self.token_type.as_str() {
            "client" | "management" => Ok(()),
            other => Err(SecretsError::Invalid(format!(
                "unknown consul token type '{}'",
                other
            ))),
        }
    }
}

/// A row of the `sys/mounts` (or `sys/auth`) table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MountInfo {
    #[serde(rename = "type", default)]
    pub engine: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub options: Option<HashMap<String, String>>,
    #[serde(default)]
    pub config: Option<HashMap<String, Value>>,
}

impl MountInfo {
    /// KV version of the mount; KV mounts without options are version 1.
    pub fn kv_version(&self) -> &str {
        self.options
            .as_ref()
            .and_then(|options| options.get("version"))
            .map(String::as_str)
            .unwrap_or("1")
    }

    fn default_lease_ttl(&self) -> Option<u64> {
        self.config
            .as_ref()
            .and_then(|config| config.get("default_lease_ttl"))
            .and_then(Value::as_u64)
    }
}

/// Reads a mount table (`/v1/sys/mounts` or `/v1/sys/auth`), keyed "name/".
pub async fn mount_table(
    transport: &dyn Transport,
    token: &str,
    table_path: &str,
) -> Result<HashMap<String, MountInfo>, SecretsError> {
    require_token(token)?;
    let body = call(transport, BackendRequest::get(table_path).with_token(token)).await?;
    // Newer backends nest the table under "data" and repeat it at the top level
    let table = match body.get("data") {
        Some(Value::Object(data)) => data.clone(),
        _ => body.as_object().cloned().unwrap_or_default(),
    };

    Ok(table
        .into_iter()
        .filter(|(name, _)| name.ends_with('/'))
        .filter_map(|(name, row)| {
            serde_json::from_value::<MountInfo>(row)
                .ok()
                .map(|info| (name, info))
        })
        .collect())
}

pub async fn find_mount(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
) -> Result<Option<MountInfo>, SecretsError> {
    let mut mounts = mount_table(transport, token, "/v1/sys/mounts").await?;
    Ok(mounts.remove(&mount_key(mount_point)))
}

/// Installs (or replaces) an ACL policy.
pub async fn install_policy(
    transport: &dyn Transport,
    token: &str,
    policy_name: &str,
    policy_document: &str,
) -> Result<(), SecretsError> {
    require_token(token)?;
    require_name(policy_name, "policy name")?;
    require_name(policy_document, "policy document")?;

    call(
        transport,
        BackendRequest::put(format!("/v1/sys/policies/acl/{}", policy_name))
            .with_token(token)
            .with_body(json!({ "policy": policy_document })),
    )
    .await?;
    info!("Installed policy '{}'", policy_name);
    Ok(())
}

pub async fn check_secret_engine_installed(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    engine: &str,
) -> Result<bool, SecretsError> {
    require_name(mount_point, "mount point")?;
    Ok(find_mount(transport, token, mount_point)
        .await?
        .is_some_and(|mount| mount.engine == engine))
}

pub async fn enable_kv_secret_engine(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    kv_version: &str,
) -> Result<(), SecretsError> {
    require_name(mount_point, "mount point")?;
    if kv_version != "1" && kv_version != "2" {
        return Err(SecretsError::Invalid(format!(
            "unsupported kv version '{}'",
            kv_version
        )));
    }

    if let Some(existing) = find_mount(transport, token, mount_point).await? {
        if existing.engine == "kv" && existing.kv_version() == kv_version {
            info!(
                "KV v{} engine already enabled at '{}', continuing",
                kv_version, mount_point
            );
            return Ok(());
        }
        warn!(
            "Mount '{}' already holds a {} v{} engine",
            mount_point,
            existing.engine,
            existing.kv_version()
        );
        return Err(SecretsError::Conflict(format!(
            "mount '{}' is already in use by a {} engine (version {}), requested kv version {}",
            mount_point,
            existing.engine,
            existing.kv_version(),
            kv_version
        )));
    }

    call(
        transport,
        BackendRequest::post(format!("/v1/sys/mounts/{}", mount_point.trim_matches('/')))
            .with_token(token)
            .with_body(json!({
                "type": "kv",
                "options": { "version": kv_version },
            })),
    )
    .await?;
    info!("Enabled KV v{} engine at '{}'", kv_version, mount_point);
    Ok(())
}

pub async fn enable_consul_secret_engine(
    transport: &dyn Transport,
    token: &str,
    mount_point: &str,
    default_lease_ttl: &str,
) -> Result<(), SecretsError> {
    require_name(mount_point, "mount point")?;
    let requested_ttl = parse_ttl(default_lease_ttl).ok_or_else(|| {
        SecretsError::Invalid(format!("invalid default lease ttl '{}'", default_lease_ttl))
    })?;

    if let Some(existing) = find_mount(transport, token, mount_point).await? {
        let ttl_differs = existing
            .default_lease_ttl()
            .is_some_and(|ttl| ttl != 0 && ttl != requested_ttl);
        if existing.engine == "consul" && !ttl_differs {
            info!("Consul engine already enabled at '{}', continuing", mount_point);
            return Ok(());
        }
        return Err(SecretsError::Conflict(format!(
            "mount '{}' is already in use by a {} engine with a different configuration",
            mount_point, existing.engine
        )));
    }

    call(
        transport,
        BackendRequest::post(format!("/v1/sys/mounts/{}", mount_point.trim_matches('/')))
            .with_token(token)
            .with_body(json!({
                "type": "consul",
                "config": { "default_lease_ttl": default_lease_ttl },
            })),
    )
    .await?;
    info!("Enabled Consul engine at '{}'", mount_point);
    Ok(())
}

async fn require_consul_engine(
    transport: &dyn Transport,
    token: &str,
    consul_mount: &str,
) -> Result<(), SecretsError> {
    if !check_secret_engine_installed(transport, token, consul_mount, "consul").await? {
        return Err(SecretsError::PreconditionFailed(format!(
            "consul secrets engine is not enabled at '{}'",
            consul_mount
        )));
    }
    Ok(())
}

/// Points the Consul engine at the Consul agent, using the bootstrap ACL token.
pub async fn configure_consul_access(
    transport: &dyn Transport,
    token: &str,
    consul_mount: &str,
    bootstrap_acl_token: &str,
    consul_host: &str,
    consul_port: u16,
) -> Result<(), SecretsError> {
    require_name(bootstrap_acl_token, "bootstrap ACL token")?;
    require_name(consul_host, "consul host")?;
    require_consul_engine(transport, token, consul_mount).await?;

    call(
        transport,
        BackendRequest::post(format!("/v1/{}/config/access", consul_mount.trim_matches('/')))
            .with_token(token)
            .with_body(json!({
                "address": format!("{}:{}", consul_host, consul_port),
                "token": bootstrap_acl_token,
            })),
    )
    .await?;
    info!("Configured Consul access to {}:{}", consul_host, consul_port);
    Ok(())
}

pub async fn create_role(
    transport: &dyn Transport,
    token: &str,
    consul_mount: &str,
    consul_role: &ConsulRole,
) -> Result<(), SecretsError> {
    consul_role.validate()?;
    require_consul_engine(transport, token, consul_mount).await?;

    call(
        transport,
        BackendRequest::post(format!(
            "/v1/{}/roles/{}",
            consul_mount.trim_matches('/'),
            consul_role.role_name
        ))
        .with_token(token)
        .with_body(json!({
            "token_type": consul_role.token_type,
            "policies": consul_role.policies,
            "local": consul_role.local,
            "ttl": consul_role.ttl,
        })),
    )
    .await?;
    info!("Created Consul role '{}'", consul_role.role_name);
    Ok(())
}
