//! Secret path construction.
//!
//! A [`SecretPath`] is the configured mount and base path plus an optional
//! sub path. Separators are canonicized once, here, so no caller ever sees
//! an empty segment.

use crate::vault::{KvVersion, SecretsError};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPath {
    mount: String,
    segments: Vec<String>,
}

impl SecretPath {
    /// Resolves `sub_path` against `mount` and `base_path`.
    pub fn new(mount: &str, base_path: &str, sub_path: &str) -> Result<Self, SecretsError> {
        let mount_segments = split_segments(mount)?;
        if mount_segments.is_empty() {
            return Err(SecretsError::Invalid("mount point must not be empty".into()));
        }

        let mut segments = split_segments(base_path)?;
        segments.extend(split_segments(sub_path)?);

        Ok(Self {
            mount: mount_segments.join("/"),
            segments,
        })
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// The path below the mount, without leading or trailing separators.
    pub fn relative(&self) -> String {
        self.segments.join("/")
    }

    /// API path used to read and write secrets.
    pub fn data_path(&self, version: KvVersion) -> String {
        match version {
            KvVersion::V1 => self.api_path(None),
            KvVersion::V2 => self.api_path(Some("data")),
        }
    }

    /// API path used to list keys.
    pub fn list_path(&self, version: KvVersion) -> String {
        match version {
            KvVersion::V1 => self.api_path(None),
            KvVersion::V2 => self.api_path(Some("metadata")),
        }
    }

    fn api_path(&self, infix: Option<&str>) -> String {
        let mut path = format!("/v1/{}", self.mount);
        if let Some(infix) = infix {
            path.push('/');
            path.push_str(infix);
        }
        if !self.segments.is_empty() {
            path.push('/');
            path.push_str(&self.relative());
        }
        path
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "{}", self.mount)
        } else {
            write!(f, "{}/{}", self.mount, self.relative())
        }
    }
}

fn split_segments(raw: &str) -> Result<Vec<String>, SecretsError> {
    let mut segments = Vec::new();
    for segment in raw.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(SecretsError::Invalid(format!(
                "path '{}' contains a relative segment",
                raw
            )));
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}
