//! The seam between the clients and the backend's HTTP API.
//!
//! A [`Transport`] moves one request to the backend and hands back whatever
//! status and body came back. Mapping statuses onto [`SecretsError`] kinds
//! happens in `common`, so every transport gets the same error semantics.

use crate::vault::SecretsError;
use async_trait::async_trait;
use serde_json::Value;

/// HTTP verbs used by the backend API. `List` is Vault's LIST verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Put,
    Post,
    Delete,
    List,
}

/// One request against the backend API.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: RequestMethod,
    /// Path including the `/v1` prefix, e.g. `/v1/sys/health`.
    pub path: String,
    pub token: Option<String>,
    pub body: Option<Value>,
}

impl BackendRequest {
    pub fn new(method: RequestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            token: None,
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Get, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Put, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Delete, path)
    }

    pub fn list(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::List, path)
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Raw backend answer. 204 responses carry an empty object.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
}

impl BackendResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request. Only a failure to get any answer is an error;
    /// non-2xx statuses come back as a normal response.
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, SecretsError>;
}
