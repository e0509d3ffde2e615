//! reqwest based [`Transport`] for the backend's HTTP API.
//!
//! This is the production transport: it adds the token and namespace
//! headers, applies the request timeout and the optional CA bundle, and
//! retries connection failures according to the configured [`RetryPolicy`].

use crate::vault::transport::{BackendRequest, BackendResponse, RequestMethod, Transport};
use crate::vault::{RetryPolicy, SecretConfig, SecretsError};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP transport talking to a single backend address.
pub struct HttpTransport {
    /// Base URL of the backend
    addr: String,
    namespace: Option<String>,
    retry: RetryPolicy,
    /// HTTP client for making requests
    client: Client,
}

impl HttpTransport {
    /// Creates a transport for the address, TLS and retry settings in `config`.
    pub fn new(config: &SecretConfig) -> Result<Self, SecretsError> {
        Self::with_base_url(&config.url(), config)
    }

    /// Like [`HttpTransport::new`] but with an explicit base URL.
    pub fn with_base_url(addr: &str, config: &SecretConfig) -> Result<Self, SecretsError> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(ca_path) = &config.root_ca_cert_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                SecretsError::Invalid(format!("failed to read CA certificate {}: {}", ca_path, e))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                SecretsError::Invalid(format!("invalid CA certificate {}: {}", ca_path, e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().map_err(|e| {
            SecretsError::Unreachable(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            addr: addr.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            retry: config.retry.clone(),
            client,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn build(&self, request: &BackendRequest) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.addr, request.path);
        let mut builder = match request.method {
            RequestMethod::Get => self.client.request(Method::GET, &url),
            RequestMethod::Put => self.client.request(Method::PUT, &url),
            RequestMethod::Post => self.client.request(Method::POST, &url),
            RequestMethod::Delete => self.client.request(Method::DELETE, &url),
            RequestMethod::List => self
                .client
                .request(Method::GET, &url)
                .query(&[("list", "true")]),
        };

        if let Some(token) = &request.token {
            builder = builder.header("X-Vault-Token", token);
        }
        if let Some(namespace) = &self.namespace {
            builder = builder.header("X-Vault-Namespace", namespace);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, SecretsError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;

        let response = loop {
            debug!("{:?} {} (attempt {})", request.method, request.path, attempt);
            match self.build(&request).send().await {
                Ok(response) => break response,
                Err(e) if attempt < attempts => {
                    warn!(
                        "Request to {} failed (attempt {}/{}): {}",
                        request.path, attempt, attempts, e
                    );
                    tokio::time::sleep(self.retry.backoff() * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SecretsError::Unreachable(format!("Request failed: {}", e)));
                }
            }
        };

        let status = response.status();
        // Return an empty JSON object for 204 No Content responses
        if status == StatusCode::NO_CONTENT {
            return Ok(BackendResponse::new(status.as_u16(), json!({})));
        }

        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(e) if status.is_success() => {
                    return Err(SecretsError::malformed(format!(
                        "failed to parse response from {}: {}",
                        request.path, e
                    )))
                }
                // Error pages are not always JSON; keep the text for the message
                Err(_) => Value::String(text),
            }
        };

        Ok(BackendResponse::new(status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::ErrorKind;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer, config: &SecretConfig) -> HttpTransport {
        HttpTransport::with_base_url(&server.uri(), config).unwrap()
    }

    #[tokio::test]
    async fn test_sends_token_and_namespace_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/app"))
            .and(header("X-Vault-Token", "s.app-token"))
            .and(header("X-Vault-Namespace", "edge"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"user": "admin"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = SecretConfig::default().with_namespace("edge");
        let transport = transport_for(&server, &config);
        let response = transport
            .send(BackendRequest::get("/v1/secret/app").with_token("s.app-token"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body["data"]["user"], "admin");
    }

    #[tokio::test]
    async fn test_list_uses_list_query_parameter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/app"))
            .and(query_param("list", "true"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"keys": ["a", "b/"]}})),
            )
            .mount(&server)
            .await;

        let transport = transport_for(&server, &SecretConfig::default());
        let response = transport
            .send(BackendRequest::list("/v1/secret/app"))
            .await
            .unwrap();
        assert_eq!(response.body["data"]["keys"][1], "b/");
    }

    #[tokio::test]
    async fn test_no_content_becomes_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sys/policies/acl/reader"))
            .and(body_json(json!({"policy": "path \"secret/*\" {}"})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let transport = transport_for(&server, &SecretConfig::default());
        let response = transport
            .send(
                BackendRequest::post("/v1/sys/policies/acl/reader")
                    .with_body(json!({"policy": "path \"secret/*\" {}"})),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.body, json!({}));
    }

    #[tokio::test]
    async fn test_error_statuses_are_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/html"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let transport = transport_for(&server, &SecretConfig::default());
        let missing = transport
            .send(BackendRequest::get("/v1/secret/missing"))
            .await
            .unwrap();
        assert_eq!(missing.status, 404);

        let html = transport
            .send(BackendRequest::get("/v1/secret/html"))
            .await
            .unwrap();
        assert_eq!(html.status, 502);
        assert_eq!(html.body, Value::String("<html>bad gateway</html>".into()));
    }

    #[tokio::test]
    async fn test_connection_failure_is_unreachable_after_retries() {
        let config = SecretConfig::default().with_retry(RetryPolicy {
            attempts: 2,
            backoff_ms: 10,
        });
        let transport = HttpTransport::with_base_url("http://127.0.0.1:9", &config).unwrap();
        let err = transport
            .send(BackendRequest::get("/v1/sys/health"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn test_missing_ca_certificate_is_invalid() {
        let config = SecretConfig::default().with_tls("/nonexistent/ca.pem");
        let err = HttpTransport::new(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
