//! Reqwest HTTP Transport
//!
//! Implements the `HttpTransport` port on a shared `reqwest::Client`.
//! Non-2xx responses are returned as responses, not errors; only transport
//! failures (DNS, connect, timeout) become `Error::Remote`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use tracing::{debug, instrument};

use crate::domain::ports::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{Error, Result};

/// HTTP transport backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Config(format!("Invalid HTTP method {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::remote("http", e.to_string()))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::remote("http", e.to_string()))?;

        debug!(status, bytes = body.len(), "HTTP response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_transport_builds() {
        assert!(ReqwestTransport::new(Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_method_is_config_error() {
        let transport = ReqwestTransport::new(Duration::from_secs(1)).unwrap();
        let mut request = HttpRequest::get("http://127.0.0.1:9/");
        request.method = "BAD METHOD".into();
        assert_matches!(transport.send(&request).await, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_remote_error() {
        let transport = ReqwestTransport::new(Duration::from_millis(500)).unwrap();
        // Port 9 (discard) on loopback is closed in test environments
        let result = transport.send(&HttpRequest::get("http://127.0.0.1:9/")).await;
        assert_matches!(result, Err(Error::Remote { .. }));
    }
}
