//! HTTP transport abstraction for panel requests.
//!
//! The [`PanelTransport`] trait separates request execution from the
//! classification and retry logic in [`super::GatewayClient`], enabling
//! failure injection in tests without a live panel.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Header carrying the static per-server panel secret.
pub const AUTH_HEADER: &str = "x-api-key";

/// Raw response from a panel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Trait for executing one panel HTTP request.
///
/// Implementations report transport-level failures (timeouts, connection
/// errors) as [`Error::Network`]; HTTP status interpretation belongs to the
/// caller.
#[async_trait]
pub trait PanelTransport: Send + Sync + Clone {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        secret: &str,
        timeout: Duration,
    ) -> Result<HttpResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production transport using a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PanelTransport for ReqwestTransport {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        secret: &str,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let method: reqwest::Method = method.parse().map_err(|_| Error::Decode {
            message: format!("invalid HTTP method '{method}'"),
        })?;

        let mut request = self
            .client
            .request(method, url)
            .timeout(timeout)
            .header(AUTH_HEADER, secret);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request to {url} timed out")
            } else if e.is_connect() {
                format!("connection to {url} failed: {e}")
            } else {
                format!("request to {url} failed: {e}")
            };
            Error::Network { message }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| Error::Network {
            message: format!("failed reading response from {url}: {e}"),
        })?;

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock transport for tests.
///
/// Responses are keyed by "{METHOD} {path}" and consumed in FIFO order, so a
/// script of failures-then-success exercises the retry loop exactly.
#[derive(Clone, Default)]
pub struct MockTransport {
    responses: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of one call made through the mock transport.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
    pub secret: String,
    pub timeout: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for "{METHOD} {path}". Multiple responses for the
    /// same key are returned in the order they were added.
    pub fn add_response(&self, key: &str, response: Result<HttpResponse>) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(response);
    }

    /// Queue a plain `{status, body}` response.
    pub fn add_status(&self, key: &str, status: u16, body: &str) {
        self.add_response(
            key,
            Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
        );
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Path component of a URL, for mock keying.
fn path_of(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(i) => &url[i + 3..],
        None => url,
    };
    match rest.find('/') {
        Some(j) => &rest[j..],
        None => "/",
    }
}

#[async_trait]
impl PanelTransport for MockTransport {
    async fn execute(
        &self,
        method: &str,
        url: &str,
        body: Option<&Value>,
        secret: &str,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        self.calls.lock().push(MockCall {
            method: method.to_string(),
            url: url.to_string(),
            body: body.cloned(),
            secret: secret.to_string(),
            timeout,
        });

        let key = format!("{} {}", method, path_of(url));
        if let Some(queue) = self.responses.lock().get_mut(&key) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        // Fail fast and non-retryably so a missing script shows up as a
        // single clear test failure instead of a retry loop.
        Err(Error::Decode {
            message: format!("no mock response configured for {key}"),
        })
    }
}
