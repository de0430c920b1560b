//! Resilient client for one gateway's management panel.
//!
//! Every operation classifies failures before anything else happens:
//! timeouts, connection errors and 5xx are retryable; 401/403 are fatal auth
//! rejections; any other 4xx is a fatal remote rejection; 404 becomes
//! [`Error::RemoteNotFound`] where the remote client identity is known.
//! Retryable failures go through a bounded exponential-backoff loop — an
//! explicit attempt counter, so retry exhaustion is a normal return value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::types::{RemoteClientId, ServerId, ServerRecord};

use super::transport::{HttpResponse, PanelTransport};
use super::{
    AllUsageResponse, CreateClientRequest, CreateClientResponse, HealthResponse,
    UpdateExpiryRequest, UpdateLimitRequest, UsageResponse,
};

pub struct GatewayClient<T> {
    transport: T,
    server_id: ServerId,
    base_url: String,
    secret: String,
    config: GatewayConfig,
}

impl<T: PanelTransport> GatewayClient<T> {
    /// Bind a client to one server's panel.
    pub fn new(transport: T, server: &ServerRecord, config: GatewayConfig) -> Self {
        Self {
            transport,
            server_id: server.id,
            base_url: server.endpoint.base_url(),
            secret: server.api_secret.clone(),
            config,
        }
    }

    /// Create a remote client. The email inside `request` is deterministic
    /// per config, which is what makes this safe to retry after an ambiguous
    /// prior failure.
    pub async fn create_client(&self, request: &CreateClientRequest) -> Result<RemoteClientId> {
        let body = serde_json::to_value(request).map_err(|e| Error::Decode {
            message: format!("failed to encode create request: {e}"),
        })?;
        let response = self.request("POST", "/clients", Some(body), None).await?;
        let parsed: CreateClientResponse = decode(&response.body)?;
        parsed.remote_id().ok_or_else(|| Error::Decode {
            message: "panel returned neither 'id' nor 'client_id'".to_string(),
        })
    }

    /// Delete a remote client. A 404 means the client is already gone and is
    /// treated as success.
    pub async fn delete_client(&self, remote_id: &RemoteClientId) -> Result<()> {
        let path = format!("/clients/{remote_id}");
        match self
            .request("DELETE", &path, None, Some(remote_id.as_str()))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::RemoteNotFound { .. }) => {
                tracing::debug!(
                    server_id = %self.server_id,
                    remote_id = %remote_id,
                    "remote client already absent on delete"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Set the traffic limit. None maps to the panel's 0 = unlimited.
    pub async fn update_limit(
        &self,
        remote_id: &RemoteClientId,
        quota_bytes: Option<u64>,
    ) -> Result<()> {
        let path = format!("/clients/{remote_id}/limit");
        let body = serde_json::to_value(UpdateLimitRequest {
            limit: quota_bytes.unwrap_or(0),
        })
        .map_err(|e| Error::Decode {
            message: format!("failed to encode limit request: {e}"),
        })?;
        self.request("PUT", &path, Some(body), Some(remote_id.as_str()))
            .await?;
        Ok(())
    }

    /// Set or clear the expiry timestamp.
    pub async fn update_expiry(
        &self,
        remote_id: &RemoteClientId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let path = format!("/clients/{remote_id}/expire");
        let body = serde_json::to_value(UpdateExpiryRequest { expire: expires_at }).map_err(|e| {
            Error::Decode {
                message: format!("failed to encode expiry request: {e}"),
            }
        })?;
        self.request("PUT", &path, Some(body), Some(remote_id.as_str()))
            .await?;
        Ok(())
    }

    /// Fetch the usage counter for one remote client.
    pub async fn get_usage(&self, remote_id: &RemoteClientId) -> Result<u64> {
        let path = format!("/clients/{remote_id}/usage");
        let response = self
            .request("GET", &path, None, Some(remote_id.as_str()))
            .await?;
        let parsed: UsageResponse = decode(&response.body)?;
        Ok(parsed.used)
    }

    /// Fetch usage counters for every client on this gateway in one call.
    pub async fn get_all_usage(&self) -> Result<HashMap<RemoteClientId, u64>> {
        let response = self.request("GET", "/clients/usage", None, None).await?;
        let parsed: AllUsageResponse = decode(&response.body)?;
        Ok(parsed
            .usages
            .into_iter()
            .map(|(id, used)| (RemoteClientId::new(id), used))
            .collect())
    }

    /// Liveness probe. Single attempt — retrying would mask the flakiness the
    /// probe exists to report.
    pub async fn health_check(&self) -> Result<bool> {
        let response = self.attempt("GET", "/health", None, None).await?;
        let parsed: HealthResponse = decode(&response.body)?;
        Ok(parsed.status == "ok")
    }

    /// Bounded retry loop around [`GatewayClient::attempt`]. Only retryable
    /// failures consume further attempts.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        remote_id: Option<&str>,
    ) -> Result<HttpResponse> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(method, path, body.as_ref(), remote_id).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    tracing::warn!(
                        server_id = %self.server_id,
                        method,
                        path,
                        attempt = attempt + 1,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "panel request failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if matches!(err, Error::Auth { .. }) {
                        tracing::error!(
                            server_id = %self.server_id,
                            error = %err,
                            "panel rejected credentials; operator attention required"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    /// One classified request attempt.
    async fn attempt(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        remote_id: Option<&str>,
    ) -> Result<HttpResponse> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .transport
            .execute(method, &url, body, &self.secret, self.config.request_timeout)
            .await?;
        classify(response, remote_id)
    }
}

/// Map an HTTP status onto the engine's failure taxonomy.
fn classify(response: HttpResponse, remote_id: Option<&str>) -> Result<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(Error::Auth {
            status: response.status,
        }),
        404 => match remote_id {
            Some(remote_id) => Err(Error::RemoteNotFound {
                remote_id: remote_id.to_string(),
            }),
            None => Err(Error::Remote {
                status: 404,
                body: response.body,
            }),
        },
        500..=599 => Err(Error::Network {
            message: format!("HTTP {} from panel", response.status),
        }),
        status => Err(Error::Remote {
            status,
            body: response.body,
        }),
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Decode {
        message: format!("{e}; body: {body}"),
    })
}
