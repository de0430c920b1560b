//! Client side of the remote gateway panel REST API.
//!
//! Wire types mirror the panel contract exactly:
//!
//! - `POST   /clients`              `{email, type, limit?, expire?}` -> `{id | client_id}`
//! - `DELETE /clients/{id}`         204/200, 404 = already deleted
//! - `PUT    /clients/{id}/limit`   `{limit: bytes|0}` (0 = unlimited)
//! - `PUT    /clients/{id}/expire`  `{expire: ISO8601|null}`
//! - `GET    /clients/{id}/usage`   -> `{used: bytes}`
//! - `GET    /clients/usage`        -> `{usages: {id: bytes}}`
//! - `GET    /health`               -> `{status: "ok"}`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Protocol, RemoteClientId};

pub mod client;
pub mod transport;

pub use client::GatewayClient;
pub use transport::{HttpResponse, MockTransport, PanelTransport, ReqwestTransport};

/// Body of `POST /clients`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateClientRequest {
    /// Deterministic, caller-chosen identity. Doubles as the idempotency
    /// hint: panels key clients on it, so retrying a create after an
    /// ambiguous failure cannot mint a duplicate.
    pub email: String,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire: Option<DateTime<Utc>>,
}

/// Response to `POST /clients`. Panels disagree on the key name.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateClientResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl CreateClientResponse {
    pub fn remote_id(self) -> Option<RemoteClientId> {
        self.id.or(self.client_id).map(RemoteClientId::new)
    }
}

/// Body of `PUT /clients/{id}/limit`. `limit: 0` means unlimited.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateLimitRequest {
    pub limit: u64,
}

/// Body of `PUT /clients/{id}/expire`. `expire: null` clears the expiry.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateExpiryRequest {
    pub expire: Option<DateTime<Utc>>,
}

/// Response to `GET /clients/{id}/usage`.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageResponse {
    pub used: u64,
}

/// Response to `GET /clients/usage`.
#[derive(Debug, Clone, Deserialize)]
pub struct AllUsageResponse {
    pub usages: HashMap<String, u64>,
}

/// Response to `GET /health`.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
