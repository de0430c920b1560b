//! Core data types for the provisioning engine.
//!
//! This module defines:
//! - Id newtypes for servers and configs, with a short readable display form
//! - The [`Protocol`] and [`ConfigStatus`] closed enums
//! - The ledger records: [`ServerRecord`] and [`ConfigRecord`]
//! - Inputs and outputs exchanged with the external CRUD layer
//!   ([`NewServer`], [`ConfigSpec`], [`CapacityInfo`])

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque reference to an external user. Owned by the out-of-scope CRUD layer.
pub type OwnerId = Uuid;

/// A unique identifier for a gateway server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(Uuid);

impl ServerId {
    /// Create a new random server ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format like "srv_a1b2c3d4".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("srv_{}", &hex[..8])
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ServerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// A unique identifier for a provisioned config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigId(Uuid);

impl ConfigId {
    /// Create a new random config ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string format like "cfg_a1b2c3d4".
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:032x}", self.0.as_u128());
        format!("cfg_{}", &hex[..8])
    }
}

impl Default for ConfigId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConfigId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Identifier minted by a remote gateway panel for one of its clients.
///
/// Opaque to this engine: the panel chooses the format, we only echo it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteClientId(String);

impl RemoteClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RemoteClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RemoteClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proxy protocol served by a gateway for one client credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    /// The `type` value sent on the panel wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a config.
///
/// `Active` is the only non-terminal state for the automatic jobs:
/// `Active -> Expired` (time-triggered) and `Active -> Disabled`
/// (quota-triggered) are terminal for reconciliation. `PendingDeletion` is
/// entered only through [`crate::provisioner::Provisioner::delete_config`]
/// and exits only by successful completion of the deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Active,
    Expired,
    Disabled,
    PendingDeletion,
}

impl std::fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigStatus::Active => "active",
            ConfigStatus::Expired => "expired",
            ConfigStatus::Disabled => "disabled",
            ConfigStatus::PendingDeletion => "pending_deletion",
        };
        write!(f, "{s}")
    }
}

/// Network location of a gateway's management panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    /// Path prefix the panel is mounted under, e.g. "/panel". Empty for root.
    #[serde(default)]
    pub base_path: String,
    /// Whether the panel is reached over HTTPS.
    #[serde(default)]
    pub use_tls: bool,
}

impl ServerEndpoint {
    /// Base URL for panel requests, without a trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        let path = self.base_path.trim_end_matches('/');
        if path.is_empty() {
            format!("{}://{}:{}", scheme, self.host, self.port)
        } else if path.starts_with('/') {
            format!("{}://{}:{}{}", scheme, self.host, self.port, path)
        } else {
            format!("{}://{}:{}/{}", scheme, self.host, self.port, path)
        }
    }
}

/// Registration request for a gateway server, supplied by the external CRUD
/// layer.
#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub endpoint: ServerEndpoint,
    /// Static panel secret, attached as a header on every request.
    pub api_secret: String,
    pub max_capacity: u32,
    /// Protocols this gateway can host. Empty means all protocols.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

/// A gateway server as tracked by the ledger.
///
/// `current_load` is owned by the provisioning path: it changes only through
/// the ledger's atomic reserve/release operations. `0 <= current_load <=
/// max_capacity` is a soft invariant; races against an externally edited
/// capacity can violate it and the engine tolerates that rather than assuming
/// it away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub endpoint: ServerEndpoint,
    pub api_secret: String,
    pub max_capacity: u32,
    pub current_load: u32,
    pub active: bool,
    pub protocols: Vec<Protocol>,
    /// Bumped on every mutation; used for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Whether this gateway can host the given protocol. An empty protocol
    /// list means the gateway hosts everything.
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.is_empty() || self.protocols.contains(&protocol)
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.current_load < self.max_capacity
    }

    pub fn capacity_info(&self) -> CapacityInfo {
        CapacityInfo {
            max_capacity: self.max_capacity,
            current_load: self.current_load,
            available_capacity: self.max_capacity.saturating_sub(self.current_load),
            is_full: self.current_load >= self.max_capacity,
        }
    }
}

/// Capacity/availability view produced for the external layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityInfo {
    pub max_capacity: u32,
    pub current_load: u32,
    pub available_capacity: u32,
    pub is_full: bool,
}

/// Request to provision a new config, supplied by the external CRUD layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSpec {
    pub protocol: Protocol,
    /// Traffic quota in bytes. None means unlimited.
    pub quota_bytes: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A provisioned proxy credential as tracked by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: ConfigId,
    pub owner_id: OwnerId,
    pub server_id: ServerId,
    /// None until the remote create succeeds.
    pub remote_client_id: Option<RemoteClientId>,
    pub protocol: Protocol,
    /// None means unlimited.
    pub quota_bytes: Option<u64>,
    /// Monotonic counter; the authoritative source is the remote panel.
    pub used_bytes: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ConfigStatus,
    /// Whether the remote client has been revoked (deleted on the gateway)
    /// after an automatic Expired/Disabled transition. Lets the next pass
    /// retry a failed best-effort revocation.
    pub remote_revoked: bool,
    /// Bumped on every mutation; used for optimistic concurrency.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigRecord {
    /// Build the record persisted after a successful remote create.
    pub fn provisioned(
        id: ConfigId,
        owner_id: OwnerId,
        server_id: ServerId,
        remote_client_id: RemoteClientId,
        spec: &ConfigSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            server_id,
            remote_client_id: Some(remote_client_id),
            protocol: spec.protocol,
            quota_bytes: spec.quota_bytes,
            used_bytes: 0,
            expires_at: spec.expires_at,
            status: ConfigStatus::Active,
            remote_revoked: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < now,
            None => false,
        }
    }

    pub fn is_over_quota(&self) -> bool {
        match self.quota_bytes {
            Some(quota) => self.used_bytes >= quota,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_formats() {
        let server_id = ServerId::new();
        let config_id = ConfigId::new();
        assert!(server_id.to_short_string().starts_with("srv_"));
        assert_eq!(server_id.to_short_string().len(), 12);
        assert!(config_id.to_short_string().starts_with("cfg_"));
        assert_eq!(config_id.to_short_string().len(), 12);
    }

    #[test]
    fn test_base_url_variants() {
        let mut endpoint = ServerEndpoint {
            host: "gw1.example.net".to_string(),
            port: 8443,
            base_path: String::new(),
            use_tls: false,
        };
        assert_eq!(endpoint.base_url(), "http://gw1.example.net:8443");

        endpoint.base_path = "/panel/".to_string();
        assert_eq!(endpoint.base_url(), "http://gw1.example.net:8443/panel");

        endpoint.base_path = "panel".to_string();
        endpoint.use_tls = true;
        assert_eq!(endpoint.base_url(), "https://gw1.example.net:8443/panel");
    }

    #[test]
    fn test_protocol_support_defaults_to_all() {
        let now = Utc::now();
        let server = ServerRecord {
            id: ServerId::new(),
            endpoint: ServerEndpoint {
                host: "gw".into(),
                port: 8080,
                base_path: String::new(),
                use_tls: false,
            },
            api_secret: "secret".into(),
            max_capacity: 10,
            current_load: 0,
            active: true,
            protocols: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(server.supports(Protocol::Vless));
        assert!(server.supports(Protocol::Trojan));

        let picky = ServerRecord {
            protocols: vec![Protocol::Vmess],
            ..server
        };
        assert!(picky.supports(Protocol::Vmess));
        assert!(!picky.supports(Protocol::Trojan));
    }

    #[test]
    fn test_quota_and_expiry_predicates() {
        let spec = ConfigSpec {
            protocol: Protocol::Vless,
            quota_bytes: Some(100),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        let mut record = ConfigRecord::provisioned(
            ConfigId::new(),
            Uuid::new_v4(),
            ServerId::new(),
            RemoteClientId::new("rc-1"),
            &spec,
        );
        assert!(record.is_expired(Utc::now()));
        assert!(!record.is_over_quota());

        record.used_bytes = 100;
        assert!(record.is_over_quota());

        record.quota_bytes = None;
        assert!(!record.is_over_quota());
    }

    #[test]
    fn test_capacity_info() {
        let now = Utc::now();
        let server = ServerRecord {
            id: ServerId::new(),
            endpoint: ServerEndpoint {
                host: "gw".into(),
                port: 8080,
                base_path: String::new(),
                use_tls: false,
            },
            api_secret: "secret".into(),
            max_capacity: 5,
            current_load: 5,
            active: true,
            protocols: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let info = server.capacity_info();
        assert_eq!(info.available_capacity, 0);
        assert!(info.is_full);
    }
}
