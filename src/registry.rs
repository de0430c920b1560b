//! Server selection and capacity accounting.
//!
//! The registry is a thin view over the ledger. The important call is
//! [`CapacityRegistry::reserve`]: selection and load increment are one atomic
//! ledger operation, so two concurrent provisioning calls can never both take
//! the last slot on a server. [`CapacityRegistry::select_server`] is the
//! read-only preview of the same policy for availability queries.

use std::sync::Arc;

use chrono::Utc;

use crate::config::NamingConfig;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::types::{CapacityInfo, NewServer, Protocol, ServerId, ServerRecord};

pub struct CapacityRegistry<L> {
    ledger: Arc<L>,
    naming: NamingConfig,
}

impl<L> Clone for CapacityRegistry<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            naming: self.naming.clone(),
        }
    }
}

impl<L: Ledger> CapacityRegistry<L> {
    pub fn new(ledger: Arc<L>, naming: NamingConfig) -> Self {
        Self { ledger, naming }
    }

    /// Intake of a server registration from the external CRUD layer.
    pub async fn register_server(&self, new: NewServer) -> Result<ServerRecord> {
        if new.max_capacity == 0 {
            return Err(Error::InvalidServer {
                reason: "max_capacity must be at least 1".to_string(),
            });
        }
        if !self.naming.port_range.contains(new.endpoint.port) {
            return Err(Error::InvalidServer {
                reason: format!(
                    "panel port {} outside allowed range {}-{}",
                    new.endpoint.port, self.naming.port_range.min, self.naming.port_range.max
                ),
            });
        }

        let now = Utc::now();
        let server = ServerRecord {
            id: ServerId::new(),
            endpoint: new.endpoint,
            api_secret: new.api_secret,
            max_capacity: new.max_capacity,
            current_load: 0,
            active: true,
            protocols: new.protocols,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.ledger.insert_server(server.clone()).await?;
        tracing::info!(
            server_id = %server.id,
            host = %server.endpoint.host,
            max_capacity = server.max_capacity,
            "registered gateway server"
        );
        Ok(server)
    }

    pub async fn set_server_active(&self, id: ServerId, active: bool) -> Result<ServerRecord> {
        let server = self.ledger.set_server_active(id, active).await?;
        tracing::info!(server_id = %id, active, "updated server availability");
        Ok(server)
    }

    /// Preview which server would host the next config for this protocol:
    /// least loaded active server with spare capacity, ties broken by lowest
    /// id. Makes no reservation; use [`CapacityRegistry::reserve`] on the
    /// provisioning path.
    pub async fn select_server(&self, protocol: Protocol) -> Result<ServerRecord> {
        let servers = self.ledger.list_servers().await?;
        servers
            .into_iter()
            .filter(|s| s.active && s.supports(protocol) && s.has_spare_capacity())
            .min_by_key(|s| (s.current_load, s.id))
            .ok_or(Error::CapacityExhausted)
    }

    /// Atomically select a server and take one capacity slot on it.
    pub async fn reserve(&self, protocol: Protocol) -> Result<ServerRecord> {
        let server = self.ledger.reserve_server(protocol).await?;
        tracing::debug!(
            server_id = %server.id,
            current_load = server.current_load,
            max_capacity = server.max_capacity,
            "reserved capacity slot"
        );
        Ok(server)
    }

    /// Give one capacity slot back.
    pub async fn release(&self, id: ServerId) -> Result<()> {
        self.ledger.release_server(id).await?;
        tracing::debug!(server_id = %id, "released capacity slot");
        Ok(())
    }

    pub async fn capacity(&self, id: ServerId) -> Result<CapacityInfo> {
        Ok(self.ledger.get_server(id).await?.capacity_info())
    }

    /// Aggregate capacity across all active servers.
    pub async fn fleet_capacity(&self) -> Result<CapacityInfo> {
        let servers = self.ledger.list_servers().await?;
        let mut max_capacity: u32 = 0;
        let mut current_load: u32 = 0;
        for server in servers.iter().filter(|s| s.active) {
            max_capacity = max_capacity.saturating_add(server.max_capacity);
            current_load = current_load.saturating_add(server.current_load);
        }
        Ok(CapacityInfo {
            max_capacity,
            current_load,
            available_capacity: max_capacity.saturating_sub(current_load),
            is_full: current_load >= max_capacity,
        })
    }
}
