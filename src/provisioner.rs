//! Provisioning orchestration: create and delete configs across the fleet.
//!
//! `create_config` treats selection and reservation as one atomic step, then
//! talks to the remote panel, then persists. Failure at any point unwinds in
//! reverse: a failed remote create releases the reservation; a failed local
//! persist after a successful remote create issues a compensating remote
//! delete. If the compensation itself fails, the orphaned remote client is
//! surfaced as [`Error::Consistency`] — never silently dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::gateway::{CreateClientRequest, GatewayClient, PanelTransport};
use crate::ledger::Ledger;
use crate::registry::CapacityRegistry;
use crate::types::{ConfigId, ConfigRecord, ConfigSpec, OwnerId, ServerRecord};

/// Outcome of one deletion retry pass over `PendingDeletion` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingDeletionReport {
    pub examined: usize,
    pub deleted: usize,
    pub remote_failures: usize,
}

pub struct Provisioner<L, T> {
    ledger: Arc<L>,
    registry: CapacityRegistry<L>,
    transport: T,
    config: EngineConfig,
}

impl<L: Ledger, T: PanelTransport> Provisioner<L, T> {
    pub fn new(ledger: Arc<L>, transport: T, config: EngineConfig) -> Self {
        let registry = CapacityRegistry::new(ledger.clone(), config.naming.clone());
        Self {
            ledger,
            registry,
            transport,
            config,
        }
    }

    /// The capacity view shared with the external layer.
    pub fn registry(&self) -> &CapacityRegistry<L> {
        &self.registry
    }

    fn client_for(&self, server: &ServerRecord) -> GatewayClient<T> {
        GatewayClient::new(self.transport.clone(), server, self.config.gateway.clone())
    }

    /// Provision a new config for `owner_id`.
    #[tracing::instrument(skip(self, spec), fields(owner_id = %owner_id, protocol = %spec.protocol))]
    pub async fn create_config(&self, owner_id: OwnerId, spec: ConfigSpec) -> Result<ConfigRecord> {
        // Selection + reservation in one atomic step; CapacityExhausted
        // propagates verbatim with no side effects.
        let server = self.registry.reserve(spec.protocol).await?;

        let config_id = ConfigId::new();
        let email = self.config.naming.client_email(config_id);
        let client = self.client_for(&server);

        let request = CreateClientRequest {
            email,
            protocol: spec.protocol,
            limit: spec.quota_bytes,
            expire: spec.expires_at,
        };

        let remote_id = match client.create_client(&request).await {
            Ok(remote_id) => remote_id,
            Err(err) => {
                tracing::warn!(
                    server_id = %server.id,
                    config_id = %config_id,
                    error = %err,
                    "remote create failed, returning reservation"
                );
                self.release_quietly(&server).await;
                return Err(err);
            }
        };

        let record =
            ConfigRecord::provisioned(config_id, owner_id, server.id, remote_id.clone(), &spec);

        if let Err(persist_err) = self.ledger.insert_config(record.clone()).await {
            tracing::warn!(
                server_id = %server.id,
                config_id = %config_id,
                remote_id = %remote_id,
                error = %persist_err,
                "ledger write failed after remote create, compensating"
            );
            return match client.delete_client(&remote_id).await {
                Ok(()) => {
                    self.release_quietly(&server).await;
                    Err(persist_err)
                }
                Err(comp_err) => {
                    // The orphan still occupies a real slot on the gateway,
                    // so the reservation is deliberately not released.
                    Err(Error::Consistency {
                        server_id: server.id,
                        remote_id: remote_id.to_string(),
                        reason: format!(
                            "ledger write failed ({persist_err}) and compensating delete failed ({comp_err})"
                        ),
                    })
                }
            };
        }

        tracing::info!(
            config_id = %record.id,
            server_id = %server.id,
            remote_id = %remote_id,
            "provisioned config"
        );
        Ok(record)
    }

    /// Tear down a config. Safe to invoke repeatedly: an unknown id and an
    /// already-deleted remote client both count as success, and the load
    /// decrement happens at most once.
    #[tracing::instrument(skip(self), fields(config_id = %config_id))]
    pub async fn delete_config(&self, config_id: ConfigId) -> Result<()> {
        let Some(record) = self.ledger.mark_pending_deletion(config_id).await? else {
            tracing::debug!("config already deleted");
            return Ok(());
        };

        self.finish_deletion(&record).await
    }

    /// Steps 2-3 of deletion, shared with the retry pass: remote delete, then
    /// local removal and release. Idempotent.
    async fn finish_deletion(&self, record: &ConfigRecord) -> Result<()> {
        match self.ledger.get_server(record.server_id).await {
            Ok(server) => {
                if let Some(remote_id) = &record.remote_client_id {
                    self.client_for(&server).delete_client(remote_id).await?;
                }
            }
            Err(Error::ServerNotFound { .. }) => {
                // The server was deregistered out from under us; there is no
                // panel left to delete from and no load counter to release.
                tracing::warn!(
                    config_id = %record.id,
                    server_id = %record.server_id,
                    "server gone, removing config record only"
                );
                self.ledger.remove_config(record.id).await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        if self.ledger.remove_config(record.id).await?.is_some() {
            self.registry.release(record.server_id).await?;
            tracing::info!(
                config_id = %record.id,
                server_id = %record.server_id,
                "deleted config"
            );
        }
        Ok(())
    }

    /// Re-drive deletion for records stuck in `PendingDeletion` after an
    /// earlier remote failure. Per-item failures are isolated; the stragglers
    /// stay put for the next invocation.
    pub async fn retry_pending_deletions(&self, limit: usize) -> Result<PendingDeletionReport> {
        let candidates = self.ledger.pending_deletion_candidates(limit).await?;
        let mut report = PendingDeletionReport::default();

        for record in candidates {
            report.examined += 1;
            match self.finish_deletion(&record).await {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    report.remote_failures += 1;
                    tracing::warn!(
                        config_id = %record.id,
                        error = %err,
                        "deletion retry failed, leaving record pending"
                    );
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                deleted = report.deleted,
                remote_failures = report.remote_failures,
                "deletion retry pass finished"
            );
        }
        Ok(report)
    }

    /// Change a config's quota: push to the panel first, persist on success.
    pub async fn update_quota(
        &self,
        config_id: ConfigId,
        quota_bytes: Option<u64>,
    ) -> Result<ConfigRecord> {
        let record = self.ledger.get_config(config_id).await?;
        let server = self.ledger.get_server(record.server_id).await?;
        if let Some(remote_id) = &record.remote_client_id {
            self.client_for(&server)
                .update_limit(remote_id, quota_bytes)
                .await?;
        }
        self.ledger.set_quota(config_id, quota_bytes).await
    }

    /// Change a config's expiry: push to the panel first, persist on success.
    pub async fn update_expiry(
        &self,
        config_id: ConfigId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ConfigRecord> {
        let record = self.ledger.get_config(config_id).await?;
        let server = self.ledger.get_server(record.server_id).await?;
        if let Some(remote_id) = &record.remote_client_id {
            self.client_for(&server)
                .update_expiry(remote_id, expires_at)
                .await?;
        }
        self.ledger.set_expiry(config_id, expires_at).await
    }

    async fn release_quietly(&self, server: &ServerRecord) {
        if let Err(err) = self.registry.release(server.id).await {
            tracing::warn!(
                server_id = %server.id,
                error = %err,
                "failed to release reservation"
            );
        }
    }
}
