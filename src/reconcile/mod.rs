//! Periodic reconciliation of the ledger against policy and remote truth.
//!
//! Three independent, idempotent jobs:
//!
//! - [`expiry`]: `Active` records past their expiry become `Expired`
//! - [`quota`]: `Active` records at/over quota become `Disabled`
//! - [`usage`]: remote usage counters merge into the ledger, never regressing
//!
//! Each pass iterates a bounded batch under an overall deadline and isolates
//! per-item/per-server failures: one bad record or one unreachable gateway
//! never aborts the run. Status transitions go through the ledger's
//! compare-and-set, so overlapping passes cannot double-apply; the loser
//! just skips. The scheduler below drives the jobs on independent timers,
//! but every pass is also a public method an external scheduler can call.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::gateway::{GatewayClient, PanelTransport};
use crate::ledger::Ledger;
use crate::types::{ConfigRecord, ServerRecord};

pub mod expiry;
pub mod quota;
pub mod usage;

pub use expiry::ExpiryPassReport;
pub use quota::QuotaPassReport;
pub use usage::UsagePassReport;

/// Shared state handed to each job run.
pub(crate) struct JobContext<L, T> {
    pub ledger: Arc<L>,
    pub transport: T,
    pub config: EngineConfig,
}

impl<L: Ledger, T: PanelTransport> JobContext<L, T> {
    pub fn client_for(&self, server: &ServerRecord) -> GatewayClient<T> {
        GatewayClient::new(self.transport.clone(), server, self.config.gateway.clone())
    }
}

/// Best-effort removal of a record's remote client after a terminal status
/// transition. Returns true when the gateway no longer has the client (or
/// never could have it). A false return leaves the record in the revocation
/// backlog for the next pass; the local status is already authoritative, so
/// this is logged, not escalated.
pub(crate) async fn revoke_remote<L: Ledger, T: PanelTransport>(
    ctx: &JobContext<L, T>,
    record: &ConfigRecord,
) -> bool {
    let Some(remote_id) = &record.remote_client_id else {
        // Nothing was ever created remotely
        let _ = ctx.ledger.mark_remote_revoked(record.id).await;
        return true;
    };

    let server = match ctx.ledger.get_server(record.server_id).await {
        Ok(server) => server,
        Err(Error::ServerNotFound { .. }) => {
            tracing::warn!(
                config_id = %record.id,
                server_id = %record.server_id,
                "server gone, nothing left to revoke"
            );
            let _ = ctx.ledger.mark_remote_revoked(record.id).await;
            return true;
        }
        Err(err) => {
            tracing::warn!(config_id = %record.id, error = %err, "failed to load server for revocation");
            return false;
        }
    };

    match ctx.client_for(&server).delete_client(remote_id).await {
        Ok(()) => {
            if let Err(err) = ctx.ledger.mark_remote_revoked(record.id).await {
                tracing::warn!(config_id = %record.id, error = %err, "failed to record revocation");
            }
            true
        }
        Err(err) => {
            tracing::warn!(
                config_id = %record.id,
                server_id = %server.id,
                remote_id = %remote_id,
                error = %err,
                "best-effort remote revocation failed, will retry next pass"
            );
            false
        }
    }
}

/// Drives the three reconciliation jobs on independent timers.
pub struct ReconcileScheduler<L, T> {
    ctx: JobContext<L, T>,
}

impl<L, T> ReconcileScheduler<L, T>
where
    L: Ledger + Send + Sync + 'static,
    T: PanelTransport + 'static,
{
    pub fn new(ledger: Arc<L>, transport: T, config: EngineConfig) -> Self {
        Self {
            ctx: JobContext {
                ledger,
                transport,
                config,
            },
        }
    }

    /// One expiry-enforcement pass. Idempotent.
    pub async fn run_expiry_pass(&self) -> Result<ExpiryPassReport> {
        expiry::run(&self.ctx).await
    }

    /// One quota-enforcement pass. Idempotent.
    pub async fn run_quota_pass(&self) -> Result<QuotaPassReport> {
        quota::run(&self.ctx).await
    }

    /// One usage-sync pass. Idempotent.
    pub async fn run_usage_pass(&self) -> Result<UsagePassReport> {
        usage::run(&self.ctx).await
    }

    /// Run until `shutdown` is cancelled. A failed pass is logged and the
    /// timer keeps going; the next tick retries.
    pub async fn run(self, shutdown: CancellationToken) {
        let reconcile = &self.ctx.config.reconcile;
        let mut expiry_timer = tokio::time::interval(reconcile.expiry_interval);
        let mut quota_timer = tokio::time::interval(reconcile.quota_interval);
        let mut usage_timer = tokio::time::interval(reconcile.usage_interval);
        expiry_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        quota_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        usage_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            expiry_interval = ?reconcile.expiry_interval,
            quota_interval = ?reconcile.quota_interval,
            usage_interval = ?reconcile.usage_interval,
            "reconciliation scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reconciliation scheduler stopping");
                    break;
                }
                _ = expiry_timer.tick() => {
                    if let Err(err) = self.run_expiry_pass().await {
                        tracing::error!(error = %err, "expiry pass failed");
                    }
                }
                _ = quota_timer.tick() => {
                    if let Err(err) = self.run_quota_pass().await {
                        tracing::error!(error = %err, "quota pass failed");
                    }
                }
                _ = usage_timer.tick() => {
                    if let Err(err) = self.run_usage_pass().await {
                        tracing::error!(error = %err, "usage pass failed");
                    }
                }
            }
        }
    }

    /// Spawn the scheduler as a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }
}
