//! Expiry enforcement: `Active` records past their expiry become `Expired`.

use chrono::Utc;
use tokio::time::Instant;

use crate::error::Result;
use crate::gateway::PanelTransport;
use crate::ledger::{Ledger, TransitionOutcome};
use crate::types::ConfigStatus;

use super::{revoke_remote, JobContext};

/// Outcome of one expiry pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryPassReport {
    /// Candidates the pass got to before the deadline.
    pub examined: usize,
    /// Records transitioned to `Expired` by this pass.
    pub expired: usize,
    /// Candidates lost to a concurrent writer and skipped.
    pub conflicts: usize,
    /// Best-effort remote revocations that failed and stay in the backlog.
    pub remote_failures: usize,
    /// Whether the pass stopped early on its deadline.
    pub deadline_hit: bool,
}

pub(crate) async fn run<L: Ledger, T: PanelTransport>(
    ctx: &JobContext<L, T>,
) -> Result<ExpiryPassReport> {
    // Membership is fixed by the clock at pass start: records expiring while
    // the pass runs belong to the next pass.
    let now = Utc::now();
    let deadline = Instant::now() + ctx.config.reconcile.pass_deadline;
    let batch = ctx.config.reconcile.batch_size;
    let mut report = ExpiryPassReport::default();

    // Retry revocations an earlier pass could not complete before taking on
    // new transitions.
    for record in ctx
        .ledger
        .unrevoked_candidates(ConfigStatus::Expired, batch)
        .await?
    {
        if Instant::now() >= deadline {
            report.deadline_hit = true;
            break;
        }
        if !revoke_remote(ctx, &record).await {
            report.remote_failures += 1;
        }
    }

    let candidates = ctx.ledger.expired_candidates(now, batch).await?;
    for candidate in candidates {
        if Instant::now() >= deadline {
            report.deadline_hit = true;
            tracing::warn!(
                examined = report.examined,
                "expiry pass hit its deadline mid-batch, stopping cleanly"
            );
            break;
        }
        report.examined += 1;

        match ctx
            .ledger
            .transition_status(
                candidate.id,
                candidate.version,
                ConfigStatus::Active,
                ConfigStatus::Expired,
            )
            .await?
        {
            TransitionOutcome::Applied(record) => {
                report.expired += 1;
                tracing::info!(
                    config_id = %record.id,
                    server_id = %record.server_id,
                    expires_at = ?record.expires_at,
                    "config expired"
                );
                if !revoke_remote(ctx, &record).await {
                    report.remote_failures += 1;
                }
            }
            TransitionOutcome::Conflict | TransitionOutcome::Missing => {
                report.conflicts += 1;
                tracing::debug!(config_id = %candidate.id, "expiry transition lost a race, skipping");
            }
        }
    }

    if report.examined > 0 || report.remote_failures > 0 {
        tracing::info!(
            examined = report.examined,
            expired = report.expired,
            conflicts = report.conflicts,
            remote_failures = report.remote_failures,
            "expiry pass finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, GatewayConfig, ReconcileConfig};
    use crate::gateway::MockTransport;
    use crate::ledger::InMemoryLedger;
    use crate::reconcile::ReconcileScheduler;
    use crate::types::{
        ConfigId, ConfigRecord, ConfigSpec, Protocol, RemoteClientId, ServerEndpoint, ServerId,
        ServerRecord,
    };
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            gateway: GatewayConfig {
                request_timeout: Duration::from_secs(1),
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                backoff_factor: 2,
                backoff_max: Duration::from_millis(2),
            },
            ..EngineConfig::default()
        }
    }

    fn server() -> ServerRecord {
        let now = Utc::now();
        ServerRecord {
            id: ServerId::new(),
            endpoint: ServerEndpoint {
                host: "gw.example.net".to_string(),
                port: 8443,
                base_path: String::new(),
                use_tls: false,
            },
            api_secret: "secret".to_string(),
            max_capacity: 10,
            current_load: 0,
            active: true,
            protocols: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn config_expiring(
        server_id: ServerId,
        remote: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> ConfigRecord {
        let spec = ConfigSpec {
            protocol: Protocol::Vless,
            quota_bytes: None,
            expires_at,
        };
        ConfigRecord::provisioned(
            ConfigId::new(),
            Uuid::new_v4(),
            server_id,
            RemoteClientId::new(remote),
            &spec,
        )
    }

    async fn scheduler_with(
        config: EngineConfig,
    ) -> (
        Arc<InMemoryLedger>,
        MockTransport,
        ReconcileScheduler<InMemoryLedger, MockTransport>,
        ServerRecord,
    ) {
        let ledger = Arc::new(InMemoryLedger::new());
        let transport = MockTransport::new();
        let srv = server();
        ledger.insert_server(srv.clone()).await.unwrap();
        let scheduler = ReconcileScheduler::new(ledger.clone(), transport.clone(), config);
        (ledger, transport, scheduler, srv)
    }

    #[tokio::test]
    async fn test_expires_all_and_only_past_due_records() {
        let (ledger, transport, scheduler, srv) = scheduler_with(fast_config()).await;

        let past = Utc::now() - ChronoDuration::hours(1);
        let future = Utc::now() + ChronoDuration::hours(1);
        let due = config_expiring(srv.id, "rc-due", Some(past));
        let fresh = config_expiring(srv.id, "rc-fresh", Some(future));
        let unlimited = config_expiring(srv.id, "rc-forever", None);
        ledger.insert_config(due.clone()).await.unwrap();
        ledger.insert_config(fresh.clone()).await.unwrap();
        ledger.insert_config(unlimited.clone()).await.unwrap();

        transport.add_status("DELETE /clients/rc-due", 204, "");

        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.remote_failures, 0);

        assert_eq!(
            ledger.get_config(due.id).await.unwrap().status,
            ConfigStatus::Expired
        );
        assert!(ledger.get_config(due.id).await.unwrap().remote_revoked);
        assert_eq!(
            ledger.get_config(fresh.id).await.unwrap().status,
            ConfigStatus::Active
        );
        assert_eq!(
            ledger.get_config(unlimited.id).await.unwrap().status,
            ConfigStatus::Active
        );

        // Idempotent: a second pass finds nothing to do
        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn test_pending_deletion_records_are_skipped() {
        let (ledger, _transport, scheduler, srv) = scheduler_with(fast_config()).await;

        let past = Utc::now() - ChronoDuration::hours(1);
        let parked = config_expiring(srv.id, "rc-parked", Some(past));
        ledger.insert_config(parked.clone()).await.unwrap();
        ledger.mark_pending_deletion(parked.id).await.unwrap();

        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            ledger.get_config(parked.id).await.unwrap().status,
            ConfigStatus::PendingDeletion
        );
    }

    #[tokio::test]
    async fn test_remote_failure_is_logged_and_retried_next_pass() {
        let (ledger, transport, scheduler, srv) = scheduler_with(fast_config()).await;

        let past = Utc::now() - ChronoDuration::hours(1);
        let due = config_expiring(srv.id, "rc-due", Some(past));
        ledger.insert_config(due.clone()).await.unwrap();

        // Both attempts of the best-effort delete fail
        transport.add_status("DELETE /clients/rc-due", 500, "err");
        transport.add_status("DELETE /clients/rc-due", 500, "err");

        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.remote_failures, 1);

        // Local status is authoritative despite the remote failure
        let stored = ledger.get_config(due.id).await.unwrap();
        assert_eq!(stored.status, ConfigStatus::Expired);
        assert!(!stored.remote_revoked);

        // Next pass retries the revocation from the backlog and succeeds
        transport.add_status("DELETE /clients/rc-due", 204, "");
        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.remote_failures, 0);
        assert!(ledger.get_config(due.id).await.unwrap().remote_revoked);
    }

    #[tokio::test]
    async fn test_zero_deadline_stops_cleanly() {
        let config = EngineConfig {
            reconcile: ReconcileConfig {
                pass_deadline: Duration::ZERO,
                ..ReconcileConfig::default()
            },
            ..fast_config()
        };
        let (ledger, _transport, scheduler, srv) = scheduler_with(config).await;

        let past = Utc::now() - ChronoDuration::hours(1);
        let due = config_expiring(srv.id, "rc-due", Some(past));
        ledger.insert_config(due.clone()).await.unwrap();

        let report = scheduler.run_expiry_pass().await.unwrap();
        assert!(report.deadline_hit);
        assert_eq!(report.expired, 0);
        assert_eq!(
            ledger.get_config(due.id).await.unwrap().status,
            ConfigStatus::Active
        );
    }

    #[tokio::test]
    async fn test_batch_size_bounds_one_pass() {
        let config = EngineConfig {
            reconcile: ReconcileConfig {
                batch_size: 2,
                ..ReconcileConfig::default()
            },
            ..fast_config()
        };
        let (ledger, transport, scheduler, srv) = scheduler_with(config).await;

        let past = Utc::now() - ChronoDuration::hours(1);
        for i in 0..5 {
            let record = config_expiring(srv.id, &format!("rc-{i}"), Some(past));
            ledger.insert_config(record).await.unwrap();
            transport.add_status(&format!("DELETE /clients/rc-{i}"), 204, "");
        }

        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.expired, 2);

        // Later passes drain the rest
        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.expired, 2);
        let report = scheduler.run_expiry_pass().await.unwrap();
        assert_eq!(report.expired, 1);
    }
}
