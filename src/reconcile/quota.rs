//! Quota enforcement: `Active` records at or over quota become `Disabled`.

use tokio::time::Instant;

use crate::error::Result;
use crate::gateway::PanelTransport;
use crate::ledger::{Ledger, TransitionOutcome};
use crate::types::ConfigStatus;

use super::{revoke_remote, JobContext};

/// Outcome of one quota pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaPassReport {
    pub examined: usize,
    /// Records transitioned to `Disabled` by this pass.
    pub disabled: usize,
    /// Candidates lost to a concurrent writer and skipped.
    pub conflicts: usize,
    pub remote_failures: usize,
    pub deadline_hit: bool,
}

pub(crate) async fn run<L: Ledger, T: PanelTransport>(
    ctx: &JobContext<L, T>,
) -> Result<QuotaPassReport> {
    let deadline = Instant::now() + ctx.config.reconcile.pass_deadline;
    let batch = ctx.config.reconcile.batch_size;
    let mut report = QuotaPassReport::default();

    for record in ctx
        .ledger
        .unrevoked_candidates(ConfigStatus::Disabled, batch)
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

    let candidates = ctx.ledger.over_quota_candidates(batch).await?;
    for candidate in candidates {
        if Instant::now() >= deadline {
            report.deadline_hit = true;
            tracing::warn!(
                examined = report.examined,
                "quota pass hit its deadline mid-batch, stopping cleanly"
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
                ConfigStatus::Disabled,
            )
            .await?
        {
            TransitionOutcome::Applied(record) => {
                report.disabled += 1;
                tracing::info!(
                    config_id = %record.id,
                    server_id = %record.server_id,
                    used_bytes = record.used_bytes,
                    quota_bytes = ?record.quota_bytes,
                    "config disabled for quota"
                );
                if !revoke_remote(ctx, &record).await {
                    report.remote_failures += 1;
                }
            }
            TransitionOutcome::Conflict | TransitionOutcome::Missing => {
                report.conflicts += 1;
                tracing::debug!(config_id = %candidate.id, "quota transition lost a race, skipping");
            }
        }
    }

    if report.examined > 0 || report.remote_failures > 0 {
        tracing::info!(
            examined = report.examined,
            disabled = report.disabled,
            conflicts = report.conflicts,
            remote_failures = report.remote_failures,
            "quota pass finished"
        );
    }
    Ok(report)
}
