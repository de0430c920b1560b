//! Usage sync: merge true remote usage into the ledger, never regressing.

use tokio::time::Instant;

use crate::error::Result;
use crate::gateway::PanelTransport;
use crate::ledger::{Ledger, UsageMergeOutcome};

use super::JobContext;

/// Outcome of one usage pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsagePassReport {
    pub servers_polled: usize,
    /// Servers whose usage fetch failed; the others still synced.
    pub servers_failed: usize,
    /// Usage samples returned across all polled servers.
    pub clients_reported: usize,
    pub records_updated: usize,
    /// Samples with no matching local record (or one mid-deletion).
    pub records_unmatched: usize,
    pub deadline_hit: bool,
}

pub(crate) async fn run<L: Ledger, T: PanelTransport>(
    ctx: &JobContext<L, T>,
) -> Result<UsagePassReport> {
    let deadline = Instant::now() + ctx.config.reconcile.pass_deadline;
    let mut report = UsagePassReport::default();

    let servers = ctx.ledger.list_servers().await?;
    for server in servers.into_iter().filter(|s| s.active) {
        if Instant::now() >= deadline {
            report.deadline_hit = true;
            tracing::warn!(
                servers_polled = report.servers_polled,
                "usage pass hit its deadline, stopping cleanly"
            );
            break;
        }

        // One batched call per server, never per config
        let usages = match ctx.client_for(&server).get_all_usage().await {
            Ok(usages) => usages,
            Err(err) => {
                report.servers_failed += 1;
                tracing::warn!(
                    server_id = %server.id,
                    error = %err,
                    "usage fetch failed, continuing with remaining servers"
                );
                continue;
            }
        };
        report.servers_polled += 1;

        for (remote_id, used_bytes) in usages {
            report.clients_reported += 1;
            match ctx
                .ledger
                .merge_usage(server.id, &remote_id, used_bytes)
                .await?
            {
                UsageMergeOutcome::Updated => report.records_updated += 1,
                UsageMergeOutcome::Unchanged => {}
                UsageMergeOutcome::NoMatch => {
                    report.records_unmatched += 1;
                    tracing::debug!(
                        server_id = %server.id,
                        remote_id = %remote_id,
                        "usage sample has no matching config record"
                    );
                }
            }
        }
    }

    if report.servers_polled > 0 || report.servers_failed > 0 {
        tracing::info!(
            servers_polled = report.servers_polled,
            servers_failed = report.servers_failed,
            clients_reported = report.clients_reported,
            records_updated = report.records_updated,
            records_unmatched = report.records_unmatched,
            "usage pass finished"
        );
    }
    Ok(report)
}
