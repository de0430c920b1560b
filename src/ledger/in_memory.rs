//! In-memory ledger implementation.
//!
//! Stores all records in memory behind `parking_lot` locks. Suitable for
//! tests and single-process deployments; records are lost on restart. The
//! write-lock sections are what make reserve/release and the status CAS
//! atomic: the selection, the check, and the mutation happen under one
//! guard, never interleaved with another writer.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{
    ConfigId, ConfigRecord, ConfigStatus, Protocol, RemoteClientId, ServerId, ServerRecord,
};

use super::{Ledger, TransitionOutcome, UsageMergeOutcome};

/// In-memory implementation of the [`Ledger`] trait.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    servers: Arc<RwLock<HashMap<ServerId, ServerRecord>>>,
    configs: Arc<RwLock<HashMap<ConfigId, ConfigRecord>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn touch_server(server: &mut ServerRecord) {
    server.version += 1;
    server.updated_at = Utc::now();
}

fn touch_config(config: &mut ConfigRecord) {
    config.version += 1;
    config.updated_at = Utc::now();
}

impl Ledger for InMemoryLedger {
    async fn insert_server(&self, server: ServerRecord) -> Result<()> {
        let mut servers = self.servers.write();
        if servers.contains_key(&server.id) {
            return Err(Error::InvalidServer {
                reason: format!("server {} already registered", server.id),
            });
        }
        servers.insert(server.id, server);
        Ok(())
    }

    async fn get_server(&self, id: ServerId) -> Result<ServerRecord> {
        self.servers
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ServerNotFound { id })
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let mut servers: Vec<ServerRecord> = self.servers.read().values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn set_server_active(&self, id: ServerId, active: bool) -> Result<ServerRecord> {
        let mut servers = self.servers.write();
        let server = servers.get_mut(&id).ok_or(Error::ServerNotFound { id })?;
        if server.active != active {
            server.active = active;
            touch_server(server);
        }
        Ok(server.clone())
    }

    async fn reserve_server(&self, protocol: Protocol) -> Result<ServerRecord> {
        let mut servers = self.servers.write();

        let winner = servers
            .values()
            .filter(|s| s.active && s.supports(protocol) && s.has_spare_capacity())
            .min_by_key(|s| (s.current_load, s.id))
            .map(|s| s.id);

        let Some(id) = winner else {
            return Err(Error::CapacityExhausted);
        };

        // Still under the same write guard, so the slot cannot be taken by
        // a concurrent caller between selection and increment.
        let server = servers.get_mut(&id).ok_or(Error::ServerNotFound { id })?;
        server.current_load += 1;
        touch_server(server);
        Ok(server.clone())
    }

    async fn release_server(&self, id: ServerId) -> Result<()> {
        let mut servers = self.servers.write();
        let server = servers.get_mut(&id).ok_or(Error::ServerNotFound { id })?;
        if server.current_load == 0 {
            // Soft invariant violated somewhere upstream; tolerate, don't wrap.
            tracing::warn!(server_id = %id, "release on a zero load counter, ignoring");
            return Ok(());
        }
        server.current_load -= 1;
        touch_server(server);
        Ok(())
    }

    async fn insert_config(&self, config: ConfigRecord) -> Result<()> {
        let mut configs = self.configs.write();

        if configs.contains_key(&config.id) {
            return Err(Error::DuplicateConfig { id: config.id });
        }

        if let Some(remote_id) = &config.remote_client_id {
            let taken = configs
                .values()
                .any(|c| c.server_id == config.server_id && c.remote_client_id.as_ref() == Some(remote_id));
            if taken {
                return Err(Error::DuplicateRemoteClient {
                    server_id: config.server_id,
                    remote_id: remote_id.to_string(),
                });
            }
        }

        configs.insert(config.id, config);
        Ok(())
    }

    async fn get_config(&self, id: ConfigId) -> Result<ConfigRecord> {
        self.configs
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ConfigNotFound { id })
    }

    async fn remove_config(&self, id: ConfigId) -> Result<Option<ConfigRecord>> {
        Ok(self.configs.write().remove(&id))
    }

    async fn transition_status(
        &self,
        id: ConfigId,
        expected_version: u64,
        from: ConfigStatus,
        to: ConfigStatus,
    ) -> Result<TransitionOutcome> {
        let mut configs = self.configs.write();
        let Some(config) = configs.get_mut(&id) else {
            return Ok(TransitionOutcome::Missing);
        };
        if config.status != from || config.version != expected_version {
            return Ok(TransitionOutcome::Conflict);
        }
        config.status = to;
        touch_config(config);
        Ok(TransitionOutcome::Applied(config.clone()))
    }

    async fn mark_pending_deletion(&self, id: ConfigId) -> Result<Option<ConfigRecord>> {
        let mut configs = self.configs.write();
        let Some(config) = configs.get_mut(&id) else {
            return Ok(None);
        };
        if config.status != ConfigStatus::PendingDeletion {
            config.status = ConfigStatus::PendingDeletion;
            touch_config(config);
        }
        Ok(Some(config.clone()))
    }

    async fn mark_remote_revoked(&self, id: ConfigId) -> Result<()> {
        let mut configs = self.configs.write();
        match configs.get_mut(&id) {
            Some(config) => {
                if !config.remote_revoked {
                    config.remote_revoked = true;
                    touch_config(config);
                }
            }
            None => {
                // Removed while the revocation was in flight; nothing to mark.
                tracing::debug!(config_id = %id, "config gone before revocation could be recorded");
            }
        }
        Ok(())
    }

    async fn set_quota(&self, id: ConfigId, quota_bytes: Option<u64>) -> Result<ConfigRecord> {
        let mut configs = self.configs.write();
        let config = configs.get_mut(&id).ok_or(Error::ConfigNotFound { id })?;
        config.quota_bytes = quota_bytes;
        touch_config(config);
        Ok(config.clone())
    }

    async fn set_expiry(
        &self,
        id: ConfigId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ConfigRecord> {
        let mut configs = self.configs.write();
        let config = configs.get_mut(&id).ok_or(Error::ConfigNotFound { id })?;
        config.expires_at = expires_at;
        touch_config(config);
        Ok(config.clone())
    }

    async fn merge_usage(
        &self,
        server_id: ServerId,
        remote_id: &RemoteClientId,
        used_bytes: u64,
    ) -> Result<UsageMergeOutcome> {
        let mut configs = self.configs.write();
        let matched = configs.values_mut().find(|c| {
            c.server_id == server_id && c.remote_client_id.as_ref() == Some(remote_id)
        });
        let Some(config) = matched else {
            return Ok(UsageMergeOutcome::NoMatch);
        };
        if config.status == ConfigStatus::PendingDeletion {
            return Ok(UsageMergeOutcome::NoMatch);
        }
        if used_bytes > config.used_bytes {
            config.used_bytes = used_bytes;
            touch_config(config);
            Ok(UsageMergeOutcome::Updated)
        } else {
            Ok(UsageMergeOutcome::Unchanged)
        }
    }

    async fn expired_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConfigRecord>> {
        let configs = self.configs.read();
        let mut candidates: Vec<ConfigRecord> = configs
            .values()
            .filter(|c| c.status == ConfigStatus::Active && c.is_expired(now))
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn over_quota_candidates(&self, limit: usize) -> Result<Vec<ConfigRecord>> {
        let configs = self.configs.read();
        let mut candidates: Vec<ConfigRecord> = configs
            .values()
            .filter(|c| c.status == ConfigStatus::Active && c.is_over_quota())
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn unrevoked_candidates(
        &self,
        status: ConfigStatus,
        limit: usize,
    ) -> Result<Vec<ConfigRecord>> {
        let configs = self.configs.read();
        let mut candidates: Vec<ConfigRecord> = configs
            .values()
            .filter(|c| c.status == status && !c.remote_revoked && c.remote_client_id.is_some())
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn pending_deletion_candidates(&self, limit: usize) -> Result<Vec<ConfigRecord>> {
        let configs = self.configs.read();
        let mut candidates: Vec<ConfigRecord> = configs
            .values()
            .filter(|c| c.status == ConfigStatus::PendingDeletion)
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn configs_for_server(&self, server_id: ServerId) -> Result<Vec<ConfigRecord>> {
        let configs = self.configs.read();
        let mut records: Vec<ConfigRecord> = configs
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect();
        records.sort_by_key(|c| c.id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigSpec, ServerEndpoint};
    use uuid::Uuid;

    fn sample_server(max_capacity: u32, current_load: u32) -> ServerRecord {
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
            max_capacity,
            current_load,
            active: true,
            protocols: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_config(server_id: ServerId, remote: &str) -> ConfigRecord {
        let spec = ConfigSpec {
            protocol: Protocol::Vless,
            quota_bytes: None,
            expires_at: None,
        };
        ConfigRecord::provisioned(
            ConfigId::new(),
            Uuid::new_v4(),
            server_id,
            RemoteClientId::new(remote),
            &spec,
        )
    }

    #[tokio::test]
    async fn test_reserve_prefers_least_loaded() {
        let ledger = InMemoryLedger::new();
        let full = sample_server(2, 2);
        let idle = sample_server(5, 0);
        ledger.insert_server(full.clone()).await.unwrap();
        ledger.insert_server(idle.clone()).await.unwrap();

        let reserved = ledger.reserve_server(Protocol::Vless).await.unwrap();
        assert_eq!(reserved.id, idle.id);
        assert_eq!(reserved.current_load, 1);
    }

    #[tokio::test]
    async fn test_reserve_breaks_ties_by_lowest_id() {
        let ledger = InMemoryLedger::new();
        let a = sample_server(5, 1);
        let b = sample_server(5, 1);
        ledger.insert_server(a.clone()).await.unwrap();
        ledger.insert_server(b.clone()).await.unwrap();

        let expected = a.id.min(b.id);
        let reserved = ledger.reserve_server(Protocol::Vless).await.unwrap();
        assert_eq!(reserved.id, expected);
    }

    #[tokio::test]
    async fn test_reserve_skips_inactive_and_unsupported() {
        let ledger = InMemoryLedger::new();
        let mut inactive = sample_server(5, 0);
        inactive.active = false;
        let mut trojan_only = sample_server(5, 0);
        trojan_only.protocols = vec![Protocol::Trojan];
        ledger.insert_server(inactive).await.unwrap();
        ledger.insert_server(trojan_only.clone()).await.unwrap();

        let err = ledger.reserve_server(Protocol::Vless).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExhausted));

        let reserved = ledger.reserve_server(Protocol::Trojan).await.unwrap();
        assert_eq!(reserved.id, trojan_only.id);
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_overshoot() {
        let ledger = Arc::new(InMemoryLedger::new());
        let server = sample_server(3, 0);
        let server_id = server.id;
        ledger.insert_server(server).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve_server(Protocol::Vless).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 3);
        let server = ledger.get_server(server_id).await.unwrap();
        assert_eq!(server.current_load, 3);
    }

    #[tokio::test]
    async fn test_release_saturates_at_zero() {
        let ledger = InMemoryLedger::new();
        let server = sample_server(5, 1);
        let id = server.id;
        ledger.insert_server(server).await.unwrap();

        ledger.release_server(id).await.unwrap();
        // Second release hits zero and is ignored rather than underflowing
        ledger.release_server(id).await.unwrap();
        assert_eq!(ledger.get_server(id).await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_duplicate_remote_client_rejected() {
        let ledger = InMemoryLedger::new();
        let server = sample_server(5, 0);
        let server_id = server.id;
        ledger.insert_server(server).await.unwrap();

        ledger
            .insert_config(sample_config(server_id, "rc-1"))
            .await
            .unwrap();
        let err = ledger
            .insert_config(sample_config(server_id, "rc-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRemoteClient { .. }));

        // Same remote id on a different server is fine
        ledger
            .insert_config(sample_config(ServerId::new(), "rc-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transition_cas_applies_once() {
        let ledger = InMemoryLedger::new();
        let config = sample_config(ServerId::new(), "rc-1");
        let id = config.id;
        let version = config.version;
        ledger.insert_config(config).await.unwrap();

        let first = ledger
            .transition_status(id, version, ConfigStatus::Active, ConfigStatus::Disabled)
            .await
            .unwrap();
        assert!(matches!(first, TransitionOutcome::Applied(_)));

        // Same stale version: the overlapping pass loses and skips
        let second = ledger
            .transition_status(id, version, ConfigStatus::Active, ConfigStatus::Disabled)
            .await
            .unwrap();
        assert!(matches!(second, TransitionOutcome::Conflict));

        let missing = ledger
            .transition_status(
                ConfigId::new(),
                0,
                ConfigStatus::Active,
                ConfigStatus::Expired,
            )
            .await
            .unwrap();
        assert!(matches!(missing, TransitionOutcome::Missing));
    }

    #[tokio::test]
    async fn test_merge_usage_is_monotonic() {
        let ledger = InMemoryLedger::new();
        let config = sample_config(ServerId::new(), "rc-1");
        let server_id = config.server_id;
        let id = config.id;
        ledger.insert_config(config).await.unwrap();
        let remote = RemoteClientId::new("rc-1");

        let outcome = ledger.merge_usage(server_id, &remote, 100).await.unwrap();
        assert_eq!(outcome, UsageMergeOutcome::Updated);

        // A stale lower sample never regresses the counter
        let outcome = ledger.merge_usage(server_id, &remote, 40).await.unwrap();
        assert_eq!(outcome, UsageMergeOutcome::Unchanged);
        assert_eq!(ledger.get_config(id).await.unwrap().used_bytes, 100);

        let outcome = ledger
            .merge_usage(server_id, &RemoteClientId::new("unknown"), 10)
            .await
            .unwrap();
        assert_eq!(outcome, UsageMergeOutcome::NoMatch);
    }

    #[tokio::test]
    async fn test_merge_usage_skips_pending_deletion() {
        let ledger = InMemoryLedger::new();
        let config = sample_config(ServerId::new(), "rc-1");
        let server_id = config.server_id;
        let id = config.id;
        ledger.insert_config(config).await.unwrap();
        ledger.mark_pending_deletion(id).await.unwrap();

        let outcome = ledger
            .merge_usage(server_id, &RemoteClientId::new("rc-1"), 100)
            .await
            .unwrap();
        assert_eq!(outcome, UsageMergeOutcome::NoMatch);
        assert_eq!(ledger.get_config(id).await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn test_candidate_queries_filter_and_bound() {
        let ledger = InMemoryLedger::new();
        let server_id = ServerId::new();

        let mut expired = sample_config(server_id, "rc-expired");
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let mut over_quota = sample_config(server_id, "rc-quota");
        over_quota.quota_bytes = Some(50);
        over_quota.used_bytes = 50;
        let fresh = sample_config(server_id, "rc-fresh");

        ledger.insert_config(expired.clone()).await.unwrap();
        ledger.insert_config(over_quota.clone()).await.unwrap();
        ledger.insert_config(fresh).await.unwrap();

        let now = Utc::now();
        let expired_found = ledger.expired_candidates(now, 10).await.unwrap();
        assert_eq!(expired_found.len(), 1);
        assert_eq!(expired_found[0].id, expired.id);

        let quota_found = ledger.over_quota_candidates(10).await.unwrap();
        assert_eq!(quota_found.len(), 1);
        assert_eq!(quota_found[0].id, over_quota.id);

        assert!(ledger.expired_candidates(now, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_pending_deletion_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let config = sample_config(ServerId::new(), "rc-1");
        let id = config.id;
        ledger.insert_config(config).await.unwrap();

        let first = ledger.mark_pending_deletion(id).await.unwrap().unwrap();
        assert_eq!(first.status, ConfigStatus::PendingDeletion);
        let first_version = first.version;

        let second = ledger.mark_pending_deletion(id).await.unwrap().unwrap();
        assert_eq!(second.status, ConfigStatus::PendingDeletion);
        assert_eq!(second.version, first_version);

        assert!(ledger.mark_pending_deletion(ConfigId::new()).await.unwrap().is_none());
    }
}
