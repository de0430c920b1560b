//! The local ledger: authoritative store of server and config records.
//!
//! The trait provides atomic operations for the two contended resources:
//! per-server load counters (reserve/release are single serialized
//! operations, never read-then-write at the call site) and config status
//! transitions (compare-and-set against a record version, so overlapping
//! reconciliation passes cannot double-apply a transition).

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    ConfigId, ConfigRecord, ConfigStatus, Protocol, RemoteClientId, ServerId, ServerRecord,
};

pub mod in_memory;

pub use in_memory::InMemoryLedger;

/// Outcome of an optimistic status transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// The transition was applied; the updated record is returned.
    Applied(ConfigRecord),
    /// Another writer got there first (version or status mismatch). The
    /// caller skips without error.
    Conflict,
    /// The record disappeared between candidate selection and the attempt.
    Missing,
}

/// Outcome of merging one remote usage sample into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMergeOutcome {
    /// The stored counter increased.
    Updated,
    /// The sample was not newer than the stored counter.
    Unchanged,
    /// No matching record, or the record is mid-deletion.
    NoMatch,
}

/// Storage trait for server and config records.
///
/// Implementations must make `reserve_server`/`release_server` and
/// `transition_status` atomic; callers rely on that for capacity accounting
/// and for idempotent reconciliation.
pub trait Ledger: Send + Sync {
    /// Insert a new server record.
    ///
    /// # Errors
    /// - If a server with the same ID already exists
    fn insert_server(&self, server: ServerRecord) -> impl Future<Output = Result<()>> + Send;

    fn get_server(&self, id: ServerId) -> impl Future<Output = Result<ServerRecord>> + Send;

    fn list_servers(&self) -> impl Future<Output = Result<Vec<ServerRecord>>> + Send;

    fn set_server_active(
        &self,
        id: ServerId,
        active: bool,
    ) -> impl Future<Output = Result<ServerRecord>> + Send;

    /// Atomically pick the least-loaded active server that supports the
    /// protocol and has spare capacity, increment its load, and return the
    /// post-reservation snapshot. Ties break toward the lowest server id for
    /// determinism.
    ///
    /// Selection and reservation are one step: two concurrent callers can
    /// never both reserve the last slot on a server.
    ///
    /// # Errors
    /// - `CapacityExhausted` if no server qualifies
    fn reserve_server(
        &self,
        protocol: Protocol,
    ) -> impl Future<Output = Result<ServerRecord>> + Send;

    /// Atomically undo one reservation. Saturates at zero: a decrement on an
    /// already-zero counter is logged as an accounting violation, not
    /// applied.
    fn release_server(&self, id: ServerId) -> impl Future<Output = Result<()>> + Send;

    /// Insert a new config record.
    ///
    /// # Errors
    /// - `DuplicateRemoteClient` if another record already references the
    ///   same `(server, remote client)` pair
    fn insert_config(&self, config: ConfigRecord) -> impl Future<Output = Result<()>> + Send;

    fn get_config(&self, id: ConfigId) -> impl Future<Output = Result<ConfigRecord>> + Send;

    /// Remove a config record, returning it if it existed.
    fn remove_config(
        &self,
        id: ConfigId,
    ) -> impl Future<Output = Result<Option<ConfigRecord>>> + Send;

    /// Compare-and-set status transition. Applies `from -> to` only if the
    /// record still has status `from` and version `expected_version`.
    fn transition_status(
        &self,
        id: ConfigId,
        expected_version: u64,
        from: ConfigStatus,
        to: ConfigStatus,
    ) -> impl Future<Output = Result<TransitionOutcome>> + Send;

    /// Move a record to `PendingDeletion` regardless of its current status,
    /// returning the updated record. Returns None for an unknown id (the
    /// record is already gone; deletion is idempotent). A record already in
    /// `PendingDeletion` is returned unchanged.
    fn mark_pending_deletion(
        &self,
        id: ConfigId,
    ) -> impl Future<Output = Result<Option<ConfigRecord>>> + Send;

    /// Record that the remote client behind an Expired/Disabled record has
    /// been revoked on its gateway.
    fn mark_remote_revoked(&self, id: ConfigId) -> impl Future<Output = Result<()>> + Send;

    fn set_quota(
        &self,
        id: ConfigId,
        quota_bytes: Option<u64>,
    ) -> impl Future<Output = Result<ConfigRecord>> + Send;

    fn set_expiry(
        &self,
        id: ConfigId,
        expires_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<ConfigRecord>> + Send;

    /// Merge a remote usage sample as `max(existing, fetched)` — the stored
    /// counter never regresses. Records mid-deletion are left alone.
    fn merge_usage(
        &self,
        server_id: ServerId,
        remote_id: &RemoteClientId,
        used_bytes: u64,
    ) -> impl Future<Output = Result<UsageMergeOutcome>> + Send;

    /// Active records whose expiry is strictly before `now`.
    fn expired_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConfigRecord>>> + Send;

    /// Active records with a quota that their usage has met or passed.
    fn over_quota_candidates(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConfigRecord>>> + Send;

    /// Records in the given terminal status whose remote client has not yet
    /// been revoked; the revocation backlog for best-effort retry.
    fn unrevoked_candidates(
        &self,
        status: ConfigStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConfigRecord>>> + Send;

    /// Records stuck in `PendingDeletion`, for the deletion retry pass.
    fn pending_deletion_candidates(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ConfigRecord>>> + Send;

    /// All config records for one server.
    fn configs_for_server(
        &self,
        server_id: ServerId,
    ) -> impl Future<Output = Result<Vec<ConfigRecord>>> + Send;
}
