use thiserror::Error;

use crate::types::{ConfigId, ServerId};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the provisioning engine.
///
/// Every remote failure is classified on construction: [`Error::Network`] is
/// the only retryable class. Authentication rejections abort immediately and
/// should be surfaced as an operational alert rather than retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient transport failure: timeout, connection error, or a 5xx from
    /// the panel. Safe to retry.
    #[error("network error: {message}")]
    Network { message: String },

    /// The panel rejected our credentials (401/403). Never retried.
    #[error("gateway panel rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// The panel does not know the remote client. Treated as success for
    /// delete, as not-found for reads.
    #[error("remote client {remote_id} not found on gateway panel")]
    RemoteNotFound { remote_id: String },

    /// The panel rejected the request for a non-auth, non-404 client reason.
    #[error("gateway panel rejected request (HTTP {status}): {body}")]
    Remote { status: u16, body: String },

    /// No active server has spare capacity. Surfaced to the caller as a
    /// capacity-limit condition, never retried internally.
    #[error("no active gateway server with spare capacity")]
    CapacityExhausted,

    /// A compensating action failed and an orphaned remote client exists.
    /// Must be reported, never swallowed.
    #[error("orphaned remote client {remote_id} on server {server_id}: {reason}")]
    Consistency {
        server_id: ServerId,
        remote_id: String,
        reason: String,
    },

    #[error("server {id} not found")]
    ServerNotFound { id: ServerId },

    #[error("config {id} not found")]
    ConfigNotFound { id: ConfigId },

    /// Unique `(server, remote client)` constraint violation in the ledger.
    #[error("remote client {remote_id} already tracked on server {server_id}")]
    DuplicateRemoteClient { server_id: ServerId, remote_id: String },

    #[error("config {id} already exists")]
    DuplicateConfig { id: ConfigId },

    #[error("invalid server registration: {reason}")]
    InvalidServer { reason: String },

    /// The panel answered with a body this engine cannot interpret.
    #[error("malformed panel response: {message}")]
    Decode { message: String },

    /// Configuration loading/validation failed.
    #[error(transparent)]
    Config(#[from] Box<figment::Error>),
}

impl Error {
    /// Whether the gateway client retry loop may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
