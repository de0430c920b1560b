//! Provisioning and reconciliation engine for fleets of proxy gateway servers.
//!
//! Each gateway runs an independently-owned management panel with a REST API
//! for client credentials. This crate is the core that:
//! - picks which gateway hosts a new config under a strict capacity
//!   constraint (selection and reservation are one atomic step)
//! - talks to each panel through a resilient client (auth, error
//!   classification, bounded exponential-backoff retries)
//! - runs periodic, idempotent reconciliation passes keeping the local
//!   ledger consistent with expiry policy, quota policy, and true remote
//!   usage
//!
//! The surrounding request/response layers (user CRUD, auth, payments, UI)
//! are external collaborators: they call [`Provisioner`] and
//! [`CapacityRegistry`], and feed server registrations and config specs in.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use harbormaster::{
//!     EngineConfig, InMemoryLedger, Provisioner, ReconcileScheduler, ReqwestTransport,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = EngineConfig::load("engine.yaml")?;
//! let ledger = Arc::new(InMemoryLedger::new());
//! let transport = ReqwestTransport::new();
//!
//! let provisioner = Provisioner::new(ledger.clone(), transport.clone(), config.clone());
//! let shutdown = CancellationToken::new();
//! let scheduler = ReconcileScheduler::new(ledger, transport, config);
//! let handle = scheduler.spawn(shutdown.clone());
//!
//! let record = provisioner.create_config(owner_id, spec).await?;
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod provisioner;
pub mod reconcile;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use config::{EngineConfig, GatewayConfig, NamingConfig, PortRange, ReconcileConfig};
pub use error::{Error, Result};
pub use gateway::{GatewayClient, MockTransport, PanelTransport, ReqwestTransport};
pub use ledger::{InMemoryLedger, Ledger, TransitionOutcome, UsageMergeOutcome};
pub use provisioner::{PendingDeletionReport, Provisioner};
pub use reconcile::{ExpiryPassReport, QuotaPassReport, ReconcileScheduler, UsagePassReport};
pub use registry::CapacityRegistry;
pub use types::{
    CapacityInfo, ConfigId, ConfigRecord, ConfigSpec, ConfigStatus, NewServer, OwnerId, Protocol,
    RemoteClientId, ServerEndpoint, ServerId, ServerRecord,
};
