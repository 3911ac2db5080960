//! HookGuard webhook coordination
//!
//! This crate provides:
//! - WebhookCoordinator: intake, dedup, critical/standard dispatch, retries
//! - WorkerPool: bounded background execution with per-class capacity
//! - OutcomeLedger: append-only processing trail per event
//! - EventHandler: downstream business-service contract
//! - LifecycleManager: probes, heartbeats, health fan-out, reload, sweeps

use thiserror::Error;

use hg_common::HookGuardError;

pub mod coordinator;
pub mod handler;
pub mod ledger;
pub mod lifecycle;
pub mod pool;
pub mod retry;
pub mod shape;

pub use coordinator::{Collaborators, IngestResponse, Processing, WebhookCoordinator};
pub use handler::{EventHandler, HandlerError, HttpEventHandler, LoggingEventHandler};
pub use ledger::{outcome_key, AppendResult, OutcomeLedger};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use pool::{PoolClass, PoolConfig, PoolJob, PoolStats, WorkerPool};
pub use retry::{RetryDecision, RetryPolicy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Worker pool {pool} is at capacity")]
    PoolSaturated { pool: &'static str },
}

impl From<CoordinatorError> for HookGuardError {
    fn from(e: CoordinatorError) -> Self {
        HookGuardError::infrastructure(e.to_string())
    }
}
