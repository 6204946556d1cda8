//! Provisioning orchestration for Terraplane.
//!
//! This crate ties the workspace store, template materializer, and tool
//! executor together into the `Orchestrator`: the API for accepting
//! provision and destroy requests, running them on per-request workers
//! through the lifecycle state machine, cancelling them, and answering
//! status queries. It also provides outcome metrics and Ctrl-C handling.

pub mod concurrency;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use lifecycle::validate_transition;
pub use metrics::{
    HttpSink, LogSink, Metric, MetricUnit, MetricsEmitter, MetricsError, MetricsSink, NullSink,
    ProvisionOutcome,
};
pub use orchestrator::{DestroyInput, ExecutorContext, Orchestrator, ProvisionInput, ProvisionTicket};

use terraplane_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Schema(#[from] terraplane_schema::SchemaError),
    #[error("configuration error: {0}")]
    Config(#[from] terraplane_schema::ConfigError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] terraplane_runtime::RuntimeError),
    #[error("workspace '{workspace_id}' is busy (held by {holder})")]
    Busy {
        workspace_id: String,
        holder: String,
    },
    #[error("provisioning request not found: {0}")]
    RequestNotFound(String),
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Conflicts the caller may retry once the workspace is free.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoreError::Busy { .. })
    }

    /// Errors caused by the caller's input rather than by the orchestrator.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, CoreError::Schema(_) | CoreError::InvalidInput(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::RequestNotFound(_) | CoreError::WorkspaceNotFound(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy {
                workspace_id,
                holder,
            } => CoreError::Busy {
                workspace_id,
                holder,
            },
            StoreError::RequestNotFound(id) => CoreError::RequestNotFound(id),
            StoreError::WorkspaceNotFound(id) => CoreError::WorkspaceNotFound(id),
            other => CoreError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_busy_maps_to_retriable_conflict() {
        let e: CoreError = StoreError::Busy {
            workspace_id: "dev-2".to_owned(),
            holder: "prov-dev-2-0000abcd".to_owned(),
        }
        .into();
        assert!(e.is_retriable());
        assert!(!e.is_not_found());
    }

    #[test]
    fn store_not_found_maps_to_not_found() {
        let e: CoreError = StoreError::RequestNotFound("prov-x".to_owned()).into();
        assert!(e.is_not_found());
        let e: CoreError = StoreError::WorkspaceNotFound("x".to_owned()).into();
        assert!(e.is_not_found());
        assert!(!e.is_retriable());
    }
}
