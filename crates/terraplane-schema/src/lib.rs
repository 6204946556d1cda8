//! Identifiers, provisioning records, backend descriptors, and configuration for Terraplane.
//!
//! This crate defines the schema layer shared by every other crate: validated
//! workspace and provisioning identifiers (`WorkspaceId`, `ProvisionId`), the
//! request state machine vocabulary (`ProvisionState`, `FailureKind`), the
//! tracked `ProvisionRequest` record, the per-workspace `BackendDescriptor`, and
//! TOML configuration parsing (`OrchestratorConfig`).

pub mod backend;
pub mod config;
pub mod request;
pub mod state;
pub mod types;

pub use backend::{state_key, BackendDescriptor};
pub use config::{
    parse_config_file, parse_config_str, BackendSection, ConfigError, MetricsSection,
    MetricsSinkKind, OrchestratorConfig, TimeoutSection, ToolSection, DEFAULT_REGION,
};
pub use request::{Failure, PlanSummary, ProvisionRequest, StateChange, StepLog};
pub use state::{FailureKind, ProvisionState, RequestKind};
pub use types::{validate_template_name, validate_workspace_id, ProvisionId, WorkspaceId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid workspace id: {0}")]
    InvalidWorkspaceId(String),
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
}
