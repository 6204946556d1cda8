use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a provisioning request.
///
/// Provision requests walk `Pending → Initializing → Planning → Applying →
/// Completed`; destroy requests walk `Pending → Destroying → Destroyed`.
/// Either may drop to `Failed` from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Pending,
    Initializing,
    Planning,
    Applying,
    Completed,
    Destroying,
    Destroyed,
    Failed,
}

impl ProvisionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProvisionState::Completed | ProvisionState::Destroyed | ProvisionState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionState::Pending => "pending",
            ProvisionState::Initializing => "initializing",
            ProvisionState::Planning => "planning",
            ProvisionState::Applying => "applying",
            ProvisionState::Completed => "completed",
            ProvisionState::Destroying => "destroying",
            ProvisionState::Destroyed => "destroyed",
            ProvisionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification attached to a `Failed` request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FailureKind {
    MaterializeError,
    InitError,
    PlanError,
    ApplyError,
    DestroyError,
    Timeout,
    Cancelled,
    /// The orchestrator itself failed mid-execution (store write, spawn, or a
    /// process restart that interrupted the worker).
    Internal,
}

impl FailureKind {
    /// Whether the caller may resubmit without changing anything.
    ///
    /// Timeouts are excluded: the state of the touched resources is unknown.
    pub fn is_retriable(self) -> bool {
        matches!(self, FailureKind::Cancelled | FailureKind::Internal)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::MaterializeError => "MaterializeError",
            FailureKind::InitError => "InitError",
            FailureKind::PlanError => "PlanError",
            FailureKind::ApplyError => "ApplyError",
            FailureKind::DestroyError => "DestroyError",
            FailureKind::Timeout => "Timeout",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Internal => "Internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Provision,
    Destroy,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Provision => f.write_str("provision"),
            RequestKind::Destroy => f.write_str("destroy"),
        }
    }
}
