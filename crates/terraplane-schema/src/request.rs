use crate::state::{FailureKind, ProvisionState, RequestKind};
use crate::types::{ProvisionId, WorkspaceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChange {
    pub state: ProvisionState,
    pub at: DateTime<Utc>,
}

/// Resource counts from the tool's machine-readable plan stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub add: u32,
    pub change: u32,
    pub remove: u32,
}

impl PlanSummary {
    pub fn has_changes(&self) -> bool {
        self.add + self.change + self.remove > 0
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepLog {
    pub verb: String,
    /// `None` when the process was terminated (timeout or cancellation).
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Combined stdout/stderr, verbatim.
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// Raw output of the failing step, preserved verbatim for operators.
    #[serde(default)]
    pub output: String,
}

/// One tracked provisioning attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionRequest {
    pub provision_id: ProvisionId,
    pub workspace_id: WorkspaceId,
    pub kind: RequestKind,
    pub template: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub state: ProvisionState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every state the request has entered, oldest first.
    #[serde(default)]
    pub history: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_summary: Option<PlanSummary>,
    #[serde(default)]
    pub steps: Vec<StepLog>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// blake3 checksum for integrity verification of the persisted record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ProvisionRequest {
    pub fn new(
        provision_id: ProvisionId,
        workspace_id: WorkspaceId,
        kind: RequestKind,
        template: String,
        variables: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            provision_id,
            workspace_id,
            kind,
            template,
            variables,
            state: ProvisionState::Pending,
            started_at: now,
            updated_at: now,
            history: vec![StateChange {
                state: ProvisionState::Pending,
                at: now,
            }],
            plan_summary: None,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
            failure: None,
            checksum: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record entry into `state`. Callers validate the transition first.
    pub fn enter(&mut self, state: ProvisionState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        self.history.push(StateChange { state, at: now });
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.updated_at - self.started_at
    }
}
