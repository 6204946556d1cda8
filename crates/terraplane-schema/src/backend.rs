use crate::WorkspaceId;
use serde::{Deserialize, Serialize};

/// Remote state location and lock resource for one workspace.
///
/// Derived once from the workspace ID and then persisted, so it stays stable
/// for the life of the workspace even if the orchestrator's defaults change.
/// Encryption is not configurable: the rendered backend always enables it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub bucket: String,
    pub key: String,
    pub region: String,
    pub lock_table: String,
}

impl BackendDescriptor {
    pub fn derive(workspace: &WorkspaceId, bucket: &str, lock_table: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_owned(),
            key: state_key(workspace),
            region: region.to_owned(),
            lock_table: lock_table.to_owned(),
        }
    }
}

pub fn state_key(workspace: &WorkspaceId) -> String {
    format!("{workspace}/state")
}
