//! Workspace isolation and durable request records for Terraplane.
//!
//! This crate provides the storage layer: `StoreLayout` for the directory
//! structure, `WorkspaceStore` for per-workspace locking (in-process
//! check-and-set backed by an exclusive lock file) and stable backend
//! descriptors, and `RequestStore` for checksummed, atomically written
//! `ProvisionRequest` records.

pub mod layout;
pub mod lock;
pub mod records;
pub mod workspace;

pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::WorkspaceLockFile;
pub use records::RequestStore;
pub use workspace::{BackendDefaults, WorkspaceHandle, WorkspaceRecord, WorkspaceStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` via a temp file in the same directory and a rename.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workspace '{workspace_id}' is busy (held by {holder})")]
    Busy {
        workspace_id: String,
        holder: String,
    },
    #[error(
        "lock mismatch on workspace '{workspace_id}': release by {expected}, held by {}",
        .actual.as_deref().unwrap_or("nobody")
    )]
    LockMismatch {
        workspace_id: String,
        expected: String,
        actual: Option<String>,
    },
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),
    #[error("provisioning request not found: {0}")]
    RequestNotFound(String),
    #[error("integrity check failed for record '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}
