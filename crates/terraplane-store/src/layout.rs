use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for a Terraplane store.
///
/// ```text
/// <root>/store/version
/// <root>/store/workspaces/<workspace>.json   workspace record + backend descriptor
/// <root>/store/locks/<workspace>.lock        cross-process workspace lock
/// <root>/store/requests/<provision_id>.json  provisioning request records
/// <root>/work/<workspace>/                   execution directory (ephemeral)
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn workspaces_dir(&self) -> PathBuf {
        self.store_dir().join("workspaces")
    }

    #[inline]
    pub fn workspace_record(&self, workspace_id: &str) -> PathBuf {
        self.workspaces_dir().join(format!("{workspace_id}.json"))
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.store_dir().join("locks")
    }

    #[inline]
    pub fn lock_file(&self, workspace_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{workspace_id}.lock"))
    }

    #[inline]
    pub fn requests_dir(&self) -> PathBuf {
        self.store_dir().join("requests")
    }

    #[inline]
    pub fn request_record(&self, provision_id: &str) -> PathBuf {
        self.requests_dir().join(format!("{provision_id}.json"))
    }

    #[inline]
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Execution directory for one workspace, recreated on every run.
    #[inline]
    pub fn workspace_root(&self, workspace_id: &str) -> PathBuf {
        self.work_dir().join(workspace_id)
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.workspaces_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.requests_dir())?;
        fs::create_dir_all(self.work_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
