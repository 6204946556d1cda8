use crate::layout::StoreLayout;
use crate::lock::WorkspaceLockFile;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use terraplane_schema::{BackendDescriptor, ProvisionId, WorkspaceId};
use tracing::{debug, info, warn};

/// Values used to derive a backend descriptor for a workspace seen for the first time.
#[derive(Debug, Clone)]
pub struct BackendDefaults {
    pub state_bucket: String,
    pub lock_table: String,
    pub region: String,
}

/// Durable per-workspace record. The backend descriptor never changes once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceRecord {
    pub workspace_id: WorkspaceId,
    pub backend: BackendDescriptor,
    pub created_at: DateTime<Utc>,
    /// Template and variables of the last accepted request, so a destroy can
    /// re-materialize the same configuration.
    #[serde(default)]
    pub last_template: Option<String>,
    #[serde(default)]
    pub last_variables: BTreeMap<String, String>,
}

/// What a worker needs to run in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub workspace_id: WorkspaceId,
    pub root: PathBuf,
    pub backend: BackendDescriptor,
}

struct HeldLock {
    request_id: ProvisionId,
    _file: WorkspaceLockFile,
}

/// Maps workspace IDs to execution directories and backend descriptors, and
/// guarantees at most one request holds a workspace at a time.
///
/// The in-process table is the check-and-set point; each entry also holds an
/// exclusive lock file so that a second orchestrator process on this host sees
/// the workspace as busy too.
pub struct WorkspaceStore {
    layout: StoreLayout,
    defaults: BackendDefaults,
    locks: Mutex<HashMap<WorkspaceId, HeldLock>>,
    records: Mutex<()>,
}

impl WorkspaceStore {
    pub fn new(layout: StoreLayout, defaults: BackendDefaults) -> Self {
        Self {
            layout,
            defaults,
            locks: Mutex::new(HashMap::new()),
            records: Mutex::new(()),
        }
    }

    /// Atomically move the workspace lock from free to held-by `request_id`.
    ///
    /// Re-acquiring with the request ID that already holds the lock succeeds
    /// without taking a second lock. Any other holder yields `Busy`; callers
    /// are never queued.
    pub fn acquire(
        &self,
        workspace_id: &WorkspaceId,
        request_id: &ProvisionId,
    ) -> Result<WorkspaceHandle, StoreError> {
        let mut locks = self.locks.lock().expect("workspace lock table poisoned");

        if let Some(held) = locks.get(workspace_id) {
            if held.request_id == *request_id {
                debug!("workspace {workspace_id} re-acquired by {request_id}");
                return self.resolve(workspace_id);
            }
            return Err(StoreError::Busy {
                workspace_id: workspace_id.to_string(),
                holder: held.request_id.to_string(),
            });
        }

        let handle = self.resolve(workspace_id)?;

        let lock_path = self.layout.lock_file(workspace_id);
        let Some(file) = WorkspaceLockFile::try_acquire(&lock_path, request_id)? else {
            let holder = WorkspaceLockFile::read_holder(&lock_path)
                .unwrap_or_else(|| "another process".to_owned());
            return Err(StoreError::Busy {
                workspace_id: workspace_id.to_string(),
                holder,
            });
        };

        locks.insert(
            workspace_id.clone(),
            HeldLock {
                request_id: request_id.clone(),
                _file: file,
            },
        );
        info!("workspace {workspace_id} locked by {request_id}");
        Ok(handle)
    }

    /// Free the workspace if `request_id` holds it.
    ///
    /// Otherwise nothing changes and `LockMismatch` is returned (and logged).
    pub fn release(
        &self,
        workspace_id: &WorkspaceId,
        request_id: &ProvisionId,
    ) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().expect("workspace lock table poisoned");

        let current = locks.get(workspace_id).map(|h| h.request_id.clone());
        match current {
            Some(held) if held == *request_id => {
                locks.remove(workspace_id);
                info!("workspace {workspace_id} released by {request_id}");
                Ok(())
            }
            other => {
                let actual = other.map(ProvisionId::into_inner);
                warn!(
                    "lock mismatch: {request_id} released workspace {workspace_id} held by {}",
                    actual.as_deref().unwrap_or("nobody")
                );
                Err(StoreError::LockMismatch {
                    workspace_id: workspace_id.to_string(),
                    expected: request_id.to_string(),
                    actual,
                })
            }
        }
    }

    /// Request currently holding the workspace in this process.
    pub fn holder(&self, workspace_id: &WorkspaceId) -> Option<ProvisionId> {
        let locks = self.locks.lock().expect("workspace lock table poisoned");
        locks.get(workspace_id).map(|h| h.request_id.clone())
    }

    /// Return the execution root and backend descriptor, deriving and
    /// persisting the descriptor the first time a workspace is seen.
    pub fn resolve(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceHandle, StoreError> {
        let _guard = self.records.lock().expect("workspace record lock poisoned");
        let record = match self.read_record(workspace_id)? {
            Some(record) => record,
            None => {
                let record = WorkspaceRecord {
                    workspace_id: workspace_id.clone(),
                    backend: BackendDescriptor::derive(
                        workspace_id,
                        &self.defaults.state_bucket,
                        &self.defaults.lock_table,
                        &self.defaults.region,
                    ),
                    created_at: Utc::now(),
                    last_template: None,
                    last_variables: BTreeMap::new(),
                };
                self.write_record(&record)?;
                info!(
                    "created workspace {workspace_id} (state key {})",
                    record.backend.key
                );
                record
            }
        };

        Ok(WorkspaceHandle {
            workspace_id: workspace_id.clone(),
            root: self.layout.workspace_root(workspace_id),
            backend: record.backend,
        })
    }

    pub fn exists(&self, workspace_id: &WorkspaceId) -> bool {
        self.layout.workspace_record(workspace_id).exists()
    }

    pub fn record(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord, StoreError> {
        let _guard = self.records.lock().expect("workspace record lock poisoned");
        self.read_record(workspace_id)?
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.to_string()))
    }

    pub fn remember_inputs(
        &self,
        workspace_id: &WorkspaceId,
        template: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let _guard = self.records.lock().expect("workspace record lock poisoned");
        let mut record = self
            .read_record(workspace_id)?
            .ok_or_else(|| StoreError::WorkspaceNotFound(workspace_id.to_string()))?;
        record.last_template = Some(template.to_owned());
        record.last_variables.clone_from(variables);
        self.write_record(&record)
    }

    /// Remove the execution directory. The workspace record and its backend
    /// descriptor are kept.
    pub fn remove_root(&self, workspace_id: &WorkspaceId) -> Result<(), StoreError> {
        let root = self.layout.workspace_root(workspace_id);
        if root.exists() {
            fs::remove_dir_all(&root)?;
            debug!("removed workspace root {}", root.display());
        }
        Ok(())
    }

    fn read_record(&self, workspace_id: &WorkspaceId) -> Result<Option<WorkspaceRecord>, StoreError> {
        let path = self.layout.workspace_record(workspace_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_record(&self, record: &WorkspaceRecord) -> Result<(), StoreError> {
        fs::create_dir_all(self.layout.workspaces_dir())?;
        let content = serde_json::to_string_pretty(record)?;
        crate::write_atomic(
            &self.layout.workspace_record(&record.workspace_id),
            content.as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, WorkspaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = WorkspaceStore::new(
            layout,
            BackendDefaults {
                state_bucket: "tf-state".to_owned(),
                lock_table: "tf-locks".to_owned(),
                region: "us-west-2".to_owned(),
            },
        );
        (dir, store)
    }

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::new(id)
    }

    fn req(id: &str) -> ProvisionId {
        ProvisionId::new(id)
    }

    #[test]
    fn acquire_then_conflict() {
        let (_dir, store) = test_store();
        store.acquire(&ws("dev-2"), &req("a")).unwrap();
        let err = store.acquire(&ws("dev-2"), &req("b")).unwrap_err();
        match err {
            StoreError::Busy { holder, .. } => assert_eq!(holder, "a"),
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn reacquire_by_same_request_is_idempotent() {
        let (_dir, store) = test_store();
        let h1 = store.acquire(&ws("dev-1"), &req("a")).unwrap();
        let h2 = store.acquire(&ws("dev-1"), &req("a")).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.holder(&ws("dev-1")), Some(req("a")));

        store.release(&ws("dev-1"), &req("a")).unwrap();
        assert_eq!(store.holder(&ws("dev-1")), None);
    }

    #[test]
    fn release_then_reacquire_by_other() {
        let (_dir, store) = test_store();
        store.acquire(&ws("dev-1"), &req("a")).unwrap();
        store.release(&ws("dev-1"), &req("a")).unwrap();
        store.acquire(&ws("dev-1"), &req("b")).unwrap();
        assert_eq!(store.holder(&ws("dev-1")), Some(req("b")));
    }

    #[test]
    fn release_by_non_holder_is_mismatch_and_keeps_lock() {
        let (_dir, store) = test_store();
        store.acquire(&ws("dev-1"), &req("a")).unwrap();
        let err = store.release(&ws("dev-1"), &req("b")).unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { .. }));
        assert_eq!(store.holder(&ws("dev-1")), Some(req("a")));
    }

    #[test]
    fn release_of_free_workspace_is_mismatch() {
        let (_dir, store) = test_store();
        let err = store.release(&ws("dev-1"), &req("a")).unwrap_err();
        assert!(matches!(err, StoreError::LockMismatch { actual: None, .. }));
    }

    #[test]
    fn distinct_workspaces_lock_independently() {
        let (_dir, store) = test_store();
        store.acquire(&ws("a"), &req("r1")).unwrap();
        store.acquire(&ws("b"), &req("r2")).unwrap();
        assert_eq!(store.holder(&ws("a")), Some(req("r1")));
        assert_eq!(store.holder(&ws("b")), Some(req("r2")));
    }

    #[test]
    fn resolve_derives_descriptor_once() {
        let (dir, store) = test_store();
        let h = store.resolve(&ws("dev-1")).unwrap();
        assert_eq!(h.backend.key, "dev-1/state");
        assert_eq!(h.backend.lock_table, "tf-locks");
        assert_eq!(h.root, dir.path().join("work").join("dev-1"));

        // A store with different defaults must still see the original descriptor.
        let other = WorkspaceStore::new(
            StoreLayout::new(dir.path()),
            BackendDefaults {
                state_bucket: "other-bucket".to_owned(),
                lock_table: "other-locks".to_owned(),
                region: "eu-west-1".to_owned(),
            },
        );
        let h2 = other.resolve(&ws("dev-1")).unwrap();
        assert_eq!(h2.backend, h.backend);
    }

    #[test]
    fn second_store_on_same_root_sees_busy() {
        let (dir, store) = test_store();
        store.acquire(&ws("dev-1"), &req("a")).unwrap();

        let other = WorkspaceStore::new(
            StoreLayout::new(dir.path()),
            BackendDefaults {
                state_bucket: "tf-state".to_owned(),
                lock_table: "tf-locks".to_owned(),
                region: "us-west-2".to_owned(),
            },
        );
        match other.acquire(&ws("dev-1"), &req("b")).unwrap_err() {
            StoreError::Busy { holder, .. } => assert_eq!(holder, "a"),
            e => panic!("expected Busy, got {e:?}"),
        }

        store.release(&ws("dev-1"), &req("a")).unwrap();
        other.acquire(&ws("dev-1"), &req("b")).unwrap();
    }

    #[test]
    fn remember_inputs_roundtrip() {
        let (_dir, store) = test_store();
        store.resolve(&ws("dev-1")).unwrap();
        let vars = BTreeMap::from([("size".to_owned(), "small".to_owned())]);
        store.remember_inputs(&ws("dev-1"), "web", &vars).unwrap();
        let record = store.record(&ws("dev-1")).unwrap();
        assert_eq!(record.last_template.as_deref(), Some("web"));
        assert_eq!(record.last_variables, vars);
    }

    #[test]
    fn record_of_unknown_workspace_fails() {
        let (_dir, store) = test_store();
        assert!(!store.exists(&ws("ghost")));
        assert!(matches!(
            store.record(&ws("ghost")),
            Err(StoreError::WorkspaceNotFound(_))
        ));
    }

    #[test]
    fn remove_root_keeps_record() {
        let (_dir, store) = test_store();
        let h = store.resolve(&ws("dev-1")).unwrap();
        fs::create_dir_all(&h.root).unwrap();
        fs::write(h.root.join("main.tf"), "").unwrap();
        store.remove_root(&ws("dev-1")).unwrap();
        assert!(!h.root.exists());
        assert!(store.exists(&ws("dev-1")));
    }
}
