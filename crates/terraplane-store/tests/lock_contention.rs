//! Workspace lock contention under concurrent acquirers.

use std::sync::{Arc, Barrier};
use std::thread;
use terraplane_schema::{ProvisionId, WorkspaceId};
use terraplane_store::{BackendDefaults, StoreError, StoreLayout, WorkspaceStore};

fn store(root: &std::path::Path) -> WorkspaceStore {
    let layout = StoreLayout::new(root);
    layout.initialize().unwrap();
    WorkspaceStore::new(
        layout,
        BackendDefaults {
            state_bucket: "tf-state".to_owned(),
            lock_table: "tf-locks".to_owned(),
            region: "us-west-2".to_owned(),
        },
    )
}

#[test]
fn only_one_of_n_concurrent_acquirers_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(store(dir.path()));
    let workspace = WorkspaceId::new("dev-2");
    let n = 16;
    let barrier = Arc::new(Barrier::new(n));

    let handles: Vec<_> = (0..n)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let workspace = workspace.clone();
            thread::spawn(move || {
                let request = ProvisionId::new(format!("prov-dev-2-{i:08x}"));
                barrier.wait();
                store.acquire(&workspace, &request).map(|_| request)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one acquirer must win");
    for r in &results {
        if let Err(e) = r {
            assert!(matches!(e, StoreError::Busy { .. }), "losers must see Busy: {e}");
        }
    }

    assert_eq!(store.holder(&workspace).as_ref(), Some(winners[0]));
    store.release(&workspace, winners[0]).unwrap();
    assert!(store.holder(&workspace).is_none());
}

#[test]
fn repeated_acquire_release_cycles_leave_workspace_free() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let workspace = WorkspaceId::new("cycle");

    for i in 0..20 {
        let request = ProvisionId::new(format!("prov-cycle-{i:08x}"));
        store.acquire(&workspace, &request).unwrap();
        store.release(&workspace, &request).unwrap();
    }

    store
        .acquire(&workspace, &ProvisionId::new("prov-cycle-final"))
        .unwrap();
}
