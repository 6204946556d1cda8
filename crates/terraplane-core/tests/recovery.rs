//! Request records across orchestrator restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use terraplane_core::{ExecutorContext, MetricsEmitter, Orchestrator, ProvisionInput};
use terraplane_runtime::{TimeoutTable, ToolExecutor};
use terraplane_schema::{
    FailureKind, OrchestratorConfig, ProvisionId, ProvisionRequest, ProvisionState, RequestKind,
    WorkspaceId,
};
use terraplane_store::{RequestStore, StoreLayout};

fn config(dir: &Path) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::with_store_root(dir.join("store"));
    config.templates_dir = Some(dir.join("templates"));
    config
}

fn open(dir: &Path) -> Orchestrator {
    let script = dir.join("tool.sh");
    if !script.exists() {
        fs::write(
            &script,
            "case \"$1\" in\n\
             output) echo '{\"url\":{\"value\":\"http://x\"}}' ;;\n\
             *) echo \"$1 ok\" ;;\n\
             esac\n",
        )
        .unwrap();
        fs::create_dir_all(dir.join("templates/web")).unwrap();
        fs::write(dir.join("templates/web/main.tf"), "# web\n").unwrap();
    }
    let config = config(dir);
    let ctx = ExecutorContext {
        executor: ToolExecutor::new(
            "/bin/sh",
            vec![script.display().to_string()],
            TimeoutTable::uniform(Duration::from_secs(20)),
            Duration::from_millis(200),
        ),
        templates_dir: dir.join("templates"),
        metrics: MetricsEmitter::disabled(),
    };
    Orchestrator::new(&config, ctx).unwrap()
}

#[test]
fn completed_request_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let orchestrator = open(dir.path());
        let ticket = orchestrator
            .provision(ProvisionInput {
                workspace: "dev-1".to_owned(),
                template: "web".to_owned(),
                variables: BTreeMap::new(),
            })
            .unwrap();
        let req = orchestrator
            .wait(&ticket.provision_id, Duration::from_secs(30))
            .unwrap();
        assert_eq!(req.state, ProvisionState::Completed, "{:?}", req.failure);
        ticket.provision_id
    };

    let reopened = open(dir.path());
    let req = reopened.get_status(&id).unwrap();
    assert_eq!(req.state, ProvisionState::Completed);
    assert_eq!(req.outputs["url"], "http://x");
    assert_eq!(reopened.list().unwrap().len(), 1);
}

#[test]
fn in_flight_record_is_failed_as_interrupted_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path().join("store"));
    layout.initialize().unwrap();

    let id = ProvisionId::new("prov-dev-9-deadbeef");
    let mut req = ProvisionRequest::new(
        id.clone(),
        WorkspaceId::new("dev-9"),
        RequestKind::Provision,
        "web".to_owned(),
        BTreeMap::new(),
    );
    req.enter(ProvisionState::Initializing);
    req.enter(ProvisionState::Planning);
    RequestStore::new(layout).put(&req).unwrap();

    let orchestrator = open(dir.path());
    let recovered = orchestrator.get_status(&id).unwrap();
    assert_eq!(recovered.state, ProvisionState::Failed);
    let failure = recovered.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Internal);
    assert!(failure.message.contains("interrupted"));
    assert!(orchestrator
        .workspaces()
        .holder(&WorkspaceId::new("dev-9"))
        .is_none());
    assert!(!orchestrator.cancel(&id).unwrap());
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.backend.lock_table = String::new();
    let ctx = ExecutorContext {
        executor: ToolExecutor::new(
            "/bin/sh",
            Vec::new(),
            TimeoutTable::uniform(Duration::from_secs(1)),
            Duration::from_millis(100),
        ),
        templates_dir: dir.path().join("templates"),
        metrics: MetricsEmitter::disabled(),
    };
    assert!(Orchestrator::new(&config, ctx).is_err());
}
