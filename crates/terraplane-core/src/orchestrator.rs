use crate::lifecycle::validate_transition;
use crate::metrics::{MetricsEmitter, ProvisionOutcome};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use terraplane_runtime::{
    materialize, parse_outputs, parse_plan_summary, render_variables, resolve_template,
    write_variables, CancelToken, RunStatus, ToolExecutor, ToolRun, Verb,
};
use terraplane_schema::{
    validate_template_name, Failure, FailureKind, OrchestratorConfig, ProvisionId,
    ProvisionRequest, ProvisionState, RequestKind, WorkspaceId,
};
use terraplane_store::{
    BackendDefaults, RequestStore, StoreError, StoreLayout, WorkspaceHandle, WorkspaceStore,
};
use tracing::{debug, error, info, warn};

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Everything a worker needs to run the external tool, passed in explicitly.
pub struct ExecutorContext {
    pub executor: ToolExecutor,
    pub templates_dir: PathBuf,
    pub metrics: MetricsEmitter,
}

impl ExecutorContext {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            executor: ToolExecutor::from_config(&config.tool, &config.timeouts),
            templates_dir: config.templates_dir(),
            metrics: MetricsEmitter::from_config(&config.metrics),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionInput {
    pub workspace: String,
    pub template: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// A destroy falls back to the workspace's last template and variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyInput {
    pub workspace: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub variables: Option<BTreeMap<String, String>>,
}

/// Returned when a request is accepted; the work continues in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionTicket {
    pub provision_id: ProvisionId,
    pub workspace_id: WorkspaceId,
    pub kind: RequestKind,
    pub state: ProvisionState,
}

struct Inner {
    workspaces: WorkspaceStore,
    records: RequestStore,
    ctx: ExecutorContext,
    requests: RwLock<HashMap<ProvisionId, ProvisionRequest>>,
    cancels: Mutex<HashMap<ProvisionId, CancelToken>>,
}

impl Inner {
    fn cache(&self, request: &ProvisionRequest) {
        self.requests
            .write()
            .expect("request table poisoned")
            .insert(request.provision_id.clone(), request.clone());
    }
}

/// Accepts provisioning requests and drives each one through its lifecycle
/// on a dedicated worker thread.
///
/// Requests for distinct workspaces run in parallel. A request for a
/// workspace that is already held is rejected with [`CoreError::Busy`]
/// before any record is created.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Open the store under `config.store_root` and run with `ctx`.
    ///
    /// Records left in a non-terminal state by a process that died are
    /// marked `Failed(Internal)`, unless their workspace is still locked by
    /// another live orchestrator.
    pub fn new(config: &OrchestratorConfig, ctx: ExecutorContext) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = StoreLayout::new(&config.store_root);
        layout.initialize()?;

        let defaults = BackendDefaults {
            state_bucket: config.backend.state_bucket.clone(),
            lock_table: config.backend.lock_table.clone(),
            region: config.region(),
        };
        let orchestrator = Self {
            inner: Arc::new(Inner {
                workspaces: WorkspaceStore::new(layout.clone(), defaults),
                records: RequestStore::new(layout),
                ctx,
                requests: RwLock::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
            }),
        };
        orchestrator.recover_interrupted()?;
        info!(
            "orchestrator ready (store {}, tool {})",
            config.store_root.display(),
            orchestrator.inner.ctx.executor.binary().display()
        );
        Ok(orchestrator)
    }

    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, CoreError> {
        Self::new(config, ExecutorContext::from_config(config))
    }

    pub fn workspaces(&self) -> &WorkspaceStore {
        &self.inner.workspaces
    }

    /// Accept a provision request: init, plan, then apply in `input.workspace`.
    pub fn provision(&self, input: ProvisionInput) -> Result<ProvisionTicket, CoreError> {
        let workspace_id = WorkspaceId::parse(&input.workspace)?;
        validate_template_name(&input.template)?;
        render_variables(&input.variables).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        self.accept(
            workspace_id,
            RequestKind::Provision,
            input.template,
            input.variables,
        )
    }

    /// Accept a destroy request against a workspace that has been provisioned before.
    pub fn destroy(&self, input: DestroyInput) -> Result<ProvisionTicket, CoreError> {
        let workspace_id = WorkspaceId::parse(&input.workspace)?;
        let record = self.inner.workspaces.record(&workspace_id)?;
        let template = input.template.or(record.last_template).ok_or_else(|| {
            CoreError::InvalidInput(format!(
                "no template given and none remembered for workspace {workspace_id}"
            ))
        })?;
        validate_template_name(&template)?;
        let variables = input.variables.unwrap_or(record.last_variables);
        render_variables(&variables).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        self.accept(workspace_id, RequestKind::Destroy, template, variables)
    }

    fn accept(
        &self,
        workspace_id: WorkspaceId,
        kind: RequestKind,
        template: String,
        variables: BTreeMap<String, String>,
    ) -> Result<ProvisionTicket, CoreError> {
        let provision_id = self.fresh_id(&workspace_id);
        let handle = self.inner.workspaces.acquire(&workspace_id, &provision_id)?;

        let request = ProvisionRequest::new(
            provision_id.clone(),
            workspace_id.clone(),
            kind,
            template,
            variables,
        );
        if let Err(e) = self.start(request, handle) {
            self.release(&workspace_id, &provision_id);
            return Err(e);
        }

        info!("accepted {kind} {provision_id} for workspace {workspace_id}");
        Ok(ProvisionTicket {
            provision_id,
            workspace_id,
            kind,
            state: ProvisionState::Pending,
        })
    }

    fn start(&self, request: ProvisionRequest, handle: WorkspaceHandle) -> Result<(), CoreError> {
        // The Pending record goes last: once it exists a worker must own it.
        self.inner.workspaces.remember_inputs(
            &request.workspace_id,
            &request.template,
            &request.variables,
        )?;
        self.inner.records.put(&request)?;

        let cancel = CancelToken::new();
        self.inner.cache(&request);
        self.inner
            .cancels
            .lock()
            .expect("cancel table poisoned")
            .insert(request.provision_id.clone(), cancel.clone());

        let provision_id = request.provision_id.clone();
        let worker = Worker {
            inner: Arc::clone(&self.inner),
            request,
            handle,
            cancel,
        };
        let spawned = thread::Builder::new()
            .name(format!("worker-{provision_id}"))
            .spawn(move || worker.run());
        if let Err(e) = spawned {
            self.inner
                .cancels
                .lock()
                .expect("cancel table poisoned")
                .remove(&provision_id);
            self.mark_failed(
                &provision_id,
                FailureKind::Internal,
                format!("cannot start worker: {e}"),
            );
            return Err(CoreError::Io(e));
        }
        Ok(())
    }

    /// Signal the worker of a running request to stop.
    ///
    /// Returns `true` if a live worker was signalled and `false` if the
    /// request had already finished. The worker terminates any running
    /// subprocess, then records `Failed(Cancelled)` and releases the lock.
    pub fn cancel(&self, provision_id: &str) -> Result<bool, CoreError> {
        let snapshot = self.get_status(provision_id)?;
        if snapshot.is_terminal() {
            return Ok(false);
        }
        let cancels = self.inner.cancels.lock().expect("cancel table poisoned");
        match cancels.get(provision_id) {
            Some(token) => {
                token.cancel();
                info!("cancellation requested for {provision_id}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel every request with a live worker. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let cancels = self.inner.cancels.lock().expect("cancel table poisoned");
        for token in cancels.values() {
            token.cancel();
        }
        cancels.len()
    }

    /// Current snapshot of a request. Never blocks on a running worker.
    pub fn get_status(&self, provision_id: &str) -> Result<ProvisionRequest, CoreError> {
        if !is_well_formed_id(provision_id) {
            return Err(CoreError::RequestNotFound(provision_id.to_owned()));
        }
        if let Some(req) = self
            .inner
            .requests
            .read()
            .expect("request table poisoned")
            .get(provision_id)
        {
            return Ok(req.clone());
        }
        Ok(self.inner.records.get(provision_id)?)
    }

    /// Poll until the request is terminal or `timeout` elapses, returning the
    /// latest snapshot either way.
    pub fn wait(&self, provision_id: &str, timeout: Duration) -> Result<ProvisionRequest, CoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.get_status(provision_id)?;
            if snapshot.is_terminal() || Instant::now() >= deadline {
                return Ok(snapshot);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    /// All retained requests, newest first.
    pub fn list(&self) -> Result<Vec<ProvisionRequest>, CoreError> {
        let mut by_id: HashMap<ProvisionId, ProvisionRequest> = self
            .inner
            .records
            .list()?
            .into_iter()
            .map(|r| (r.provision_id.clone(), r))
            .collect();
        for (id, req) in self.inner.requests.read().expect("request table poisoned").iter() {
            by_id.insert(id.clone(), req.clone());
        }
        let mut all: Vec<_> = by_id.into_values().collect();
        all.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.provision_id.cmp(&b.provision_id))
        });
        Ok(all)
    }

    fn fresh_id(&self, workspace_id: &WorkspaceId) -> ProvisionId {
        let requests = self.inner.requests.read().expect("request table poisoned");
        loop {
            let id = ProvisionId::generate(workspace_id);
            if !requests.contains_key(&id) && !self.inner.records.exists(&id) {
                return id;
            }
            debug!("provisioning id {id} already taken, regenerating");
        }
    }

    fn release(&self, workspace_id: &WorkspaceId, provision_id: &ProvisionId) {
        if let Err(e) = self.inner.workspaces.release(workspace_id, provision_id) {
            warn!("releasing workspace after {provision_id}: {e}");
        }
    }

    fn mark_failed(&self, provision_id: &ProvisionId, kind: FailureKind, message: String) {
        let Ok(mut req) = self.get_status(provision_id) else {
            return;
        };
        if req.is_terminal() {
            return;
        }
        req.enter(ProvisionState::Failed);
        req.failure = Some(Failure {
            kind,
            message,
            output: String::new(),
        });
        self.inner.cache(&req);
        if let Err(e) = self.inner.records.put(&req) {
            error!("failed to persist failure of {provision_id}: {e}");
        }
    }

    fn recover_interrupted(&self) -> Result<(), CoreError> {
        for mut req in self.inner.records.list()? {
            if req.is_terminal() {
                continue;
            }
            // A live orchestrator elsewhere still owns this request.
            match self
                .inner
                .workspaces
                .acquire(&req.workspace_id, &req.provision_id)
            {
                Ok(_) => {}
                Err(StoreError::Busy { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
            warn!(
                "{} was {} when its orchestrator stopped; marking failed",
                req.provision_id, req.state
            );
            req.enter(ProvisionState::Failed);
            req.failure = Some(Failure {
                kind: FailureKind::Internal,
                message: "interrupted: orchestrator stopped before the request finished".to_owned(),
                output: String::new(),
            });
            let persisted = self.inner.records.put(&req);
            self.release(&req.workspace_id, &req.provision_id);
            persisted?;
        }
        Ok(())
    }
}

/// Provisioning IDs share the workspace character set.
fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A step failure: classification plus what the tool printed.
struct StepFailure {
    kind: FailureKind,
    message: String,
    output: String,
}

impl StepFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            output: String::new(),
        }
    }

    fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }
}

/// Runs one request from `Pending` to a terminal state. Owns the workspace
/// root for its lifetime.
struct Worker {
    inner: Arc<Inner>,
    request: ProvisionRequest,
    handle: WorkspaceHandle,
    cancel: CancelToken,
}

impl Worker {
    fn run(mut self) {
        let started = Instant::now();
        let outcome = match self.request.kind {
            RequestKind::Provision => self.provision(),
            RequestKind::Destroy => self.destroy(),
        };

        let terminal = match outcome {
            Ok(state) => state,
            Err(failure) => {
                warn!(
                    "{} failed in {} ({}): {}",
                    self.request.provision_id, self.request.state, failure.kind, failure.message
                );
                self.request.failure = Some(Failure {
                    kind: failure.kind,
                    message: failure.message,
                    output: failure.output,
                });
                ProvisionState::Failed
            }
        };
        if let Err(e) = validate_transition(self.request.state, terminal) {
            error!("{}: {e}", self.request.provision_id);
        }
        self.request.enter(terminal);

        // Free the workspace before the terminal state becomes visible, so
        // anyone who observes it can immediately acquire the workspace again.
        if let Err(e) = self
            .inner
            .workspaces
            .release(&self.request.workspace_id, &self.request.provision_id)
        {
            warn!("{}: {e}", self.request.provision_id);
        }
        self.inner
            .cancels
            .lock()
            .expect("cancel table poisoned")
            .remove(&self.request.provision_id);
        self.inner.cache(&self.request);
        if let Err(e) = self.inner.records.put(&self.request) {
            error!(
                "failed to persist terminal state of {}: {e}",
                self.request.provision_id
            );
        }
        info!(
            "{} finished: {} after {:?}",
            self.request.provision_id,
            self.request.state,
            started.elapsed()
        );

        self.inner.ctx.metrics.emit(&ProvisionOutcome {
            provision_id: self.request.provision_id.clone(),
            workspace_id: self.request.workspace_id.clone(),
            kind: self.request.kind,
            failure: self.request.failure.as_ref().map(|f| f.kind),
            duration: started.elapsed(),
        });
    }

    fn provision(&mut self) -> Result<ProvisionState, StepFailure> {
        self.check_cancelled()?;
        self.stage()?;

        self.advance(ProvisionState::Initializing)?;
        self.run_step(Verb::Init, FailureKind::InitError)?;

        write_variables(&self.handle.root, &self.request.variables).map_err(|e| {
            StepFailure::new(FailureKind::MaterializeError, format!("cannot write variables: {e}"))
        })?;
        self.advance(ProvisionState::Planning)?;
        let plan = self.run_step(Verb::Plan, FailureKind::PlanError)?;
        self.request.plan_summary = parse_plan_summary(&plan.output);
        match &self.request.plan_summary {
            Some(s) => info!(
                "{} plan: {} to add, {} to change, {} to destroy",
                self.request.provision_id, s.add, s.change, s.remove
            ),
            None => warn!("{} plan reported no change summary", self.request.provision_id),
        }

        self.advance(ProvisionState::Applying)?;
        self.run_step(Verb::Apply, FailureKind::ApplyError)?;
        self.collect_outputs();
        Ok(ProvisionState::Completed)
    }

    fn destroy(&mut self) -> Result<ProvisionState, StepFailure> {
        self.check_cancelled()?;
        self.stage()?;
        write_variables(&self.handle.root, &self.request.variables).map_err(|e| {
            StepFailure::new(FailureKind::MaterializeError, format!("cannot write variables: {e}"))
        })?;

        self.advance(ProvisionState::Destroying)?;
        self.run_step(Verb::Init, FailureKind::InitError)?;
        self.run_step(Verb::Destroy, FailureKind::DestroyError)?;

        // Only the execution directory goes; the backend descriptor stays.
        if let Err(e) = self.inner.workspaces.remove_root(&self.request.workspace_id) {
            warn!(
                "{}: cannot remove workspace root: {e}",
                self.request.provision_id
            );
        }
        Ok(ProvisionState::Destroyed)
    }

    fn stage(&self) -> Result<(), StepFailure> {
        let template_dir =
            resolve_template(&self.inner.ctx.templates_dir, &self.request.template)
                .map_err(|e| StepFailure::new(FailureKind::MaterializeError, e.to_string()))?;
        let copied = materialize(&template_dir, &self.handle)
            .map_err(|e| StepFailure::new(FailureKind::MaterializeError, e.to_string()))?;
        debug!(
            "{} staged {copied} template files",
            self.request.provision_id
        );
        Ok(())
    }

    fn advance(&mut self, to: ProvisionState) -> Result<(), StepFailure> {
        let from = self.request.state;
        validate_transition(from, to)
            .map_err(|e| StepFailure::new(FailureKind::Internal, e.to_string()))?;
        self.request.enter(to);
        info!("{} {from} -> {to}", self.request.provision_id);
        self.inner.cache(&self.request);
        self.inner.records.put(&self.request).map_err(|e| {
            StepFailure::new(FailureKind::Internal, format!("cannot persist request: {e}"))
        })
    }

    fn check_cancelled(&self) -> Result<(), StepFailure> {
        if self.cancel.is_cancelled() {
            return Err(StepFailure::new(
                FailureKind::Cancelled,
                format!("cancelled while {}", self.request.state),
            ));
        }
        Ok(())
    }

    fn run_step(&mut self, verb: Verb, kind: FailureKind) -> Result<ToolRun, StepFailure> {
        self.check_cancelled()?;
        let run = self
            .inner
            .ctx
            .executor
            .run(verb, &self.handle.root, &self.cancel)
            .map_err(|e| StepFailure::new(kind, e.to_string()))?;
        self.request.steps.push(run.to_step_log());
        self.inner.cache(&self.request);

        let name = verb.as_str();
        match run.status {
            RunStatus::Exited(0) => Ok(run),
            RunStatus::Exited(code) => {
                Err(StepFailure::new(kind, format!("{name} exited with code {code}"))
                    .with_output(run.output))
            }
            RunStatus::Signaled => Err(StepFailure::new(kind, format!("{name} was killed by a signal"))
                .with_output(run.output)),
            RunStatus::TimedOut => Err(StepFailure::new(
                FailureKind::Timeout,
                format!(
                    "{name} exceeded its {:?} timeout",
                    self.inner.ctx.executor.timeouts().for_verb(verb)
                ),
            )
            .with_output(run.output)),
            RunStatus::Cancelled => Err(StepFailure::new(
                FailureKind::Cancelled,
                format!("cancelled during {name}"),
            )
            .with_output(run.output)),
        }
    }

    /// Read `output -json` after a successful apply. A failure here is logged
    /// and leaves the outputs empty; the apply itself already succeeded.
    fn collect_outputs(&mut self) {
        let run = match self.run_step(Verb::Output, FailureKind::ApplyError) {
            Ok(run) => run,
            Err(f) => {
                warn!(
                    "{}: reading outputs failed: {}",
                    self.request.provision_id, f.message
                );
                return;
            }
        };
        // Values live in `outputs`; keep sensitive ones out of the step log.
        if let Some(step) = self.request.steps.last_mut() {
            step.output.clear();
        }
        self.inner.cache(&self.request);
        match parse_outputs(&run.output) {
            Ok(outputs) => {
                info!(
                    "{} produced {} outputs ({} sensitive)",
                    self.request.provision_id,
                    outputs.values.len(),
                    outputs.sensitive.len()
                );
                self.request.outputs = outputs.values;
            }
            Err(e) => warn!("{}: {e}", self.request.provision_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_ids() {
        assert!(is_well_formed_id("prov-dev-1-0a1b2c3d"));
        assert!(!is_well_formed_id(""));
        assert!(!is_well_formed_id("../etc/passwd"));
        assert!(!is_well_formed_id("prov dev"));
    }

    #[test]
    fn destroy_input_defaults() {
        let input: DestroyInput = serde_json::from_str(r#"{"workspace": "dev-1"}"#).unwrap();
        assert_eq!(input.workspace, "dev-1");
        assert!(input.template.is_none());
        assert!(input.variables.is_none());
    }
}
