//! HTTP API end-to-end tests against a real orchestrator and a scripted tool.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use terraplane_core::{ExecutorContext, MetricsEmitter, Orchestrator};
use terraplane_runtime::{TimeoutTable, ToolExecutor};
use terraplane_schema::OrchestratorConfig;
use terraplane_server::TestServer;

const TOOL: &str = "case \"$1\" in\n\
     init) test -f ../hold && sleep 3; echo initialized ;;\n\
     plan) echo '{\"type\":\"change_summary\",\"changes\":{\"add\":2,\"change\":0,\"remove\":0}}'; echo p > tfplan ;;\n\
     apply) echo 'Apply complete! Resources: 2 added' ;;\n\
     output) echo '{\"alb_dns_name\":{\"sensitive\":false,\"type\":\"string\",\"value\":\"alb.example.com\"}}' ;;\n\
     destroy) echo 'Destroy complete!' ;;\n\
     esac\n";

struct Api {
    server: TestServer,
    agent: ureq::Agent,
    work: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

struct Reply {
    status: u16,
    json: serde_json::Value,
    location: Option<String>,
}

impl Api {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut config = OrchestratorConfig::with_store_root(dir.path().join("store"));
        config.templates_dir = Some(dir.path().join("templates"));
        let ctx = ExecutorContext {
            executor: ToolExecutor::new(
                "/bin/sh",
                vec![dir.path().join("tool.sh").display().to_string()],
                TimeoutTable::uniform(Duration::from_secs(20)),
                Duration::from_millis(200),
            ),
            templates_dir: dir.path().join("templates"),
            metrics: MetricsEmitter::disabled(),
        };
        let orchestrator = Orchestrator::new(&config, ctx).unwrap();
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            work: dir.path().join("store/work"),
            _dir: dir,
            server: TestServer::start(orchestrator),
            agent,
        }
    }

    fn reply(mut resp: ureq::http::Response<ureq::Body>) -> Reply {
        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = resp.body_mut().read_to_string().unwrap();
        let json = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        Reply {
            status,
            json,
            location,
        }
    }

    fn get(&self, path: &str) -> Reply {
        let url = format!("{}{path}", self.server.url);
        Self::reply(self.agent.get(&url).call().unwrap())
    }

    fn post(&self, path: &str, body: &str) -> Reply {
        let url = format!("{}{path}", self.server.url);
        Self::reply(
            self.agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(body)
                .unwrap(),
        )
    }

    fn wait_terminal(&self, id: &str) -> serde_json::Value {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let r = self.get(&format!("/api/v1/provision/{id}"));
            assert_eq!(r.status, 200);
            if r.json["status"] != "in_progress" {
                return r.json;
            }
            assert!(Instant::now() < deadline, "{id} never finished");
            thread::sleep(Duration::from_millis(50));
        }
    }
}

fn setup(dir: &Path) {
    fs::write(dir.join("tool.sh"), TOOL).unwrap();
    fs::create_dir_all(dir.join("templates/web-app")).unwrap();
    fs::write(dir.join("templates/web-app/main.tf"), "# web app\n").unwrap();
}

#[test]
fn health() {
    let api = Api::start();
    let r = api.get("/health");
    assert_eq!(r.status, 200);
    assert_eq!(r.json["status"], "ok");
}

#[test]
fn provision_then_poll_to_completion() {
    let api = Api::start();
    let r = api.post(
        "/api/v1/provision",
        r#"{"template": "web-app", "workspace": "dev-1", "parameters": {"instance_count": 2, "env": "dev"}}"#,
    );
    assert_eq!(r.status, 202);
    assert_eq!(r.json["status"], "in_progress");
    assert_eq!(r.json["workspace"], "dev-1");
    let id = r.json["provision_id"].as_str().unwrap().to_owned();
    assert!(id.starts_with("prov-dev-1-"));
    assert_eq!(r.location.as_deref(), Some(format!("/api/v1/provision/{id}").as_str()));

    let done = api.wait_terminal(&id);
    assert_eq!(done["status"], "completed", "{done}");
    assert_eq!(done["provision_id"], id.as_str());
    assert_eq!(done["outputs"]["alb_dns_name"], "alb.example.com");
    assert_eq!(done["plan_summary"]["add"], 2);

    let tfvars = fs::read_to_string(api.work.join("dev-1/terraform.tfvars")).unwrap();
    assert!(tfvars.contains("instance_count = \"2\""));

    // Unprefixed routes serve the same data.
    let r = api.get(&format!("/provision/{id}"));
    assert_eq!(r.status, 200);
    assert_eq!(r.json["status"], "completed");
}

#[test]
fn missing_fields_are_bad_requests() {
    let api = Api::start();
    assert_eq!(api.post("/provision", r#"{"workspace": "dev-1"}"#).status, 400);
    assert_eq!(api.post("/provision", r#"{"template": "web-app"}"#).status, 400);
    assert_eq!(api.post("/provision", "not json").status, 400);
    assert_eq!(
        api.post(
            "/provision",
            r#"{"template": "web-app", "workspace": "bad/ws"}"#
        )
        .status,
        400
    );
    assert_eq!(
        api.post(
            "/provision",
            r#"{"template": "web-app", "workspace": "dev-1", "parameters": {"tags": {"a": 1}}}"#
        )
        .status,
        400
    );
}

#[test]
fn unknown_provision_id_is_404() {
    let api = Api::start();
    let r = api.get("/api/v1/provision/prov-nope-00000000");
    assert_eq!(r.status, 404);
    assert!(r.json["error"].is_string());
    assert_eq!(api.get("/nothing-here").status, 404);
}

#[test]
fn busy_workspace_is_409() {
    let api = Api::start();
    fs::write(api.work.join("hold"), "").unwrap();
    let body = r#"{"template": "web-app", "workspace": "dev-2"}"#;

    let first = api.post("/provision", body);
    assert_eq!(first.status, 202);
    let second = api.post("/provision", body);
    assert_eq!(second.status, 409);

    fs::remove_file(api.work.join("hold")).unwrap();
    let id = first.json["provision_id"].as_str().unwrap().to_owned();
    assert_eq!(api.wait_terminal(&id)["status"], "completed");
}

#[test]
fn cancel_running_request() {
    let api = Api::start();
    fs::write(api.work.join("hold"), "").unwrap();
    let r = api.post("/provision", r#"{"template": "web-app", "workspace": "dev-3"}"#);
    let id = r.json["provision_id"].as_str().unwrap().to_owned();

    let c = api.post(&format!("/api/v1/provision/{id}/cancel"), "");
    assert_eq!(c.status, 200);
    assert_eq!(c.json["cancelled"], true);

    let done = api.wait_terminal(&id);
    assert_eq!(done["status"], "failed");
    assert_eq!(done["failure"]["kind"], "Cancelled");
    assert!(done.get("outputs").is_none());
}

#[test]
fn destroy_uses_remembered_template() {
    let api = Api::start();
    let r = api.post("/provision", r#"{"template": "web-app", "workspace": "dev-4"}"#);
    let id = r.json["provision_id"].as_str().unwrap().to_owned();
    assert_eq!(api.wait_terminal(&id)["status"], "completed");

    let d = api.post("/api/v1/workspaces/dev-4/destroy", "");
    assert_eq!(d.status, 202, "{}", d.json);
    assert_eq!(d.json["kind"], "destroy");
    let id = d.json["provision_id"].as_str().unwrap().to_owned();
    assert_eq!(api.wait_terminal(&id)["status"], "destroyed");

    assert_eq!(api.post("/workspaces/unknown/destroy", "{}").status, 404);
}

#[test]
fn list_reports_all_requests() {
    let api = Api::start();
    for ws in ["a", "b"] {
        let r = api.post(
            "/provision",
            &format!(r#"{{"template": "web-app", "workspace": "{ws}"}}"#),
        );
        let id = r.json["provision_id"].as_str().unwrap().to_owned();
        api.wait_terminal(&id);
    }
    let r = api.get("/api/v1/provision");
    assert_eq!(r.status, 200);
    let list = r.json.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["workspace"], "b");
}

#[test]
fn wrong_method_is_405() {
    let api = Api::start();
    assert_eq!(api.post("/health", "").status, 405);
    assert_eq!(api.get("/api/v1/workspaces/dev-1/destroy").status, 405);
}
