use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REGION: &str = "us-west-2";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("backend.{0} must not be empty")]
    EmptyBackendField(&'static str),
    #[error("metrics.endpoint is required when metrics.sink = \"http\"")]
    MissingMetricsEndpoint,
    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Top-level orchestrator configuration, usually read from `terraplane.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
    /// Directory holding one sub-directory per template. Defaults to
    /// `<store_root>/templates`.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    #[serde(default)]
    pub tool: ToolSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolSection {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Arguments placed before the verb, e.g. a wrapper script path.
    #[serde(default)]
    pub global_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    #[serde(default = "default_init_secs")]
    pub init_secs: u64,
    #[serde(default = "default_plan_secs")]
    pub plan_secs: u64,
    #[serde(default = "default_apply_secs")]
    pub apply_secs: u64,
    #[serde(default = "default_apply_secs")]
    pub destroy_secs: u64,
    #[serde(default = "default_output_secs")]
    pub output_secs: u64,
    /// Time between SIGTERM and SIGKILL when a subprocess is terminated.
    #[serde(default = "default_grace_millis")]
    pub grace_millis: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    #[serde(default = "default_state_bucket")]
    pub state_bucket: String,
    #[serde(default = "default_lock_table")]
    pub lock_table: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSinkKind {
    #[default]
    Log,
    Http,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    #[serde(default)]
    pub sink: MetricsSinkKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            templates_dir: None,
            tool: ToolSection::default(),
            timeouts: TimeoutSection::default(),
            backend: BackendSection::default(),
            metrics: MetricsSection::default(),
        }
    }
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            global_args: Vec::new(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            init_secs: default_init_secs(),
            plan_secs: default_plan_secs(),
            apply_secs: default_apply_secs(),
            destroy_secs: default_apply_secs(),
            output_secs: default_output_secs(),
            grace_millis: default_grace_millis(),
        }
    }
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            state_bucket: default_state_bucket(),
            lock_table: default_lock_table(),
            region: None,
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            sink: MetricsSinkKind::default(),
            endpoint: None,
            namespace: default_namespace(),
        }
    }
}

impl OrchestratorConfig {
    /// A config rooted at `store_root` with every other field defaulted.
    pub fn with_store_root(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            ..Self::default()
        }
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.templates_dir
            .clone()
            .unwrap_or_else(|| self.store_root.join("templates"))
    }

    /// Region for new backend descriptors: explicit config, then `AWS_REGION`,
    /// then [`DEFAULT_REGION`].
    pub fn region(&self) -> String {
        self.backend
            .region
            .clone()
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
            .unwrap_or_else(|| DEFAULT_REGION.to_owned())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.state_bucket.is_empty() {
            return Err(ConfigError::EmptyBackendField("state_bucket"));
        }
        if self.backend.lock_table.is_empty() {
            return Err(ConfigError::EmptyBackendField("lock_table"));
        }
        if self.metrics.sink == MetricsSinkKind::Http && self.metrics.endpoint.is_none() {
            return Err(ConfigError::MissingMetricsEndpoint);
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("init_secs", t.init_secs),
            ("plan_secs", t.plan_secs),
            ("apply_secs", t.apply_secs),
            ("destroy_secs", t.destroy_secs),
            ("output_secs", t.output_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        Ok(())
    }
}

impl TimeoutSection {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_millis)
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/terraplane")
}

fn default_binary() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_init_secs() -> u64 {
    300
}

fn default_plan_secs() -> u64 {
    600
}

fn default_apply_secs() -> u64 {
    3600
}

fn default_output_secs() -> u64 {
    60
}

fn default_grace_millis() -> u64 {
    10_000
}

fn default_state_bucket() -> String {
    "terraplane-state".to_owned()
}

fn default_lock_table() -> String {
    "terraplane-locks".to_owned()
}

fn default_namespace() -> String {
    "Platform".to_owned()
}

pub fn parse_config_str(input: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<OrchestratorConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let input = r#"
store_root = "/srv/terraplane"
templates_dir = "/srv/templates"

[tool]
binary = "/usr/local/bin/tofu"
global_args = ["-no-color"]

[timeouts]
init_secs = 30
plan_secs = 60
apply_secs = 900
destroy_secs = 900
output_secs = 10
grace_millis = 2000

[backend]
state_bucket = "acme-tf-state"
lock_table = "acme-tf-locks"
region = "eu-central-1"

[metrics]
sink = "http"
endpoint = "http://metrics.internal/v1/put"
namespace = "Acme"
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.store_root, PathBuf::from("/srv/terraplane"));
        assert_eq!(config.templates_dir(), PathBuf::from("/srv/templates"));
        assert_eq!(config.tool.binary, PathBuf::from("/usr/local/bin/tofu"));
        assert_eq!(config.tool.global_args, vec!["-no-color"]);
        assert_eq!(config.timeouts.apply_secs, 900);
        assert_eq!(config.timeouts.grace(), Duration::from_secs(2));
        assert_eq!(config.region(), "eu-central-1");
        assert_eq!(config.metrics.sink, MetricsSinkKind::Http);
        assert_eq!(config.metrics.namespace, "Acme");
    }

    #[test]
    fn parses_empty_config_with_defaults() {
        let config = parse_config_str("").expect("should parse");
        assert_eq!(config.tool.binary, PathBuf::from("terraform"));
        assert_eq!(config.timeouts.init_secs, 300);
        assert_eq!(config.timeouts.apply_secs, 3600);
        assert_eq!(config.metrics.sink, MetricsSinkKind::Log);
        assert_eq!(
            config.templates_dir(),
            PathBuf::from("/var/lib/terraplane/templates")
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse_config_str("[tool]\nbinary = \"tf\"\nflavour = 1\n").is_err());
    }

    #[test]
    fn http_sink_requires_endpoint() {
        let err = parse_config_str("[metrics]\nsink = \"http\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingMetricsEndpoint));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = parse_config_str("[timeouts]\napply_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("apply_secs"));
    }

    #[test]
    fn rejects_empty_lock_table() {
        let err = parse_config_str("[backend]\nlock_table = \"\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBackendField("lock_table")));
    }

    #[test]
    fn explicit_region_wins() {
        let mut config = OrchestratorConfig::default();
        config.backend.region = Some("ap-south-1".to_owned());
        assert_eq!(config.region(), "ap-south-1");
    }
}
