use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use terraplane_schema::{
    FailureKind, MetricsSection, MetricsSinkKind, ProvisionId, RequestKind, WorkspaceId,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pending batches beyond this are dropped rather than block a worker.
const QUEUE_DEPTH: usize = 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics HTTP error: {0}")]
    Http(String),
    #[error("metrics serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricUnit {
    Count,
    Seconds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal result of one request, as reported to the metrics sink.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub provision_id: ProvisionId,
    pub workspace_id: WorkspaceId,
    pub kind: RequestKind,
    pub failure: Option<FailureKind>,
    pub duration: Duration,
}

impl ProvisionOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// `Provisioning.Success` or `Provisioning.Failure`, plus `Provisioning.Duration`.
    pub fn metrics(&self) -> Vec<Metric> {
        let now = Utc::now();
        let mut dimensions = BTreeMap::from([
            ("Workspace".to_owned(), self.workspace_id.to_string()),
            ("Operation".to_owned(), self.kind.to_string()),
        ]);
        if let Some(kind) = self.failure {
            dimensions.insert("FailureKind".to_owned(), kind.to_string());
        }
        let outcome = if self.success() {
            "Provisioning.Success"
        } else {
            "Provisioning.Failure"
        };
        vec![
            Metric {
                name: outcome.to_owned(),
                value: 1.0,
                unit: MetricUnit::Count,
                dimensions: dimensions.clone(),
                timestamp: now,
            },
            Metric {
                name: "Provisioning.Duration".to_owned(),
                value: self.duration.as_secs_f64(),
                unit: MetricUnit::Seconds,
                dimensions,
                timestamp: now,
            },
        ]
    }
}

/// Destination for outcome metrics.
pub trait MetricsSink: Send {
    fn name(&self) -> &'static str;
    fn publish(&self, namespace: &str, metrics: &[Metric]) -> Result<(), MetricsError>;
}

/// Writes metrics to the log.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&self, namespace: &str, metrics: &[Metric]) -> Result<(), MetricsError> {
        for m in metrics {
            info!(
                target: "terraplane::metrics",
                "{namespace}/{} = {} {:?} {:?}",
                m.name,
                m.value,
                m.unit,
                m.dimensions
            );
        }
        Ok(())
    }
}

pub struct NullSink;

impl MetricsSink for NullSink {
    fn name(&self) -> &'static str {
        "none"
    }

    fn publish(&self, _namespace: &str, _metrics: &[Metric]) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// POSTs `{"namespace": ..., "metric_data": [...]}` to an HTTP collector.
pub struct HttpSink {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(HTTP_TIMEOUT))
            .build()
            .into();
        Self {
            endpoint: endpoint.into(),
            agent,
        }
    }
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    namespace: &'a str,
    metric_data: &'a [Metric],
}

impl MetricsSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn publish(&self, namespace: &str, metrics: &[Metric]) -> Result<(), MetricsError> {
        let body = serde_json::to_vec(&MetricBatch {
            namespace,
            metric_data: metrics,
        })?;
        match self
            .agent
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .send(&body[..])
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code)) => Err(MetricsError::Http(format!(
                "HTTP {code} from {}",
                self.endpoint
            ))),
            Err(e) => Err(MetricsError::Http(e.to_string())),
        }
    }
}

/// Hands outcome metrics to a background delivery thread.
///
/// `emit` never blocks: if the queue is full or the thread is gone the batch
/// is dropped with a warning. Sink failures are logged by the delivery thread
/// and never reach the request.
pub struct MetricsEmitter {
    tx: Option<SyncSender<Vec<Metric>>>,
    handle: Option<JoinHandle<()>>,
}

impl MetricsEmitter {
    pub fn spawn(sink: Box<dyn MetricsSink>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let (tx, rx) = mpsc::sync_channel::<Vec<Metric>>(QUEUE_DEPTH);
        let spawned = thread::Builder::new()
            .name("terraplane-metrics".to_owned())
            .spawn(move || {
                debug!("metrics delivery started (sink: {})", sink.name());
                for batch in rx {
                    if let Err(e) = sink.publish(&namespace, &batch) {
                        warn!("metrics sink '{}' failed: {e}", sink.name());
                    }
                }
            });
        match spawned {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("cannot start metrics thread, metrics disabled: {e}");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            tx: None,
            handle: None,
        }
    }

    pub fn from_config(section: &MetricsSection) -> Self {
        match section.sink {
            MetricsSinkKind::None => Self::disabled(),
            MetricsSinkKind::Log => Self::spawn(Box::new(LogSink), section.namespace.clone()),
            MetricsSinkKind::Http => match section.endpoint.as_deref() {
                Some(endpoint) => {
                    Self::spawn(Box::new(HttpSink::new(endpoint)), section.namespace.clone())
                }
                None => {
                    warn!("http metrics sink configured without endpoint, metrics disabled");
                    Self::disabled()
                }
            },
        }
    }

    pub fn emit(&self, outcome: &ProvisionOutcome) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(outcome.metrics()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("metrics queue full, dropping outcome of {}", outcome.provision_id);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("metrics thread gone, dropping outcome of {}", outcome.provision_id);
            }
        }
    }
}

impl Drop for MetricsEmitter {
    fn drop(&mut self) {
        // Closing the channel ends the delivery loop after queued batches.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
