use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::ConfigError;

/// Queue-depth gauge exposed by vLLM backends.
pub const DEFAULT_QUEUE_METRIC: &str = "vllm:num_requests_waiting";

/// Replica selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Strict per-model round-robin, no load signal
    RoundRobin,
    /// Least queue depth as reported by each backend's metrics
    LoadAware,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::RoundRobin => "round_robin",
            PolicyKind::LoadAware => "load_aware",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(PolicyKind::RoundRobin),
            "load_aware" => Ok(PolicyKind::LoadAware),
            other => Err(ConfigError::InvalidValue {
                field: "policy",
                reason: format!("unknown policy '{}'", other),
            }),
        }
    }
}

/// One logical model and its replica URLs, in positional order.
///
/// Textual form is `NAME=URL1,URL2,...`. The name is split off at the first
/// `=`, so model names must not contain one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub urls: Vec<String>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            urls,
        }
    }
}

impl FromStr for ModelSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, urls) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::MalformedModelSpec(s.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::MalformedModelSpec(s.to_string()));
        }

        let urls = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self::new(name, urls))
    }
}

/// Configuration for the load balancer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LbConfig {
    /// Host to bind the load balancer server
    pub host: String,
    /// Port to bind the load balancer server
    pub port: u16,
    /// Logical models and their replicas
    pub models: Vec<ModelSpec>,
    /// Total endpoint count the deployment is expected to have
    pub expected_endpoints: Option<usize>,
    /// Replica selection strategy
    pub policy: PolicyKind,
    /// Interval between metrics poll cycles (load-aware only)
    pub poll_interval_ms: u64,
    /// Per-endpoint timeout for one metrics fetch
    pub metrics_timeout_ms: u64,
    /// Path of the backend metrics surface
    pub metrics_path: String,
    /// Name of the queue-depth metric
    pub queue_metric: String,
    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,
    /// Maximum accepted request body size in bytes
    pub max_payload_size: usize,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            models: Vec::new(),
            expected_endpoints: None,
            policy: PolicyKind::RoundRobin,
            poll_interval_ms: 1000,
            metrics_timeout_ms: 5000,
            metrics_path: "/metrics".to_string(),
            queue_metric: DEFAULT_QUEUE_METRIC.to_string(),
            request_timeout_secs: 300,
            max_payload_size: 256 * 1024 * 1024,
        }
    }
}

impl LbConfig {
    pub fn new(host: String, port: u16, models: Vec<ModelSpec>, policy: PolicyKind) -> Self {
        Self {
            host,
            port,
            models,
            policy,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn metrics_timeout(&self) -> Duration {
        Duration::from_millis(self.metrics_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Scalar checks. Registry shape is checked when the registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.policy == PolicyKind::LoadAware {
            if self.poll_interval_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "poll_interval_ms",
                    reason: "must be greater than 0".to_string(),
                });
            }
            if self.metrics_timeout_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "metrics_timeout_ms",
                    reason: "must be greater than 0".to_string(),
                });
            }
            if self.queue_metric.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "queue_metric",
                    reason: "must not be empty".to_string(),
                });
            }
            if !self.metrics_path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: "metrics_path",
                    reason: "must start with '/'".to_string(),
                });
            }
            if self.metrics_timeout_ms > self.poll_interval_ms.saturating_mul(10) {
                warn!(
                    metrics_timeout_ms = self.metrics_timeout_ms,
                    poll_interval_ms = self.poll_interval_ms,
                    "Metrics timeout is much longer than the poll interval, samples may lag"
                );
            }
        }

        Ok(())
    }

    pub fn log_summary(&self) {
        info!(
            policy = %self.policy,
            models = self.models.len(),
            endpoints = self.models.iter().map(|m| m.urls.len()).sum::<usize>(),
            "Load balancer configuration"
        );
        for model in &self.models {
            info!(model = %model.name, replicas = ?model.urls, "Model route");
        }
    }
}

/// A replica address plus its position.
///
/// `index` is the position inside the owning model's replica list and drives
/// rotation order and tie-breaking. `slot` is the position across the whole
/// registry and addresses the endpoint's load state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRef {
    pub base_url: String,
    pub index: usize,
    pub slot: usize,
}

impl EndpointRef {
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.base_url, self.index)
    }
}

/// A logical model and its replicas
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub model_name: String,
    pub replicas: Vec<EndpointRef>,
}

/// Why a proxied request did not complete normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BackendUnreachable,
    BackendTimeout,
    StreamInterrupted,
    ClientDisconnected,
}

/// Outcome of one proxied request, emitted to the log and then dropped.
#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub model: String,
    pub status_code: u16,
    pub bytes_forwarded: u64,
    pub selected_endpoint: EndpointRef,
    pub failure_kind: Option<FailureKind>,
    pub elapsed: Duration,
}

impl ProxyResult {
    pub fn record(&self) {
        match self.failure_kind {
            None => info!(
                model = %self.model,
                endpoint = %self.selected_endpoint,
                status = self.status_code,
                bytes = self.bytes_forwarded,
                elapsed_ms = self.elapsed.as_millis() as u64,
                "Request proxied"
            ),
            Some(kind) => warn!(
                model = %self.model,
                endpoint = %self.selected_endpoint,
                status = self.status_code,
                bytes = self.bytes_forwarded,
                elapsed_ms = self.elapsed.as_millis() as u64,
                failure = ?kind,
                "Request failed"
            ),
        }
    }
}
