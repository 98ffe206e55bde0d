//! Background queue-depth polling for the load-aware selector.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ConfigError, PollError};
use super::registry::EndpointRegistry;
use super::types::{EndpointRef, LbConfig};

/// Latest queue-depth reading for one endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub queue_depth: f64,
    pub last_updated: Instant,
}

#[derive(Debug, Default)]
struct EndpointLoad {
    sample: Option<LoadSample>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Point-in-time view of one endpoint's load state
#[derive(Debug, Clone, Serialize)]
pub struct EndpointLoadView {
    pub queue_depth: Option<f64>,
    pub age_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Load samples indexed by endpoint slot.
///
/// One lock per entry; the poller is the only writer. A failed fetch leaves the
/// previous sample in place, so entries only ever go from empty to sampled.
#[derive(Debug)]
pub struct LoadTable {
    entries: Vec<RwLock<EndpointLoad>>,
}

impl LoadTable {
    pub fn new(endpoint_count: usize) -> Self {
        Self {
            entries: (0..endpoint_count)
                .map(|_| RwLock::new(EndpointLoad::default()))
                .collect(),
        }
    }

    pub fn sample(&self, slot: usize) -> Option<LoadSample> {
        self.entries.get(slot).and_then(|e| e.read().sample)
    }

    pub fn queue_depth(&self, slot: usize) -> Option<f64> {
        self.sample(slot).map(|s| s.queue_depth)
    }

    pub fn record_success(&self, slot: usize, queue_depth: f64) {
        if let Some(entry) = self.entries.get(slot) {
            let mut entry = entry.write();
            entry.sample = Some(LoadSample {
                queue_depth,
                last_updated: Instant::now(),
            });
            entry.consecutive_failures = 0;
            entry.last_error = None;
        }
    }

    /// Returns the consecutive failure count after this one
    pub fn record_failure(&self, slot: usize, error: &PollError) -> u32 {
        match self.entries.get(slot) {
            Some(entry) => {
                let mut entry = entry.write();
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.last_error = Some(error.to_string());
                entry.consecutive_failures
            }
            None => 0,
        }
    }

    pub fn view(&self, slot: usize) -> Option<EndpointLoadView> {
        self.entries.get(slot).map(|e| {
            let entry = e.read();
            EndpointLoadView {
                queue_depth: entry.sample.map(|s| s.queue_depth),
                age_ms: entry
                    .sample
                    .map(|s| s.last_updated.elapsed().as_millis() as u64),
                consecutive_failures: entry.consecutive_failures,
                last_error: entry.last_error.clone(),
            }
        })
    }

    /// Endpoints holding a sample whose latest poll succeeded
    pub fn healthy_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                let entry = e.read();
                entry.sample.is_some() && entry.consecutive_failures == 0
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract the queue-depth gauge from a line-oriented metrics payload.
///
/// Comment lines are skipped. A line matches when it starts with `metric`
/// followed by a label set or whitespace; the value is its last token. When
/// several label sets match, the last one wins.
pub fn parse_queue_depth(body: &str, metric: &str) -> Result<f64, PollError> {
    let mut depth = None;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(rest) = line.strip_prefix(metric) else {
            continue;
        };
        if !rest.starts_with(['{', ' ', '\t']) {
            continue;
        }

        let token = line.split_whitespace().last().unwrap_or_default();
        let value: f64 = token.parse().map_err(|_| {
            PollError::MalformedMetricsPayload(format!(
                "non-numeric value '{}' for {}",
                token, metric
            ))
        })?;
        if !value.is_finite() {
            return Err(PollError::MalformedMetricsPayload(format!(
                "non-finite value '{}' for {}",
                token, metric
            )));
        }
        depth = Some(value);
    }

    depth.ok_or_else(|| PollError::MalformedMetricsPayload(format!("metric {} not found", metric)))
}

/// Outcome counts of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub updated: usize,
    pub failed: usize,
}

/// Periodically scrapes every endpoint and writes the results into a
/// [`LoadTable`]. Each endpoint is fetched concurrently under its own timeout,
/// so one dead backend cannot hold up the others.
pub struct MetricsPoller {
    registry: Arc<EndpointRegistry>,
    loads: Arc<LoadTable>,
    client: Client,
    interval: Duration,
    metrics_path: String,
    queue_metric: String,
}

impl MetricsPoller {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        loads: Arc<LoadTable>,
        config: &LbConfig,
    ) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.metrics_timeout())
            .connect_timeout(config.metrics_timeout())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            registry,
            loads,
            client,
            interval: config.poll_interval(),
            metrics_path: config.metrics_path.clone(),
            queue_metric: config.queue_metric.clone(),
        })
    }

    /// Run a single cycle across all endpoints
    pub async fn poll_once(&self) -> PollSummary {
        let fetches = self.registry.endpoints().map(|(model, endpoint)| async move {
            match self.fetch_queue_depth(endpoint).await {
                Ok(depth) => {
                    self.loads.record_success(endpoint.slot, depth);
                    true
                }
                Err(e) => {
                    let failures = self.loads.record_failure(endpoint.slot, &e);
                    warn!(
                        model = model,
                        endpoint = %endpoint.base_url,
                        consecutive_failures = failures,
                        error = %e,
                        "Metrics poll failed, keeping previous sample"
                    );
                    false
                }
            }
        });

        let results = join_all(fetches).await;
        let updated = results.iter().filter(|ok| **ok).count();
        PollSummary {
            updated,
            failed: results.len() - updated,
        }
    }

    async fn fetch_queue_depth(&self, endpoint: &EndpointRef) -> Result<f64, PollError> {
        let url = endpoint.url_for(&self.metrics_path);
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::MetricsFetchFailed(e.to_string()))?;

        if !res.status().is_success() {
            return Err(PollError::MetricsFetchFailed(format!(
                "status {}",
                res.status()
            )));
        }

        let body = res
            .text()
            .await
            .map_err(|e| PollError::MetricsFetchFailed(e.to_string()))?;
        parse_queue_depth(&body, &self.queue_metric)
    }

    /// Start polling until `cancel` fires. The first cycle runs immediately.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            endpoints = self.registry.endpoint_count(),
            interval_ms = self.interval.as_millis() as u64,
            metric = %self.queue_metric,
            "Metrics poller started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                summary = self.poll_once() => {
                    debug!(updated = summary.updated, failed = summary.failed, "Poll cycle complete");
                }
            }
        }

        info!("Metrics poller stopped");
    }
}
