use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::{ConfigError, RouterError};
use super::policy::{LoadAwareSelector, RotatingSelector, SelectionPolicy};
use super::poller::{LoadTable, MetricsPoller};
use super::proxy;
use super::registry::EndpointRegistry;
use super::types::{EndpointRef, LbConfig, PolicyKind};

/// Model-aware load balancer for OpenAI-compatible replicas.
///
/// Owns the endpoint registry, the active selection policy and, in load-aware
/// mode, the load table the metrics poller writes into. All of it is built
/// once from [`LbConfig`] and handed to the HTTP layer explicitly.
pub struct LoadBalancer {
    config: LbConfig,
    client: Client,
    registry: Arc<EndpointRegistry>,
    policy: Arc<dyn SelectionPolicy>,
    loads: Option<Arc<LoadTable>>,
}

impl LoadBalancer {
    pub fn new(config: LbConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(EndpointRegistry::from_specs(
            &config.models,
            config.expected_endpoints,
        )?);

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let (policy, loads): (Arc<dyn SelectionPolicy>, Option<Arc<LoadTable>>) =
            match config.policy {
                PolicyKind::RoundRobin => {
                    (Arc::new(RotatingSelector::new(Arc::clone(&registry))), None)
                }
                PolicyKind::LoadAware => {
                    let loads = Arc::new(LoadTable::new(registry.endpoint_count()));
                    let selector = LoadAwareSelector::new(Arc::clone(&registry), Arc::clone(&loads));
                    (Arc::new(selector), Some(loads))
                }
            };

        Ok(Self {
            config,
            client,
            registry,
            policy,
            loads,
        })
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn load_table(&self) -> Option<&Arc<LoadTable>> {
        self.loads.as_ref()
    }

    /// Pick a replica for `model` with the active policy
    pub fn select(&self, model: &str) -> Result<EndpointRef, RouterError> {
        self.policy.select(model)
    }

    /// Poller feeding this balancer's load table, if the policy needs one
    pub fn metrics_poller(&self) -> Result<Option<MetricsPoller>, ConfigError> {
        match &self.loads {
            Some(loads) => Ok(Some(MetricsPoller::new(
                Arc::clone(&self.registry),
                Arc::clone(loads),
                &self.config,
            )?)),
            None => Ok(None),
        }
    }

    /// Route one completion request: extract the model, select, forward.
    pub async fn dispatch(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, RouterError> {
        let (model, stream) = extract_routing_fields(&body)?;
        let endpoint = self.policy.select(&model)?;
        proxy::forward(&self.client, &model, endpoint, path, headers, body, stream).await
    }

    /// Create the Axum router with all endpoints
    pub fn create_router(self) -> Router {
        let max_payload_size = self.config.max_payload_size;
        let shared_state = Arc::new(self);

        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(get_endpoint_loads))
            .route("/v1/models", get(get_models))
            .route("/v1/chat/completions", post(handle_chat_completions))
            .route("/v1/completions", post(handle_completions))
            .layer(DefaultBodyLimit::max(max_payload_size))
            .with_state(shared_state)
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// The metrics poller, when present, starts before the first request is
    /// accepted and is cancelled and joined after the server drains.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RouterError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let poller = self.metrics_poller()?.map(|p| p.spawn(cancel.clone()));

        let app = self.create_router();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;

        cancel.cancel();
        if let Some(handle) = poller {
            if let Err(e) = handle.await {
                warn!("Metrics poller exited abnormally: {}", e);
            }
        }

        served.map_err(RouterError::from)
    }

    /// Start the load balancer server
    pub async fn start(self) -> Result<(), RouterError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(
            "Starting load balancer on {} with {} policy",
            addr,
            self.policy.name()
        );
        self.config.log_summary();

        let listener = TcpListener::bind(&addr).await?;
        info!("Load balancer listening on {}", addr);
        self.serve(listener, shutdown_signal()).await?;

        info!("Load balancer stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

/// Pull `model` and `stream` out of an OpenAI-style request body.
/// The body itself is forwarded untouched.
fn extract_routing_fields(body: &[u8]) -> Result<(String, bool), RouterError> {
    let request: Value = serde_json::from_slice(body)
        .map_err(|e| RouterError::InvalidRequest(format!("body is not valid JSON: {}", e)))?;

    let model = request
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RouterError::InvalidRequest("missing 'model' field".to_string()))?;
    let is_stream = request
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok((model.to_string(), is_stream))
}

// ===== HTTP Endpoint Handlers =====

async fn health_check(State(lb): State<Arc<LoadBalancer>>) -> Json<Value> {
    let registry = lb.registry();
    let mut body = json!({
        "status": "healthy",
        "policy": lb.policy_name(),
        "models": registry.model_count(),
        "endpoints": registry.endpoint_count(),
    });
    // Read from the poller's table; backends are never contacted here
    if let Some(loads) = lb.load_table() {
        body["healthy_endpoints"] = json!(loads.healthy_count());
    }
    Json(body)
}

async fn get_models(State(lb): State<Arc<LoadBalancer>>) -> Json<Value> {
    let data: Vec<Value> = lb
        .registry()
        .routes()
        .iter()
        .map(|route| {
            json!({
                "id": route.model_name,
                "object": "model",
                "owned_by": "replica-router",
                "replicas": route.replicas.len(),
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

async fn get_endpoint_loads(State(lb): State<Arc<LoadBalancer>>) -> Json<Value> {
    let endpoints: Vec<Value> = lb
        .registry()
        .endpoints()
        .map(|(model, endpoint)| {
            let view = lb.load_table().and_then(|loads| loads.view(endpoint.slot));
            json!({
                "model": model,
                "index": endpoint.index,
                "base_url": endpoint.base_url,
                "queue_depth": view.as_ref().and_then(|v| v.queue_depth),
                "age_ms": view.as_ref().and_then(|v| v.age_ms),
                "consecutive_failures": view.as_ref().map(|v| v.consecutive_failures),
                "last_error": view.and_then(|v| v.last_error),
            })
        })
        .collect();

    Json(json!({
        "policy": lb.policy_name(),
        "endpoints": endpoints,
    }))
}

async fn handle_chat_completions(
    State(lb): State<Arc<LoadBalancer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    route_request(lb, "/v1/chat/completions", headers, body).await
}

async fn handle_completions(
    State(lb): State<Arc<LoadBalancer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    route_request(lb, "/v1/completions", headers, body).await
}

async fn route_request(
    lb: Arc<LoadBalancer>,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match lb.dispatch(path, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            if matches!(e, RouterError::UnknownModel(_) | RouterError::InvalidRequest(_)) {
                warn!("Rejected request to {}: {}", path, e);
            }
            e.into_response()
        }
    }
}
