#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use replica_router::lb::{LbConfig, LoadBalancer, ModelSpec, PolicyKind};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Delay between the first and the final chunk of a streamed answer
pub const STREAM_TAIL_DELAY: Duration = Duration::from_millis(600);

/// Time the "slow" model waits before answering
pub const SLOW_REPLY_DELAY: Duration = Duration::from_secs(3);

/// Interval between chunks of the never-ending "drip" stream
pub const DRIP_INTERVAL: Duration = Duration::from_millis(100);

/// In-process stand-in for one model server replica.
///
/// Request bodies pick the behavior by model name: "overloaded" answers 429,
/// "slow" answers after [`SLOW_REPLY_DELAY`], "drip" streams until the
/// connection goes away.
pub struct StubBackend {
    pub name: String,
    pub url: String,
    pub completions: Arc<AtomicUsize>,
    pub queue_depth: Arc<RwLock<String>>,
    pub metrics_failing: Arc<AtomicBool>,
    pub drip_dropped: Arc<AtomicBool>,
}

impl StubBackend {
    pub fn hits(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn set_queue_depth(&self, value: &str) {
        *self.queue_depth.write() = value.to_string();
    }

    /// Make `/metrics` answer 500 from now on
    pub fn fail_metrics(&self) {
        self.metrics_failing.store(true, Ordering::SeqCst);
    }

    /// Whether a "drip" stream body has been torn down
    pub fn drip_dropped(&self) -> bool {
        self.drip_dropped.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct StubState {
    name: String,
    completions: Arc<AtomicUsize>,
    queue_depth: Arc<RwLock<String>>,
    metrics_failing: Arc<AtomicBool>,
    drip_dropped: Arc<AtomicBool>,
}

/// Flags the owning stream body as dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub async fn spawn_backend(name: &str) -> StubBackend {
    let state = StubState {
        name: name.to_string(),
        completions: Arc::new(AtomicUsize::new(0)),
        queue_depth: Arc::new(RwLock::new("0.0".to_string())),
        metrics_failing: Arc::new(AtomicBool::new(false)),
        drip_dropped: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(stub_completion))
        .route("/v1/completions", post(stub_completion))
        .route("/metrics", get(stub_metrics))
        .with_state(state.clone());

    let url = spawn_app(app).await;
    StubBackend {
        name: name.to_string(),
        url,
        completions: state.completions,
        queue_depth: state.queue_depth,
        metrics_failing: state.metrics_failing,
        drip_dropped: state.drip_dropped,
    }
}

async fn stub_completion(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    state.completions.fetch_add(1, Ordering::SeqCst);

    let model = request.get("model").and_then(|m| m.as_str());
    match model {
        Some("overloaded") => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": { "message": "queue full" } })),
            )
                .into_response();
        }
        Some("slow") => tokio::time::sleep(SLOW_REPLY_DELAY).await,
        Some("drip") => {
            let guard = DropFlag(Arc::clone(&state.drip_dropped));
            let chunks = futures_util::stream::unfold((0u64, guard), |(n, guard)| async move {
                if n > 0 {
                    tokio::time::sleep(DRIP_INTERVAL).await;
                }
                let chunk = Bytes::from(format!("data: {}\n\n", n));
                Some((Ok::<_, Infallible>(chunk), (n + 1, guard)))
            });
            return Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(chunks))
                .unwrap();
        }
        _ => {}
    }

    if request.get("stream").and_then(|s| s.as_bool()).unwrap_or(false) {
        let first = format!("data: {{\"backend\":\"{}\"}}\n\n", state.name);
        let chunks = futures_util::stream::unfold(0u8, move |step| {
            let first = first.clone();
            async move {
                match step {
                    0 => Some((Ok::<_, Infallible>(Bytes::from(first)), 1)),
                    1 => {
                        tokio::time::sleep(STREAM_TAIL_DELAY).await;
                        Some((Ok(Bytes::from_static(b"data: [DONE]\n\n")), 2))
                    }
                    _ => None,
                }
            }
        });

        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(chunks))
            .unwrap();
    }

    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "backend": state.name,
        "model": request.get("model").cloned().unwrap_or(Value::Null),
        "authorization": authorization,
    }))
    .into_response()
}

async fn stub_metrics(State(state): State<StubState>) -> Response {
    if state.metrics_failing.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "engine dead").into_response();
    }
    format!(
        "# HELP vllm:num_requests_waiting Number of requests waiting to be processed.\n\
         # TYPE vllm:num_requests_waiting gauge\n\
         vllm:num_requests_waiting{{model_name=\"{}\"}} {}\n",
        state.name,
        state.queue_depth.read()
    )
    .into_response()
}

pub async fn spawn_app(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A URL nothing listens on
pub async fn dead_url() -> String {
    dead_urls(1).await.remove(0)
}

/// `n` distinct URLs nothing listens on
pub async fn dead_urls(n: usize) -> Vec<String> {
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    listeners
        .iter()
        .map(|l| format!("http://{}", l.local_addr().unwrap()))
        .collect()
}

pub fn config(models: Vec<(&str, Vec<String>)>, policy: PolicyKind) -> LbConfig {
    let models = models
        .into_iter()
        .map(|(name, urls)| ModelSpec::new(name, urls))
        .collect();
    let mut config = LbConfig::new("127.0.0.1".to_string(), 0, models, policy);
    config.request_timeout_secs = 10;
    config.poll_interval_ms = 50;
    config.metrics_timeout_ms = 500;
    config
}

/// A running router plus the handle to stop it
pub struct RunningRouter {
    pub url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RunningRouter {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("router did not shut down")
            .unwrap();
    }
}

pub async fn spawn_router(config: LbConfig) -> RunningRouter {
    let lb = LoadBalancer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        lb.serve(listener, async move {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    RunningRouter {
        url: format!("http://{}", addr),
        shutdown: Some(tx),
        handle,
    }
}

pub fn chat_request(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": "What is the capital of France?" }],
        "max_tokens": 16,
        "stream": stream,
    })
}
