use clap::Parser;
use replica_router::lb::{
    ConfigError, LbConfig, LoadBalancer, ModelSpec, PolicyKind, DEFAULT_QUEUE_METRIC,
};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "replica-router")]
#[command(version, about = "Model-aware load balancer for OpenAI-compatible inference replicas")]
#[command(long_about = r#"
Routes /v1/chat/completions and /v1/completions to one replica of the requested
model and streams the answer back.

Examples:
  # Round-robin across two replicas per model
  replica-router \
    --model meta-llama/Llama-3.1-8B-Instruct=http://10.0.0.1:8000,http://10.0.0.2:8000 \
    --model Qwen/Qwen2.5-7B-Instruct=http://10.0.0.3:8000,http://10.0.0.4:8000 \
    --expected-endpoints 4

  # Least queue depth, refreshed every 500ms
  replica-router --policy load_aware --poll-interval-ms 500 \
    --model meta-llama/Llama-3.1-8B-Instruct=http://10.0.0.1:8000,http://10.0.0.2:8000
"#)]
struct CliArgs {
    #[arg(long, env = "ROUTER_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "ROUTER_PORT", default_value_t = 8000)]
    port: u16,

    /// NAME=URL[,URL...]; replica order is significant
    #[arg(long = "model", env = "ROUTER_MODELS", value_delimiter = ';', required = true)]
    models: Vec<ModelSpec>,

    /// Fail at startup unless exactly this many endpoints are configured
    #[arg(long, env = "ROUTER_EXPECTED_ENDPOINTS")]
    expected_endpoints: Option<usize>,

    #[arg(long, env = "ROUTER_POLICY", default_value = "round_robin", value_parser = ["round_robin", "load_aware"])]
    policy: String,

    #[arg(long, env = "METRICS_POLL_INTERVAL_MS", default_value_t = 1000)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 5000)]
    metrics_timeout_ms: u64,

    #[arg(long, default_value = "/metrics")]
    metrics_path: String,

    #[arg(long, default_value = DEFAULT_QUEUE_METRIC)]
    queue_metric: String,

    #[arg(long, default_value_t = 300)]
    request_timeout_secs: u64,

    #[arg(long, default_value_t = 268435456)]
    max_payload_size: usize,

    /// Ignored when RUST_LOG is set
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,
}

impl CliArgs {
    fn to_config(&self) -> Result<LbConfig, ConfigError> {
        Ok(LbConfig {
            host: self.host.clone(),
            port: self.port,
            models: self.models.clone(),
            expected_endpoints: self.expected_endpoints,
            policy: self.policy.parse::<PolicyKind>()?,
            poll_interval_ms: self.poll_interval_ms,
            metrics_timeout_ms: self.metrics_timeout_ms,
            metrics_path: self.metrics_path.clone(),
            queue_metric: self.queue_metric.clone(),
            request_timeout_secs: self.request_timeout_secs,
            max_payload_size: self.max_payload_size,
        })
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("replica_router={}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let lb = match args.to_config().and_then(LoadBalancer::new) {
        Ok(lb) => lb,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = lb.start().await {
        error!("Load balancer failed: {}", e);
        std::process::exit(1);
    }
}
