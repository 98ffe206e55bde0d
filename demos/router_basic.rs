//! Basic example of running the load balancer in front of vLLM replicas
//!
//! Three models with two replicas each, routed by least queue depth.
//!
//! Usage:
//!   cargo run --example router_basic

use replica_router::lb::{LbConfig, LoadBalancer, ModelSpec, PolicyKind};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let replicas = |ports: [u16; 2]| -> Vec<String> {
        ports
            .iter()
            .map(|p| format!("http://localhost:{}", p))
            .collect()
    };

    let mut config = LbConfig::new(
        "0.0.0.0".to_string(),
        8080,
        vec![
            ModelSpec::new("meta-llama/Llama-3.1-8B-Instruct", replicas([8001, 8002])),
            ModelSpec::new("Qwen/Qwen2.5-7B-Instruct", replicas([8003, 8004])),
            ModelSpec::new("meta-llama/Llama-3.3-70B-Instruct", replicas([8005, 8006])),
        ],
        PolicyKind::LoadAware,
    );
    // Refuse to start unless all six replicas are wired in
    config.expected_endpoints = Some(6);
    config.poll_interval_ms = 500;

    let lb = LoadBalancer::new(config)?;

    println!("Available endpoints:");
    println!("  - GET  /health");
    println!("  - GET  /metrics");
    println!("  - GET  /v1/models");
    println!("  - POST /v1/chat/completions");
    println!("  - POST /v1/completions");

    lb.start().await?;

    Ok(())
}
