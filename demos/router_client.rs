//! Example client for a running load balancer
//!
//! Usage:
//!   cargo run --example router_basic
//!   cargo run --example router_client

use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let lb_url = "http://localhost:8080";
    let model = "meta-llama/Llama-3.1-8B-Instruct";

    println!("Testing load balancer at {}", lb_url);

    println!("\n1. GET /health");
    let health = client.get(format!("{}/health", lb_url)).send().await?;
    println!("   Status: {}", health.status());

    println!("\n2. GET /v1/models");
    let models: serde_json::Value = client
        .get(format!("{}/v1/models", lb_url))
        .send()
        .await?
        .json()
        .await?;
    println!("   {}", serde_json::to_string_pretty(&models)?);

    println!("\n3. GET /metrics");
    let loads: serde_json::Value = client
        .get(format!("{}/metrics", lb_url))
        .send()
        .await?
        .json()
        .await?;
    println!("   {}", serde_json::to_string_pretty(&loads)?);

    println!("\n4. POST /v1/chat/completions (non-streaming)");
    let chat_request = json!({
        "model": model,
        "messages": [
            { "role": "system", "content": "You are a helpful assistant." },
            { "role": "user", "content": "What is the capital of France?" }
        ],
        "temperature": 0.7,
        "max_tokens": 100,
        "stream": false
    });
    match client
        .post(format!("{}/v1/chat/completions", lb_url))
        .json(&chat_request)
        .send()
        .await
    {
        Ok(res) => {
            println!("   Status: {}", res.status());
            println!("   {}", res.text().await?);
        }
        Err(e) => println!("   Error: {}", e),
    }

    println!("\n5. POST /v1/chat/completions (streaming)");
    let streaming_request = json!({
        "model": model,
        "messages": [{ "role": "user", "content": "Count from 1 to 5." }],
        "max_tokens": 50,
        "stream": true
    });
    match client
        .post(format!("{}/v1/chat/completions", lb_url))
        .json(&streaming_request)
        .send()
        .await
    {
        Ok(mut res) => {
            println!("   Status: {}", res.status());
            while let Some(chunk) = res.chunk().await? {
                print!("{}", String::from_utf8_lossy(&chunk));
            }
            println!();
        }
        Err(e) => println!("   Error: {}", e),
    }

    println!("\n6. Unknown model");
    let res = client
        .post(format!("{}/v1/chat/completions", lb_url))
        .json(&json!({ "model": "not-deployed", "messages": [] }))
        .send()
        .await?;
    println!("   Status: {} {}", res.status(), res.text().await?);

    Ok(())
}
