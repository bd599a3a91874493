mod telemetry;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use telemetry::{generate_batch, AckRequest, HeartbeatRequest, PollResponse, ReadingsRequest};
use tracing::{debug, error, info, warn};

const DEVICE_KEY_HEADER: &str = "x-device-key";

/// Simulated field device talking to the coordinator over HTTP.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    /// Coordinator base URL
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080")]
    url: String,

    #[arg(long, env = "DEVICE_ID")]
    device_id: String,

    #[arg(long, env = "DEVICE_KEY")]
    device_key: String,

    /// Seconds between device cycles
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval_secs: u64,

    /// Commands requested per poll
    #[arg(long, env = "MAX_BATCH", default_value_t = 10)]
    max_batch: usize,

    /// Probability of failing a command instead of applying it
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.05)]
    failure_rate: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!("Starting device simulator");
    info!(
        "Coordinator: {}, device: {}, interval: {}s",
        args.url, args.device_id, args.interval_secs
    );

    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building HTTP client")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_cycle(&client, &args).await {
                    error!("Device cycle failed: {:#}", e);
                }
                cycles += 1;
                if cycles % 100 == 0 {
                    info!("Completed {} cycles", cycles);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

async fn run_cycle(client: &Client, args: &Args) -> anyhow::Result<()> {
    let response = client
        .post(format!("{}/api/v1/device/heartbeat", args.url))
        .header(DEVICE_KEY_HEADER, &args.device_key)
        .json(&HeartbeatRequest { device_id: &args.device_id })
        .send()
        .await
        .context("sending heartbeat")?;
    debug!("Heartbeat: {}", response.status());

    let batch = {
        let mut rng = rand::thread_rng();
        generate_batch(&mut rng)
    };
    let response = client
        .post(format!("{}/api/v1/device/readings", args.url))
        .header(DEVICE_KEY_HEADER, &args.device_key)
        .json(&ReadingsRequest { device_id: &args.device_id, batch })
        .send()
        .await
        .context("posting readings")?;
    match response.status() {
        StatusCode::OK => debug!("Readings accepted"),
        StatusCode::BAD_REQUEST => warn!("Readings rejected: {}", response.text().await.unwrap_or_default()),
        other => warn!("Unexpected status posting readings: {}", other),
    }

    let max_batch = args.max_batch.to_string();
    let polled: PollResponse = client
        .get(format!("{}/api/v1/device/commands", args.url))
        .header(DEVICE_KEY_HEADER, &args.device_key)
        .query(&[("device_id", args.device_id.as_str()), ("max_batch", max_batch.as_str())])
        .send()
        .await
        .context("polling commands")?
        .error_for_status()?
        .json()
        .await
        .context("decoding poll response")?;

    for command in polled.commands {
        info!("Executing command {} (expires {}): {}", command.id, command.expires_at, command.payload);
        let failed = rand::thread_rng().gen_bool(args.failure_rate.clamp(0.0, 1.0));
        let result = if failed { "error: simulated failure" } else { "ok" };

        let response = client
            .put(format!("{}/api/v1/device/commands/{}", args.url, command.id))
            .header(DEVICE_KEY_HEADER, &args.device_key)
            .json(&AckRequest {
                device_id: &args.device_id,
                result: Some(result.to_string()),
            })
            .send()
            .await
            .context("acknowledging command")?;
        if !response.status().is_success() {
            warn!("Acknowledge of {} returned {}", command.id, response.status());
        }
    }

    Ok(())
}
