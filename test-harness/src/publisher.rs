// Test harness publisher: publishes messages to a server at a configured rate.
use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};
use tern_client::{Client, ClientConfig};
use tokio::time::sleep;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tern-pub")]
#[command(about = "Test harness publisher for tern pub/sub")]
struct Args {
    /// Server url, e.g. nats://127.0.0.1:4222 or tls://host:4443
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    url: String,

    /// Subject to publish on
    #[arg(long, default_value = "bench.events")]
    subject: String,

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "100")]
    rate: u64,

    /// Total number of messages to publish (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Publisher ID for logging
    #[arg(long, default_value = "pub-1")]
    id: String,

    /// PEM file with the CA that signed the server certificate
    #[arg(long)]
    ca_file: Option<String>,

    /// Accept a server certificate that fails verification
    #[arg(long, default_value = "false")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        id = %args.id,
        url = %args.url,
        subject = %args.subject,
        payload_size = args.payload_size,
        rate = args.rate,
        count = args.count,
        "Starting publisher"
    );

    let mut config = ClientConfig::from_env_or_yaml(None)?;
    config.apply_url(&args.url)?;
    config.name = Some(args.id.clone());
    if let Some(ca_file) = &args.ca_file {
        let pem = std::fs::read(ca_file).with_context(|| format!("read {ca_file}"))?;
        let tls = config.tls.take().unwrap_or_default().with_ca_pem(pem);
        config.tls = Some(tls);
    }
    if args.insecure {
        let tls = config.tls.take().unwrap_or_default();
        config.tls = Some(tls.reject_unauthorized(false));
    }

    info!(id = %args.id, addr = %config.address(), "Connecting to server");
    let client = Client::connect(config)
        .await
        .context("connect to server")?;
    info!(id = %args.id, authorized = ?client.authorized(), "Connected to server");

    let payload = bytes::Bytes::from(vec![b'x'; args.payload_size]);

    let delay = if args.rate > 0 {
        Some(Duration::from_micros(1_000_000 / args.rate))
    } else {
        None
    };

    let start_time = Instant::now();
    let mut published = 0u64;
    let mut errors = 0u64;

    loop {
        if args.count > 0 && published >= args.count {
            break;
        }

        match client.publish(&args.subject, payload.clone()) {
            Ok(()) => {
                published += 1;
                if published % 1000 == 0 {
                    let elapsed = start_time.elapsed();
                    let rate = published as f64 / elapsed.as_secs_f64();
                    info!(
                        id = %args.id,
                        published = published,
                        errors = errors,
                        rate = format!("{:.2}", rate),
                        "Publishing progress"
                    );
                }
            }
            Err(e) => {
                errors += 1;
                if errors % 100 == 0 {
                    error!(id = %args.id, error = %e, errors = errors, "Publish error");
                }
                if client.is_closed() {
                    break;
                }
            }
        }

        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }

    if let Err(e) = client.flush_timeout(Duration::from_secs(10)).await {
        error!(id = %args.id, error = %e, "Final flush failed");
    }
    client.close().await;

    let elapsed = start_time.elapsed();
    let rate = published as f64 / elapsed.as_secs_f64();
    info!(
        id = %args.id,
        published = published,
        errors = errors,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", rate),
        "Publisher completed"
    );

    Ok(())
}
