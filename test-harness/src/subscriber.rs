// Test harness subscriber: receives messages from a server.
use anyhow::{Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};
use tern_client::{Client, ClientConfig, ClientEvent, SubscribeOptions};
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tern-sub")]
#[command(about = "Test harness subscriber for tern pub/sub")]
struct Args {
    /// Server url, e.g. nats://127.0.0.1:4222 or tls://host:4443
    #[arg(long, default_value = "nats://127.0.0.1:4222")]
    url: String,

    /// Subject pattern; `*` and `>` wildcards are allowed
    #[arg(long, default_value = "bench.>")]
    subject: String,

    /// Queue group to join
    #[arg(long)]
    queue: Option<String>,

    /// Stop after this many messages (0 = unlimited)
    #[arg(long, default_value = "0")]
    count: u64,

    /// Subscriber ID for logging
    #[arg(long, default_value = "sub-1")]
    id: String,

    /// Timeout for receiving messages in seconds (0 = no timeout)
    #[arg(long, default_value = "60")]
    timeout: u64,

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
        queue = ?args.queue,
        "Starting subscriber"
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

    let mut events = client.events();
    let id = args.id.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Disconnect => warn!(id = %id, "Disconnected"),
                ClientEvent::Reconnecting { attempt } => info!(id = %id, attempt, "Reconnecting"),
                ClientEvent::Reconnect => info!(id = %id, "Reconnected"),
                ClientEvent::Error(err) => warn!(id = %id, error = %err, "Client error"),
                ClientEvent::Closed => break,
                _ => {}
            }
        }
    });

    let options = SubscribeOptions {
        queue: args.queue.clone(),
        max: (args.count > 0).then_some(args.count),
    };
    let mut subscription = client
        .subscribe_channel(&args.subject, options)
        .context("subscribe")?;
    client.flush().await.context("confirm subscription")?;
    info!(id = %args.id, sid = %subscription.sid(), "Subscribed");

    let start_time = Instant::now();
    let mut received = 0u64;
    let timeout_duration = if args.timeout > 0 {
        Some(Duration::from_secs(args.timeout))
    } else {
        None
    };

    loop {
        let result = if let Some(timeout_dur) = timeout_duration {
            timeout(timeout_dur, subscription.next_message()).await
        } else {
            Ok(subscription.next_message().await)
        };

        match result {
            Ok(Some(message)) => {
                received += 1;
                if received % 1000 == 0 {
                    let elapsed = start_time.elapsed();
                    let rate = received as f64 / elapsed.as_secs_f64();
                    info!(
                        id = %args.id,
                        received = received,
                        rate = format!("{:.2}", rate),
                        subject = %message.subject,
                        payload_size = message.payload.len(),
                        "Receiving progress"
                    );
                }
            }
            Ok(None) => {
                info!(id = %args.id, "Subscription ended");
                break;
            }
            Err(_) => {
                warn!(id = %args.id, "Timeout waiting for message, stopping");
                break;
            }
        }
    }

    client.close().await;

    let elapsed = start_time.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        received as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        id = %args.id,
        received = received,
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", rate),
        "Subscriber completed"
    );

    Ok(())
}
