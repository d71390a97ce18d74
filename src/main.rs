//! CLI for mqclient
//!
//! Subcommands:
//! - `publish`: send payloads and wait for each confirmation
//! - `consume`: print and acknowledge deliveries for a device until Ctrl-C

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use mqclient::{AmqpConnector, LogContext, MqClient, TracingSink, load_options};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqclient")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, default_value = "config/mq.yml")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish each payload in order
    Publish {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        routing_key: String,
        /// Per-message TTL
        #[arg(long, default_value_t = 60_000)]
        expiration_ms: u64,
        #[arg(required = true)]
        payloads: Vec<String>,
    },
    /// Consume the queue of one device
    Consume {
        #[arg(long)]
        device: String,
        /// Drop and re-declare the queue before consuming
        #[arg(long)]
        fresh: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    mqclient::utils::logging::init(&cli.log_level);

    let result = match cli.command {
        Command::Publish {
            exchange,
            routing_key,
            expiration_ms,
            payloads,
        } => {
            run_publish(
                &cli.config,
                &exchange,
                &routing_key,
                Duration::from_millis(expiration_ms),
                payloads,
            )
            .await
        }
        Command::Consume { device, fresh } => run_consume(&cli.config, &device, fresh).await,
    };

    if let Err(e) = result {
        error!("mqclient failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_publish(
    config: &Path,
    exchange: &str,
    routing_key: &str,
    expiration: Duration,
    payloads: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = load_options(config)?;
    let client = MqClient::publisher(&AmqpConnector, &options, Arc::new(TracingSink)).await?;

    let mut outcome = Ok(());
    for payload in payloads {
        let ctx = LogContext::new();
        match client
            .publish(&ctx, exchange, routing_key, expiration, payload)
            .await
        {
            Ok(()) => info!(correlation_id = ctx.correlation_id(), "published"),
            Err(e) => {
                error!(correlation_id = ctx.correlation_id(), "publish failed: {}", e);
                outcome = Err(e);
            }
        }
    }

    client.close().await?;
    outcome.map_err(Into::into)
}

async fn run_consume(
    config: &Path,
    device: &str,
    fresh: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = load_options(config)?;
    let client = MqClient::consumer(&AmqpConnector, &options, device, Arc::new(TracingSink)).await?;
    if fresh {
        client.init_queue(true).await?;
    }

    client
        .consume(&LogContext::new(), |mut deliveries, done| async move {
            let mut outcome = Ok(());
            while let Some(delivery) = deliveries.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                };
                println!(
                    "[{}] {}",
                    delivery.routing_key,
                    String::from_utf8_lossy(&delivery.body)
                );
                if let Err(e) = delivery.ack().await {
                    outcome = Err(e);
                    break;
                }
            }
            let _ = done.send(outcome);
        })
        .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received. Exiting gracefully."),
        _ = client.cancelled() => error!("Client cancelled by the broker."),
    }

    client.close().await?;
    Ok(())
}
