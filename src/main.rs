//! Command-line interface for kafka-listener
//!
//! # Usage Examples
//!
//! ```bash
//! # Check a listener file and print the resolved consumer settings
//! kafka-listener validate --config listeners.yaml
//!
//! # Run the listeners, logging statuses every 30 seconds
//! RUST_LOG=info kafka-listener run \
//!   --config listeners.toml \
//!   --brokers kafka-1:9092,kafka-2:9092 \
//!   --status-interval 30s
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kafka_listener::config::parse_duration;
use kafka_listener::{run_until, ListenerFile};
use kafka_listener_rdkafka::KafkaClientFactory;

#[derive(Parser)]
#[command(name = "kafka-listener")]
#[command(about = "Runs Kafka listener containers declared in a listener file")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every listener and run until Ctrl-C
    Run {
        /// Listener file (.yaml, .yml or .toml)
        #[arg(long, env = "KAFKA_LISTENER_CONFIG")]
        config: PathBuf,

        /// Kafka brokers, overriding `kafka.brokers` of the listener file
        #[arg(long, env = "KAFKA_BROKERS")]
        brokers: Option<String>,

        /// Status logging interval, overriding `status_interval` (e.g. "30s", "5m")
        #[arg(long)]
        status_interval: Option<String>,
    },
    /// Validate a listener file and print the resolved endpoint settings
    Validate {
        /// Listener file (.yaml, .yml or .toml)
        #[arg(long, env = "KAFKA_LISTENER_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing, `info` unless RUST_LOG says otherwise
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            brokers,
            status_interval,
        } => run_listeners(config, brokers, status_interval).await,
        Commands::Validate { config } => validate(config),
    }
}

async fn run_listeners(
    config: PathBuf,
    brokers: Option<String>,
    status_interval: Option<String>,
) -> anyhow::Result<()> {
    let mut file = ListenerFile::from_file(&config)?;
    if let Some(brokers) = brokers {
        file.kafka.brokers = brokers;
    }
    if let Some(interval) = status_interval {
        // fail fast on a malformed flag
        parse_duration(&interval)?;
        file.status_interval = Some(interval);
    }
    tracing::info!(
        "Loaded {} listeners from {} (brokers {})",
        file.listeners.len(),
        config.display(),
        file.kafka.brokers
    );

    let broker = Arc::new(KafkaClientFactory::new(file.kafka.clone()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
        }
    };
    let reports = run_until(&file, broker, shutdown).await?;

    let abandoned: usize = reports.iter().map(|(_, report)| report.abandoned).sum();
    if abandoned > 0 {
        anyhow::bail!("{abandoned} sub-units did not stop before the shutdown timeout");
    }
    tracing::info!("All listener containers stopped");
    Ok(())
}

fn validate(config: PathBuf) -> anyhow::Result<()> {
    let file = ListenerFile::from_file(&config)?;
    let broker = Arc::new(KafkaClientFactory::new(file.kafka.clone()));
    let resolved = file.resolve(broker)?;
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    eprintln!(
        "{}: {} listeners OK",
        config.display(),
        resolved.len()
    );
    Ok(())
}
