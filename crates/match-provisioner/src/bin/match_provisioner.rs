//! Match Provisioner Service
//!
//! Consumes match requests from RabbitMQ and starts a game-server pod plus a
//! `NodePort` service for each one.
//!
//! # Environment Variables
//!
//! - `PROVISIONER_CONFIG` - YAML configuration file (optional)
//! - `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USERNAME`, `RABBITMQ_PASSWORD`,
//!   `RABBITMQ_VHOST`, `RABBITMQ_QUEUE` - broker overrides
//! - `K8S_NAMESPACE`, `KUBECONFIG`, `GAME_SERVER_IMAGE` - cluster overrides
//! - `RUST_LOG` - log filter (default `info`)

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::TryStreamExt;
use match_provisioner::{
    BrokerConnection, ClusterApi, Dispatcher, KubeCluster, PortAllocator, Provisioner,
    ProvisionerConfig, RandomPorts,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Provision game servers for match requests
#[derive(Parser)]
#[command(name = "match-provisioner")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, env = "PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<ProvisionerConfig> {
    let config = match path {
        Some(path) => {
            let config = ProvisionerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            info!("Loaded provisioner configuration from {}", path.display());
            config
        }
        None => {
            info!("No configuration file given, using defaults");
            ProvisionerConfig::default()
        }
    };

    let config = config.with_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        "Starting match provisioner v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_config(cli.config.as_deref())?;
    info!(
        namespace = %config.cluster.namespace,
        image = %config.cluster.image,
        queue = %config.broker.queue,
        "Configuration ready"
    );

    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubeCluster::connect(&config.cluster)
            .await
            .context("building Kubernetes client")?,
    );
    info!("Connected to Kubernetes cluster");

    let allocator = PortAllocator::new(
        Arc::clone(&cluster),
        &config.ports,
        Box::new(RandomPorts::from_entropy()),
    );
    let provisioner = Arc::new(Provisioner::new(
        cluster,
        allocator,
        config.cluster.clone(),
    ));

    // Without a broker there is nothing to do; exhaustion ends the process.
    let broker = BrokerConnection::establish(&config.broker, &config.connect)
        .await
        .context("connecting to broker")?;
    let consumer = broker.consume(&config.broker.consumer_tag).await?;

    let deliveries = consumer.map_ok(|delivery| delivery.data);
    match Dispatcher::new(provisioner)
        .run_until(deliveries, shutdown_signal())
        .await
    {
        Ok(summary) => {
            info!(dispatched = summary.dispatched, "Consumer stopped");
        }
        Err(e) => {
            error!(error = %e, "Dispatcher failed");
            return Err(e.into());
        }
    }

    if let Err(e) = broker.close().await {
        warn!(error = %e, "Failed to close broker connection cleanly");
    }
    info!("Match provisioner stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
