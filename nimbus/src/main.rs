//! Standalone gateway daemon: shards in, broker out.

mod bridge;
mod config;
mod rest;

use crate::{
    bridge::BridgePublisher,
    config::{BrokerKind, Config, ShardStoreKind},
    rest::RestClient,
};
use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use nimbus_broker::{AmqpBroker, Broker, RedisBroker, StdioBroker};
use nimbus_gateway::{
    compression::CompressionAlgorithm,
    info::GatewayInfoProvider,
    metrics::MetricsCollector,
    store::{InMemorySessionStore, RedisSessionStore, SessionStore},
    Manager, ShardScheme,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};
use tokio::{signal, sync::watch, time};
use tracing_subscriber::EnvFilter;

/// Quantiles reported for the heartbeat ping summary.
const PING_QUANTILES: &[f64] = &[0.5, 0.9, 0.95, 0.99];

/// Initial delay between broker connection attempts.
const BROKER_RETRY_BASE: Duration = Duration::from_secs(5);

/// Upper bound on the broker connection retry delay.
const BROKER_RETRY_CAP: Duration = Duration::from_secs(80);

/// Connects to the Discord gateway and pumps events through a message broker.
#[derive(Debug, Parser)]
#[command(name = "nimbus", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "nimbus.toml")]
    config: PathBuf,

    /// Bot token, overriding the config file and environment.
    #[arg(short, long)]
    token: Option<String>,

    /// Broker URL, overriding the config file and environment.
    #[arg(short = 'u', long)]
    broker_url: Option<String>,

    /// Broker group, overriding the config file and environment.
    #[arg(short, long)]
    group: Option<String>,

    /// Total shard count, overriding the config file and environment.
    #[arg(short, long)]
    shard_count: Option<u32>,

    /// Log filter when RUST_LOG is unset, such as `info` or `nimbus=debug`.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(source) => {
            eprintln!("failed to start the runtime: {source}");

            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(source) => {
            tracing::error!("{source:#}");

            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(&cli.config)?;

    if let Some(token) = cli.token {
        config.token = token;
    }
    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }
    if let Some(group) = cli.group {
        config.broker.group = group;
    }
    if let Some(count) = cli.shard_count {
        config.shards.count = count;
    }

    config.validate()?;

    if let Some(address) = config.prometheus.address {
        PrometheusBuilder::new()
            .with_http_listener(address)
            .set_quantiles(PING_QUANTILES)
            .context("configuring metric quantiles")?
            .install()
            .context("installing the prometheus exporter")?;

        tracing::info!(%address, endpoint = %config.prometheus.endpoint, "serving metrics");
    }

    let store = build_store(&config).await?;
    let broker = connect_broker(&config).await;
    let message_timeout = config.message_timeout()?;

    let gateway_config = build_gateway_config(&config)?;
    let scheme = ShardScheme {
        count: config.shards.count,
        ids: if config.shards.ids.is_empty() {
            None
        } else {
            Some(config.shards.ids.clone())
        },
        server_index: config.server_index,
        server_count: config.server_count(),
    };

    let provider: Arc<dyn GatewayInfoProvider> = Arc::new(RestClient::new(&config.token));
    let (publisher, publish_rx) = BridgePublisher::new(config.events.iter().cloned());

    let mut manager = Manager::new(
        gateway_config,
        scheme,
        provider,
        store,
        Arc::new(MetricsCollector),
        Arc::new(publisher),
    );
    let handle = manager.handle();

    tokio::spawn(bridge::run_publisher(Arc::clone(&broker), publish_rx));

    let consumer_broker = Arc::clone(&broker);
    tokio::spawn(async move {
        loop {
            let consume = bridge::run_consumer(
                Arc::clone(&consumer_broker),
                handle.clone(),
                message_timeout,
            );

            if let Err(source) = consume.await {
                tracing::error!(error = %source, "broker consumer failed");
            }

            time::sleep(BROKER_RETRY_BASE).await;
            tracing::info!("restarting broker consumer");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    manager
        .start(shutdown_rx)
        .await
        .context("gateway manager exited abnormally")?;

    tracing::info!("all shards stopped, exiting");

    Ok(())
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    Ok(match config.shard_store.kind {
        ShardStoreKind::Memory => Arc::new(InMemorySessionStore::new()),
        ShardStoreKind::Redis => Arc::new(
            RedisSessionStore::connect(&config.shard_store.url, config.shard_store.prefix.clone())
                .await
                .context("connecting to the session store")?,
        ),
    })
}

/// Connect the configured broker, retrying with a capped backoff.
async fn connect_broker(config: &Config) -> Arc<dyn Broker> {
    let mut delay = BROKER_RETRY_BASE;

    loop {
        let result: Result<Arc<dyn Broker>, _> = match config.broker.kind {
            BrokerKind::Amqp => AmqpBroker::connect(&config.broker.url, config.broker.group.clone())
                .await
                .map(|broker| Arc::new(broker) as Arc<dyn Broker>),
            BrokerKind::Redis => RedisBroker::connect(
                &config.broker.url,
                config.broker.group.clone(),
                format!("nimbus-{}", config.server_index),
            )
            .await
            .map(|broker| Arc::new(broker) as Arc<dyn Broker>),
            BrokerKind::Stdio => Ok(Arc::new(StdioBroker::new()) as Arc<dyn Broker>),
        };

        match result {
            Ok(broker) => return broker,
            Err(source) => {
                tracing::warn!(
                    error = %source,
                    retry_seconds = delay.as_secs(),
                    "connecting to the broker failed, retrying",
                );
                time::sleep(delay).await;
                delay = (delay * 2).min(BROKER_RETRY_CAP);
            }
        }
    }
}

fn build_gateway_config(config: &Config) -> anyhow::Result<nimbus_gateway::Config> {
    let intents = config.resolved_intents()?;
    let mut builder = nimbus_gateway::Config::builder(config.token.clone(), intents)
        .gateway_version(config.gateway_version())
        .compression(resolve_compression(config.compression.as_deref())?);

    if let Some(presence) = config.presence_json()? {
        builder = builder.presence(presence);
    }

    Ok(builder.build())
}

fn resolve_compression(value: Option<&str>) -> anyhow::Result<Option<CompressionAlgorithm>> {
    Ok(match value {
        None | Some("zlib-stream") => Some(CompressionAlgorithm::Zlib),
        Some("zstd-stream") => Some(CompressionAlgorithm::Zstd),
        Some("none") => None,
        Some(other) => anyhow::bail!("unknown compression algorithm: {other}"),
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate = match unix_signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(source) => {
                tracing::warn!(error = %source, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;

                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
