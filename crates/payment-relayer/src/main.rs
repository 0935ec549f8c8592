use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy_primitives::U256;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use payment_relayer::chains::{ChainRegistry, JsonRpcProvider};
use payment_relayer::config::RelayerConfig;
use payment_relayer::events::EventBus;
use payment_relayer::relay::RelayEngine;
use payment_relayer::scheduler::Scheduler;
use payment_relayer::stats::RelayStats;
use payment_relayer::store::{MessageStatus, QueueStore, RelayMessage};

#[derive(Parser)]
#[command(name = "relayer")]
#[command(about = "Persistent cross-chain payment message relayer")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/relayer.toml")]
    pub config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relayer
    Start,
    /// Print queue composition as JSON
    Status,
    /// Export queue records as JSON lines
    List {
        /// Only records in this status
        #[arg(long)]
        status: Option<MessageStatus>,
        /// Maximum number of records, newest first
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Requeue messages left in processing by a stopped relayer
    Recover,
    /// Check the configuration file and print the chain table
    ValidateConfig,
    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Queue a message read from a JSON file
    Enqueue {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        priority: bool,
    },
    /// Deliver a message read from a JSON file right away, bypassing the queue
    ManualRelay {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("payment_relayer={0},relayer={0}", cli.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&cli.config, force);
    }

    // Load configuration
    let config = RelayerConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    info!("Loaded configuration from: {}", cli.config);

    match cli.command {
        Commands::Start => start_relayer(config).await?,
        Commands::Status => show_status(&config).await?,
        Commands::List { status, limit } => list_messages(&config, status, limit).await?,
        Commands::Recover => recover(&config).await?,
        Commands::ValidateConfig => validate_config(&config)?,
        Commands::InitConfig { .. } => {}
        Commands::Enqueue { file, priority } => enqueue(&config, &file, priority).await?,
        Commands::ManualRelay { file } => manual_relay(config, &file).await?,
    }

    Ok(())
}

async fn open_store(config: &RelayerConfig) -> anyhow::Result<QueueStore> {
    QueueStore::open(&config.global.database_path)
        .await
        .with_context(|| {
            format!(
                "opening queue database {}",
                config.global.database_path.display()
            )
        })
}

fn build_engine(config: RelayerConfig, store: QueueStore) -> anyhow::Result<RelayEngine> {
    let registry = ChainRegistry::from_config(&config)?;
    let provider = Arc::new(JsonRpcProvider::new(&registry, &config.relay)?);

    #[cfg(feature = "metrics")]
    let stats = RelayStats::new().with_metrics(Arc::new(payment_relayer::RelayerMetrics::new()?));
    #[cfg(not(feature = "metrics"))]
    let stats = RelayStats::new();

    Ok(RelayEngine::with_stats(config, store, provider, stats)?)
}

async fn start_relayer(config: RelayerConfig) -> anyhow::Result<()> {
    info!("Payment relayer starting...");
    config.validate()?;

    let store = open_store(&config).await?;
    let engine = Arc::new(build_engine(config.clone(), store)?);
    engine.start().await?;

    #[cfg(feature = "metrics")]
    let metrics_server = start_metrics_server(&config, engine.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relayer...");
    engine.shutdown().await;

    #[cfg(feature = "metrics")]
    {
        if let Some(server) = metrics_server {
            if let Err(e) = server.shutdown().await {
                warn!("Metrics server ended abnormally: {}", e);
            }
        }
    }

    let snapshot = engine.stats().await?;
    info!(
        relayed = snapshot.messages_relayed,
        failed = snapshot.failed_relays,
        uptime = %snapshot.uptime,
        "Relayer stopped"
    );
    Ok(())
}

#[cfg(feature = "metrics")]
fn start_metrics_server(
    config: &RelayerConfig,
    engine: Arc<RelayEngine>,
) -> Option<payment_relayer::metrics::server::MetricsServer> {
    use payment_relayer::metrics::server::{MetricsServer, MetricsState};

    if !config.metrics.enabled {
        return None;
    }
    let metrics = engine.relay_stats().metrics()?;
    Some(MetricsServer::spawn(
        config.metrics.host.clone(),
        config.metrics.port,
        MetricsState { engine, metrics },
    ))
}

async fn show_status(config: &RelayerConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let stats = store.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn list_messages(
    config: &RelayerConfig,
    status: Option<MessageStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    for record in store.list(status, limit).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

async fn recover(config: &RelayerConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let scheduler = Scheduler::new(
        store,
        EventBus::new(config.relay.event_channel_capacity),
        Arc::new(RelayStats::new()),
        &config.relay,
    );
    let recovered = scheduler.startup_recovery().await?;
    println!("Requeued {} message(s)", recovered);
    Ok(())
}

fn validate_config(config: &RelayerConfig) -> anyhow::Result<()> {
    config.validate()?;
    let registry = ChainRegistry::from_config(config)?;
    for chain in registry.iter() {
        println!(
            "{:<20} {:>10}  gas x{:<5} {}",
            chain.key,
            chain.chain_id(),
            chain.config.gas_multiplier,
            chain.config.rpc_endpoint
        );
    }
    println!("Configuration OK ({} chains)", registry.len());
    Ok(())
}

fn init_config(path: &str, force: bool) -> anyhow::Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", path);
    }
    RelayerConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path);
    Ok(())
}

fn read_message(file: &Path) -> anyhow::Result<RelayMessage> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let message = serde_json::from_str(&content)
        .with_context(|| format!("parsing message in {}", file.display()))?;
    Ok(message)
}

async fn enqueue(config: &RelayerConfig, file: &Path, priority: bool) -> anyhow::Result<()> {
    let message = read_message(file)?;
    let store = open_store(config).await?;
    match store.enqueue(&message, priority, chrono::Utc::now()).await? {
        Some(id) => println!("Queued as record {}", id),
        None => println!("Rejected (expired, invalid or already queued)"),
    }
    Ok(())
}

async fn manual_relay(config: RelayerConfig, file: &Path) -> anyhow::Result<()> {
    let message = read_message(file)?;
    let request_id: U256 = message.request_id;
    let store = open_store(&config).await?;
    let engine = build_engine(config, store)?;
    if engine.manual_relay(request_id, &message).await? {
        println!("Delivered request {}", request_id);
    } else {
        anyhow::bail!("manual relay of request {} did not succeed", request_id);
    }
    Ok(())
}
