//! Liquidation Monitor - Main Entry Point
//!
//! Runs the monitor loop, inspects persisted state, or adds a wallet to the
//! watch list.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use liquidation_monitor::alert::LogAlertSink;
use liquidation_monitor::config::Config;
use liquidation_monitor::orchestrator::{Collaborators, Orchestrator};
use liquidation_monitor::persistence::{
    PersistenceStore, SqliteStore, STATE_KNOWN_ADDRESSES, STATE_LAST_DISCOVERY, STATE_WATCHED_ADDRESSES,
};
use liquidation_monitor::sources::{HyperliquidClient, StaticCandidates};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Liquidation Monitor CLI
#[derive(Parser)]
#[command(name = "liquidation-monitor")]
#[command(version, about = "Tiered liquidation-proximity monitoring for perpetuals positions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop (default)
    Run,

    /// Show monitored positions from persisted state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/liquidation_monitor.db")]
        db: String,

        /// Show every position, closest to liquidation first
        #[arg(short, long)]
        verbose: bool,
    },

    /// Start watching every position of a wallet, regardless of distance
    Watch {
        /// Wallet address
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => show_status(&db, verbose),
        Some(Commands::Watch { address }) => watch(&address).await,
        Some(Commands::Run) | None => run().await,
    }
}

async fn run() -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║            Liquidation Monitor v{}                      ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = load_config()?;
    log_config(&config);

    let mut orchestrator = build_orchestrator(&config)?;

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    });

    orchestrator.start().await
}

async fn watch(address: &str) -> Result<()> {
    let config = load_config()?;
    let mut orchestrator = build_orchestrator(&config)?;

    let now = Utc::now();
    orchestrator.recover_at(now)?;
    let keys = orchestrator.watch_address(address, now).await?;

    if keys.is_empty() {
        println!("\n⚠️  {} has no position with a liquidation price above the notional floor", address);
        println!("   The address is remembered and will be rescanned on every discovery sweep.");
        return Ok(());
    }

    println!("\n👀 Watching {} position(s) of {}", keys.len(), address);
    for key in &keys {
        if let Some(pos) = orchestrator.cache().get(key) {
            println!(
                "   ├─ {} | tier {} | distance {}",
                key,
                pos.refresh_tier,
                format_distance(pos.distance_pct)
            );
        }
    }
    Ok(())
}

fn load_config() -> Result<Config> {
    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let store = Arc::new(
        SqliteStore::new(&config.persistence.db_path)
            .with_context(|| format!("Failed to open database {:?}", config.persistence.db_path))?,
    );
    let client = Arc::new(HyperliquidClient::with_base_url(
        &config.venue.api_url,
        Duration::from_secs(config.venue.request_timeout_secs),
    )?);
    let candidates = Arc::new(StaticCandidates::new(
        config.discovery.addresses.clone(),
        config.discovery.addresses_file.clone(),
    ));

    let sources = Collaborators {
        prices: client.clone(),
        positions: client,
        candidates,
        sink: Arc::new(LogAlertSink::new()),
        store,
    };
    Ok(Orchestrator::new(config, sources))
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "liquidation-monitor.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("liquidation_monitor=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let m = &config.monitor;
    info!("📋 Configuration:");
    info!("   Exchanges: {}", config.venue.exchanges.join(", "));
    info!(
        "   Tiers: critical ≤ {}% every {}ms | high ≤ {}% every {}s | normal every {}s",
        m.critical_pct, m.critical_interval_ms, m.high_pct, m.high_interval_secs, m.normal_interval_secs
    );
    info!(
        "   Alerts: proximity ≤ {}% | critical ≤ {}% | recovery > {}% | cooldown {}s",
        m.proximity_pct, m.critical_pct, m.recovery_pct, config.alerts.cooldown_seconds
    );
    info!(
        "   Watch threshold: ≥ ${} notional within {}%",
        m.min_notional, m.max_watch_distance_pct
    );
    info!(
        "   Discovery: every {}-{} min | {} configured candidates{}",
        config.discovery.min_interval_minutes,
        config.discovery.max_interval_minutes,
        config.discovery.addresses.len(),
        config
            .discovery
            .addresses_file
            .as_ref()
            .map(|p| format!(" + {}", p.display()))
            .unwrap_or_default()
    );
    info!("   Database: {}", config.persistence.db_path.display());
}

/// Show monitor status from the database.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              LIQUIDATION MONITOR STATUS                    ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The monitor has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let store = SqliteStore::new(db_path)?;

    let known = store
        .get_state(STATE_KNOWN_ADDRESSES)?
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();
    let watched = store
        .get_state(STATE_WATCHED_ADDRESSES)?
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();
    let last_discovery = store
        .get_state(STATE_LAST_DISCOVERY)?
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|at| at.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());

    println!("\n🔍 Discovery");
    println!("   ├─ Known Addresses:   {}", known.len());
    println!("   ├─ Watched Manually:  {}", watched.len());
    println!("   └─ Last Sweep:        {}", last_discovery);

    println!("\n📊 Positions by Tier");
    let summary = store.tier_summary()?;
    if summary.is_empty() {
        println!("   └─ (none)");
    }
    for (i, (tier, count)) in summary.iter().enumerate() {
        let branch = if i + 1 == summary.len() { "└─" } else { "├─" };
        println!("   {} {:<9} {}", branch, tier, count);
    }

    if verbose {
        let mut positions = store.load_all()?;
        positions.sort_by(|a, b| match (a.distance_pct, b.distance_pct) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.key.cmp(&b.key),
        });

        if !positions.is_empty() {
            println!("\n📈 Positions");
        }
        for pos in &positions {
            println!("   ┌─ {}", pos.key);
            println!(
                "   │  Distance: {} | Tier: {} | Alert zone: {}",
                format_distance(pos.distance_pct),
                pos.refresh_tier,
                pos.alert.zone.as_str()
            );
            println!(
                "   │  Mark: {} | Liq: {} | Value: ${:.0} | {}x",
                pos.position.mark_price,
                pos.position
                    .liquidation_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                pos.position.position_value,
                pos.position.leverage
            );
            println!(
                "   └─ Last refresh: {}",
                pos.last_full_refresh.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    Ok(())
}

fn format_distance(distance_pct: Option<rust_decimal::Decimal>) -> String {
    distance_pct
        .map(|d| format!("{:.3}%", d))
        .unwrap_or_else(|| "n/a".to_string())
}
