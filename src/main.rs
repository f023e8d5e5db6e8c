//! Spot Hedger - Main Entry Point
//!
//! Runs the hedging control loop against paper venues and a simulated
//! market feed, and inspects the audit log.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use spot_hedger::audit::{AuditSink, SqliteAuditLog};
use spot_hedger::config::Config;
use spot_hedger::coordinator::{ControlLoop, GroupSpec, HedgeContext, LoopSettings};
use spot_hedger::events::{EventBus, HedgeEvent};
use spot_hedger::execution::{OrderRouter, PaperVenue};
use spot_hedger::ledger::PositionLedger;
use spot_hedger::market::{AggregatorConfig, MarketDataAggregator, MarketField};
use spot_hedger::risk::{AlertMonitor, ReturnHistory, RiskEngine, RiskEngineConfig};
use spot_hedger::simulation::SimulatedFeed;
use spot_hedger::strategy::StrategyEngine;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Spot Hedger CLI
#[derive(Parser)]
#[command(name = "spot-hedger")]
#[command(version, about = "Automated hedging of spot exposure with perpetuals and options")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hedging loop on paper venues with a simulated feed (default)
    Run {
        /// Seed of the simulated price path
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Seconds between simulated market updates
        #[arg(long, default_value = "2")]
        feed_interval: u64,
    },

    /// Show hedge history from the audit database
    History {
        /// Path to the audit database (default: engine.audit_db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Only this instrument group
        #[arg(short, long)]
        group: Option<String>,

        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// List every execution
        #[arg(short, long)]
        verbose: bool,
    },

    /// Load and validate the configuration, then exit
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::History {
            db,
            group,
            hours,
            verbose,
        }) => {
            let db = match db {
                Some(db) => db,
                None => Config::load()?.engine.audit_db_path,
            };
            show_history(&db, group.as_deref(), hours, verbose)
        }
        Some(Commands::ValidateConfig) => validate_config(),
        Some(Commands::Run { seed, feed_interval }) => run_hedger(seed, feed_interval).await,
        None => run_hedger(42, 2).await,
    }
}

async fn run_hedger(seed: u64, feed_interval: u64) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║          Spot Hedger v{} - Paper Hedging                ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);

    if let Some(parent) = Path::new(&config.engine.audit_db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let audit = Arc::new(SqliteAuditLog::new(&config.engine.audit_db_path)?);
    let events = EventBus::new(config.engine.event_capacity);

    let aggregator = Arc::new(MarketDataAggregator::new(AggregatorConfig {
        max_quote_age: ChronoDuration::seconds(config.engine.max_quote_age_secs),
        partial_policy: config.engine.partial_policy,
    }));
    let ledger = Arc::new(PositionLedger::new());

    let venues: Vec<Arc<PaperVenue>> = config
        .venues
        .iter()
        .map(|v| {
            Arc::new(
                PaperVenue::new(v.id.clone())
                    .with_fee_rate(v.fee_rate)
                    .with_latency(Duration::from_millis(v.latency_ms)),
            )
        })
        .collect();
    let router = venues.iter().zip(&config.venues).fold(
        OrderRouter::new(config.router.clone(), events.clone()),
        |router, (venue, venue_config)| {
            let router = router.with_venue(venue.clone());
            match venue_config.timeout_ms {
                Some(ms) => router.with_venue_timeout(venue_config.id.clone(), Duration::from_millis(ms)),
                None => router,
            }
        },
    );

    // Instruments, seeded holdings and return history per group
    let now = Utc::now();
    let mut feeds = Vec::new();
    let mut specs = Vec::new();
    for (i, group) in config.groups.iter().enumerate() {
        let mut feed = SimulatedFeed::new(group, now, seed.wrapping_add(i as u64));
        for instrument in feed.instruments() {
            aggregator.register(instrument.clone()).await;
            ledger.register_instrument(instrument.clone()).await;
            for (venue, venue_config) in venues.iter().zip(&config.venues) {
                if let Some(depth) = venue_config.depth {
                    venue.set_depth(instrument.id.clone(), depth).await;
                }
            }
        }

        if group.initial_spot != Decimal::ZERO {
            let entry = if group.entry_price > Decimal::ZERO {
                group.entry_price
            } else {
                feed.price()
            };
            ledger
                .seed_position(&group.spot_instrument, group.custody_venue.clone(), group.initial_spot, entry)
                .await
                .with_context(|| format!("Failed to seed spot holding of group {}", group.id))?;
        }

        let closes = feed.daily_closes(group.policy.var.lookback_days, now.date_naive());
        specs.push(GroupSpec::from(group).with_history(ReturnHistory::from_closes(closes)));
        feeds.push(feed);
    }
    publish_market(&aggregator, &venues, &mut feeds).await;

    let ctx = HedgeContext::new(aggregator.clone(), ledger.clone(), Arc::new(router), audit, events)
        .with_settings(LoopSettings::from(&config.engine))
        .with_risk_engine(RiskEngine::new(RiskEngineConfig {
            partial_var_penalty: config.engine.partial_var_penalty,
        }))
        .with_strategy_engine(StrategyEngine::new(Arc::new(config.cost_model.clone())))
        .with_alert_monitor(AlertMonitor::new(
            config.thresholds.clone(),
            config.engine.alert_cooldown(),
        ));

    let mut control = ControlLoop::new(ctx);
    spawn_event_logger(control.subscribe());
    for spec in specs {
        control
            .spawn_group(spec)
            .context("Failed to start group control loop")?;
    }

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Starting simulated market feed...");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut ticker = tokio::time::interval(Duration::from_secs(feed_interval.max(1)));
    let mut last_status_log = Utc::now();
    while !shutdown.load(Ordering::SeqCst) {
        ticker.tick().await;
        publish_market(&aggregator, &venues, &mut feeds).await;

        if Utc::now() - last_status_log >= ChronoDuration::seconds(60) {
            log_status(&control).await;
            last_status_log = Utc::now();
        }
    }

    control.shutdown().await;
    let holdings = ledger.holdings().await;
    for position in holdings.positions.iter().filter(|p| p.quantity != Decimal::ZERO) {
        info!(
            instrument = %position.instrument_id(),
            venue = %position.venue,
            quantity = %position.quantity,
            avg_entry = %position.avg_entry_price,
            realized_pnl = %position.realized_pnl,
            "Final position"
        );
    }
    info!("👋 Spot hedger stopped");
    Ok(())
}

/// Step every feed and mirror mids onto the paper venues.
async fn publish_market(aggregator: &MarketDataAggregator, venues: &[Arc<PaperVenue>], feeds: &mut [SimulatedFeed]) {
    let now = Utc::now();
    let mut updates = Vec::new();
    for feed in feeds.iter_mut() {
        updates.extend(feed.next_updates(now));
    }

    for update in updates.iter().filter(|u| u.field == MarketField::Mid) {
        for venue in venues {
            venue.set_price(update.instrument.clone(), update.value).await;
        }
    }

    match aggregator.apply_batch(updates).await {
        Some(snapshot) => debug!(version = snapshot.version, partial = snapshot.partial, "Snapshot promoted"),
        None => warn!("Simulated feed produced no new data"),
    }
}

fn spawn_event_logger(mut events: tokio::sync::broadcast::Receiver<HedgeEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(HedgeEvent::RiskMetricsUpdated(_)) => {}
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    info!(event = event.name(), "📣 {}", json);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn log_status(control: &ControlLoop) {
    for group in control.groups() {
        match control.status(&group).await {
            Ok(status) => {
                let (delta, var, price) = status
                    .last_metrics
                    .as_ref()
                    .map(|m| (m.net_delta, m.var.value, m.underlying_price))
                    .unwrap_or_default();
                info!(
                    group = %status.group,
                    phase = ?status.phase,
                    paused = status.paused,
                    net_delta = %delta,
                    var = %var.round_dp(2),
                    price = %price.round_dp(2),
                    failures = status.consecutive_failures,
                    cycles = status.cycles,
                    "📊 Group status"
                );
            }
            Err(e) => error!(group = %group, error = %e, "Failed to read group status"),
        }
    }
}

fn validate_config() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    println!("✅ Configuration is valid");
    println!("   ├─ Venues: {}", config.venues.iter().map(|v| v.id.to_string()).collect::<Vec<_>>().join(", "));
    for group in &config.groups {
        println!(
            "   ├─ Group {}: {} {} hedged with {} via {}",
            group.id,
            group.initial_spot,
            group.underlying,
            group.policy.hedge_instrument,
            group.policy.strategy
        );
    }
    println!("   └─ Audit DB: {}", config.engine.audit_db_path);
    Ok(())
}

fn show_history(db_path: &str, group: Option<&str>, hours: i64, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                    HEDGE HISTORY                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The hedger has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let audit = SqliteAuditLog::new(db_path)?;
    let since = Utc::now() - ChronoDuration::hours(hours);
    let records = audit.hedge_history(group, since)?;
    let summary = audit.hedge_summary(group, since)?;

    println!(
        "\n📊 Last {}h{}",
        hours,
        group.map(|g| format!(" for {}", g)).unwrap_or_default()
    );
    println!("   ├─ Executions:       {}", summary.executions);
    println!("   ├─ Filled:           {}", summary.filled);
    println!("   ├─ Partial:          {}", summary.partial);
    println!("   ├─ Failed:           {}", summary.failed);
    println!("   ├─ Cancelled:        {}", summary.cancelled);
    println!("   ├─ Success Rate:     {:.1}%", summary.success_rate() * dec!(100));
    println!("   ├─ Traded Notional:  ${:.2}", summary.traded_notional);
    println!("   └─ Fees Paid:        ${:.4}", summary.total_fees);

    if let Some(group) = group {
        let metrics = audit.recent_metrics(group, 5)?;
        if !metrics.is_empty() {
            println!("\n📈 Latest Risk");
            for (ts, delta, var) in metrics {
                println!(
                    "   ├─ {}  delta {:>10}  VaR ${:.2}",
                    ts.format("%Y-%m-%d %H:%M:%S"),
                    delta.round_dp(4),
                    var
                );
            }
        }
    }

    if verbose && !records.is_empty() {
        println!("\n🧾 Executions");
        for record in &records {
            println!(
                "   ┌─ {} [{}] {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.group,
                record.strategy
            );
            println!(
                "   ├─ {} {}/{} {} @ ${:.2}",
                record.side, record.filled_qty.abs(), record.requested_qty, record.instrument, record.avg_price
            );
            match &record.reason {
                Some(reason) => println!("   └─ {} ({})", record.status, reason),
                None => println!("   └─ {}", record.status),
            }
        }
    }

    Ok(())
}

/// Initialize logging with stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "spot-hedger.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spot_hedger=debug".parse()?)
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
    info!("📋 Configuration:");
    info!("   Tick Interval: {}s", config.engine.tick_interval_secs);
    info!("   Error Backoff: {}s", config.engine.error_backoff_secs);
    info!(
        "   Max Consecutive Failures: {}",
        config.engine.max_consecutive_failures
    );
    info!(
        "   Alert Thresholds: delta {:.0}%, VaR {:.0}%",
        config.thresholds.delta * dec!(100),
        config.thresholds.var * dec!(100)
    );
    info!(
        "   Venues: {}",
        config
            .venues
            .iter()
            .map(|v| v.id.to_string())
            .collect::<Vec<_>>()
            .join(" > ")
    );
    for group in &config.groups {
        info!(
            "   Group {}: {} {} | {} on {} | band ±{} | cooldown {}s",
            group.id,
            group.initial_spot,
            group.underlying,
            group.policy.strategy,
            group.policy.hedge_instrument,
            group.policy.delta_band,
            group.policy.cooldown_secs
        );
    }
}
