//! Delta Neutral Bot - Main Entry Point
//!
//! Runs the orchestrator against the in-memory paper venue, and inspects the
//! audit log it writes.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Timelike, Utc};
use clap::{Parser, Subcommand};
use delta_neutral_bot::config::Config;
use delta_neutral_bot::exchange::PaperVenue;
use delta_neutral_bot::persistence::SqliteAuditLog;
use delta_neutral_bot::strategy::{Collaborators, ControlHandle, Orchestrator, StatusReport};
use delta_neutral_bot::utils::SystemClock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Delta Neutral Bot CLI
#[derive(Parser)]
#[command(name = "delta-neutral-bot")]
#[command(version, about = "Delta-neutral funding rate arbitrage")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot against the paper venue (default)
    Run {
        /// Seed for the simulated market; random when omitted
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show the latest equity snapshot and recent audit events
    Status {
        /// Path to the SQLite audit log (defaults to the configured path)
        #[arg(short, long)]
        db: Option<String>,

        /// Number of recent events to print
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;

    match cli.command {
        Some(Commands::Status { db, limit }) => {
            let path = db.unwrap_or_else(|| config.persistence.db_path.clone());
            show_status(&path, limit)
        }
        Some(Commands::CheckConfig) => {
            config.validate()?;
            log_config(&config);
            info!("✅ Configuration is valid");
            Ok(())
        }
        Some(Commands::Run { seed }) => run_paper(config, seed).await,
        None => run_paper(config, None).await,
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "delta-neutral-bot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("delta_neutral_bot=debug".parse()?)
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

async fn run_paper(config: Config, seed: Option<u64>) -> Result<()> {
    config.validate()?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║         Delta Neutral Bot v{} - Paper Trading            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let venue = Arc::new(
        PaperVenue::new(config.capital.initial_capital).with_fee_rate(config.execution.taker_fee_pct),
    );
    let now = Utc::now();
    for pair in &config.strategy.enabled_pairs {
        let price = reference_price(pair);
        venue
            .set_market(pair, dec!(0.0001), price, price, now)
            .await;
    }

    let audit = Arc::new(
        SqliteAuditLog::new(&config.persistence.db_path)
            .with_context(|| format!("Failed to open audit log {}", config.persistence.db_path))?,
    );

    let mut orchestrator = Orchestrator::new(
        &config,
        Collaborators {
            feed: venue.clone(),
            executor: venue.clone(),
            account: venue.clone(),
            audit,
            clock: Arc::new(SystemClock),
        },
    );
    let control = orchestrator.control();
    spawn_command_reader(control.clone());

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut ticker = tokio::time::interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_funding_hour = Utc::now().hour();
    let mut last_status_log = Utc::now();

    info!("🚀 Starting main loop (commands: status, start, stop, reset)");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Shutdown signal received");
                break;
            }
        }

        let now = Utc::now();
        venue.drift_market(&mut rng, now).await;

        if now.hour() != last_funding_hour {
            last_funding_hour = now.hour();
            venue.settle_funding().await;
        }

        let summary = orchestrator.tick().await;
        if summary.data_errors > 0 || summary.entries > 0 || summary.breaker_tripped {
            info!(?summary, "Tick");
        }

        if now - last_status_log >= chrono::Duration::minutes(5) {
            log_status(&control.status().await);
            last_status_log = now;
        }
    }

    info!(in_flight = orchestrator.in_flight(), "Waiting for in-flight intents");
    orchestrator.settle().await;
    log_status(&control.status().await);

    let account = venue.account().await;
    info!(
        balance = %account.balance.round_dp(2),
        funding = %account.total_funding_received.round_dp(4),
        fees = %account.total_trading_fees.round_dp(4),
        orders = account.order_count,
        "👋 Paper account at shutdown"
    );

    Ok(())
}

/// Operator commands from stdin, one per line.
fn spawn_command_reader(control: ControlHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match line.trim() {
                "" => {}
                "status" => log_status(&control.status().await),
                "start" => control.start(),
                "stop" => control.stop(),
                "reset" => control.request_breaker_reset(),
                other => warn!(command = other, "Unknown command"),
            }
        }
    });
}

/// Starting price for a simulated pair.
fn reference_price(pair: &str) -> Decimal {
    match pair {
        "BTC" => dec!(60000),
        "ETH" => dec!(3000),
        "SOL" => dec!(150),
        _ => dec!(100),
    }
}

fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Pairs: {}", config.strategy.enabled_pairs.join(", "));
    info!(
        "   Poll Interval: {}s (fetch timeout {}ms)",
        config.strategy.poll_interval_secs, config.strategy.fetch_timeout_ms
    );
    info!(
        "   Entry Threshold: {:.4}% per interval, z >= {}",
        config.strategy.funding_threshold * dec!(100),
        config.strategy.funding_zscore_k
    );
    info!(
        "   Capital Per Pair: {:.0}% (min ${})",
        config.capital.capital_per_pair_pct * dec!(100),
        config.capital.min_trade_size_usdt
    );
    info!(
        "   Max Drawdown: {:.0}%, Max Daily Loss: {:.0}%",
        config.risk.max_drawdown_pct * dec!(100),
        config.risk.max_daily_loss_pct * dec!(100)
    );
    info!(
        "   Circuit Breaker: {}",
        if config.risk.circuit_breaker_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
}

fn log_status(status: &StatusReport) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        running = status.running,
        ticks = status.tick_count,
        breaker = status.circuit_breaker_tripped,
        drawdown = %status.drawdown.round_dp(4),
        realized_pnl = %status.realized_pnl.round_dp(4),
        in_flight = status.in_flight_intents,
        "📊 Status"
    );
    if let Some(risk) = &status.risk {
        info!(
            equity = %risk.current_equity.round_dp(2),
            high_watermark = %risk.equity_high_watermark.round_dp(2),
            max_drawdown = %risk.max_drawdown_observed.round_dp(4),
            daily_pnl = %risk.daily_pnl.round_dp(2),
            exposure = %risk.total_exposure.round_dp(2),
            "   Risk"
        );
    }
    if let Some(reason) = &status.trip_reason {
        warn!(%reason, "   Circuit breaker tripped");
    }
    for position in &status.positions {
        info!(
            pair = %position.pair,
            state = position.state,
            side = ?position.perp_side,
            size = %position.perp_size,
            funding = %position.funding_collected.round_dp(4),
            mtm = %position.mark_to_market.round_dp(4),
            "   Position"
        );
    }
    for (pair, error) in &status.last_errors {
        info!(%pair, at = %error.at, message = %error.message, "   Last error");
    }
}

fn show_status(db_path: &str, limit: usize) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              DELTA NEUTRAL BOT STATUS                      ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Audit log not found: {}", db_path);
        println!("   The bot has not been started yet, or the path is incorrect.");
        return Ok(());
    }

    let audit = SqliteAuditLog::new(db_path)?;

    match audit.latest_equity()? {
        Some(row) => {
            println!("\n📊 Latest Equity Snapshot");
            println!("   ├─ Equity:          ${:.2}", row.equity);
            println!("   ├─ Drawdown:        {:.2}%", row.drawdown * dec!(100));
            println!("   ├─ Exposure:        ${:.2}", row.total_exposure);
            println!("   ├─ Open Positions:  {}", row.open_positions);
            println!("   └─ At:              {}", row.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        None => println!("\n❌ No equity snapshots recorded yet."),
    }

    let events = audit.recent_events(limit)?;
    if !events.is_empty() {
        println!("\n📜 Recent Events");
        for event in &events {
            println!(
                "   ├─ {} {:<20} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.kind,
                event.pair.as_deref().unwrap_or("-")
            );
        }
    }

    println!();
    Ok(())
}
