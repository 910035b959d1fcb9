//! Courtside Trading Bot CLI
//!
//! Tick-driven trading of paired Polymarket positions around NBA games.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use clap::{Parser, Subcommand};
use colored::Colorize;
use courtside_bot::config::Config;
use courtside_bot::db::{Database, NewTradeJob};
use courtside_bot::ledger::PositionGroupLedger;
use courtside_bot::lifecycle::OrderLifecycleManager;
use courtside_bot::optimizer::{build_group_samples, optimize_hedge_ratio};
use courtside_bot::scheduler::JobScheduler;
use courtside_bot::services::gateway::SimGateway;
use courtside_bot::services::{ClobGateway, ExchangeGateway, GammaDiscovery, Notifier};
use courtside_bot::types::{Confidence, JobSide, TeamSide, TradingMode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courtside-bot")]
#[command(about = "Paired-position trading bot for Polymarket NBA moneylines")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scheduler + order manager continuously
    Run {
        /// Tick interval in seconds (overrides TICK_INTERVAL_SECONDS)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run exactly one scheduler pass and one order-manager pass
    Tick,

    /// Load planned trade jobs from a JSON file
    Seed {
        /// Path to the planned-games JSON file
        file: String,
    },

    /// Grid-search the hedge ratio over settled bothside groups
    OptimizeHedge {
        /// Lower grid bound (defaults to HEDGE min_ratio config)
        #[arg(long)]
        min: Option<f64>,
        /// Upper grid bound
        #[arg(long)]
        max: Option<f64>,
        /// Grid step
        #[arg(long)]
        step: Option<f64>,
        /// Drawdown penalty weight
        #[arg(long)]
        dd_penalty: Option<f64>,
    },

    /// Cancel a trade job and any order it has resting
    Cancel {
        /// Job id to cancel
        job_id: i64,
    },

    /// Show job, group and PnL statistics
    Stats,
}

/// One planned game from the research pipeline
#[derive(Debug, Deserialize)]
struct SeedGame {
    away: String,
    home: String,
    /// YYYY-MM-DD in US/Eastern
    date: String,
    /// HH:MM tip-off in US/Eastern
    tip_off: String,
    backed_side: TeamSide,
    p_low: f64,
    confidence: String,
    #[serde(default)]
    dca_entries: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Run { interval } => run_bot(&config, interval).await?,
        Commands::Tick => run_tick(&config).await?,
        Commands::Seed { file } => seed_jobs(&config, &file).await?,
        Commands::OptimizeHedge {
            min,
            max,
            step,
            dd_penalty,
        } => optimize_hedge(&config, min, max, step, dd_penalty).await?,
        Commands::Cancel { job_id } => cancel_job(&config, job_id).await?,
        Commands::Stats => show_stats(&config).await?,
    }

    Ok(())
}

/// Wire up the scheduler and order manager for the configured mode
struct Bot {
    scheduler: JobScheduler,
    lifecycle: OrderLifecycleManager,
}

async fn build_bot(config: &Config) -> Result<Bot> {
    let db = Arc::new(Database::new(&config.database_path).await?);
    let gateway: Arc<dyn ExchangeGateway> = match config.mode {
        TradingMode::Live => Arc::new(
            ClobGateway::new(config.clob.clone())
                .map_err(|e| anyhow::anyhow!("gateway init: {}", e))?,
        ),
        TradingMode::Paper | TradingMode::DryRun => Arc::new(
            SimGateway::new(config.clob.clone())
                .map_err(|e| anyhow::anyhow!("gateway init: {}", e))?,
        ),
    };
    let discovery = Arc::new(GammaDiscovery::new());
    let notifier = Notifier::new(config.discord_webhook_url.clone());
    let ledger = Arc::new(PositionGroupLedger::new(
        db.clone(),
        notifier.clone(),
        config.sizing.clone(),
    ));

    let scheduler = JobScheduler::new(
        db.clone(),
        gateway.clone(),
        discovery,
        ledger.clone(),
        notifier.clone(),
        config.clone(),
    );
    let lifecycle = OrderLifecycleManager::new(
        db,
        gateway,
        ledger,
        notifier,
        config.orders.clone(),
        config.hedge.combined_price_ceiling,
    );

    Ok(Bot {
        scheduler,
        lifecycle,
    })
}

fn print_banner(config: &Config) {
    let mode = match config.mode {
        TradingMode::Live => "LIVE".red().bold().to_string(),
        TradingMode::Paper => "PAPER".yellow().to_string(),
        TradingMode::DryRun => "DRY-RUN".green().to_string(),
    };
    println!("\n{}", "=".repeat(70));
    println!("  COURTSIDE BOT — mode: {}", mode);
    println!(
        "  Bankroll: ${:.0} | Regime: {:.2} | DB: {}",
        config.bankroll_usd, config.regime_multiplier, config.database_path
    );
    println!("{}\n", "=".repeat(70));
}

async fn run_bot(config: &Config, interval: Option<u64>) -> Result<()> {
    print_banner(config);
    let interval = interval.unwrap_or(config.tick_interval_seconds);
    let bot = build_bot(config).await?;

    println!("Starting tick loop every {}s (Ctrl+C to stop)...\n", interval);

    loop {
        let now = Utc::now();
        if let Err(e) = bot.scheduler.run_pass(now).await {
            error!("Scheduler pass failed: {:#}", e);
        }
        if let Err(e) = bot.lifecycle.run_pass(now).await {
            error!("Order pass failed: {:#}", e);
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}

async fn run_tick(config: &Config) -> Result<()> {
    print_banner(config);
    let bot = build_bot(config).await?;
    let now = Utc::now();

    let scheduler_summary = bot.scheduler.run_pass(now).await?;
    let order_summary = bot.lifecycle.run_pass(now).await?;

    println!(
        "Scheduler: {:?}\nOrders:    {:?}",
        scheduler_summary, order_summary
    );
    Ok(())
}

async fn seed_jobs(config: &Config, file: &str) -> Result<()> {
    let db = Database::new(&config.database_path).await?;
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read seed file {}", file))?;
    let games: Vec<SeedGame> = serde_json::from_str(&raw).context("failed to parse seed file")?;

    let mut created = 0usize;
    for game in &games {
        let game_time = parse_eastern(&game.date, &game.tip_off)
            .with_context(|| format!("bad tip-off for {} @ {}", game.away, game.home))?;
        let confidence: Confidence = game.confidence.parse()?;

        let dca_max_entries = game
            .dca_entries
            .unwrap_or(config.dca.default_max_entries)
            .max(1);
        let job = NewTradeJob {
            game_id: format!(
                "{}-{}-{}",
                game.date,
                game.away.to_uppercase(),
                game.home.to_uppercase()
            ),
            away_team: game.away.to_uppercase(),
            home_team: game.home.to_uppercase(),
            game_date: game.date.clone(),
            backed_side: game.backed_side,
            p_low: game.p_low,
            confidence,
            game_time,
            // Enter once the market has morning liquidity, stop chasing
            // shortly before tip
            execute_after: game_time - chrono::Duration::hours(6),
            execute_before: game_time - chrono::Duration::minutes(5),
            job_side: JobSide::Directional,
            paired_job_id: None,
            bothside_group_id: None,
            dca_group_id: (dca_max_entries > 1).then(|| uuid::Uuid::new_v4().to_string()),
            dca_max_entries,
            dca_slice_usd: None,
        };

        match db.create_job(&job).await {
            Ok(id) => {
                info!("Seeded job {} for {}", id, job.game_id);
                created += 1;
            }
            Err(e) => {
                error!("Skipping {}: {:#}", job.game_id, e);
            }
        }
    }

    println!("Seeded {} of {} games", created, games.len());
    Ok(())
}

/// Parse a US/Eastern date + time into UTC
fn parse_eastern(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;
    let time = NaiveTime::parse_from_str(time, "%H:%M")?;
    let local = New_York
        .from_local_datetime(&date.and_time(time))
        .single()
        .context("ambiguous or invalid local time")?;
    Ok(local.with_timezone(&Utc))
}

async fn optimize_hedge(
    config: &Config,
    min: Option<f64>,
    max: Option<f64>,
    step: Option<f64>,
    dd_penalty: Option<f64>,
) -> Result<()> {
    let min = min.unwrap_or(config.hedge.min_ratio);
    let max = max.unwrap_or(config.hedge.max_ratio);
    let step = step.unwrap_or(config.hedge.ratio_step);
    let dd_penalty = dd_penalty.unwrap_or(config.hedge.dd_penalty);
    let db = Database::new(&config.database_path).await?;
    let legs = db.get_settled_bothside_legs().await?;
    let samples = build_group_samples(&legs);

    println!("\n{}", "=".repeat(70));
    println!(
        "  HEDGE RATIO OPTIMIZER — {} settled groups ({} legs)",
        samples.len(),
        legs.len()
    );
    println!("{}\n", "=".repeat(70));

    if samples.is_empty() {
        println!("No settled bothside groups yet.");
        return Ok(());
    }

    let (best, table) = optimize_hedge_ratio(&samples, min, max, step, dd_penalty)?;

    println!("{:>8} {:>12} {:>12} {:>12}", "ratio", "pnl", "drawdown", "objective");
    for eval in &table {
        let marker = if (eval.ratio - best.ratio).abs() < 1e-9 { " <-- best" } else { "" };
        println!(
            "{:>8.2} {:>12.2} {:>12.2} {:>12.2}{}",
            eval.ratio, eval.total_pnl, eval.max_drawdown, eval.objective, marker
        );
    }
    println!(
        "\nBest ratio: {:.2} (objective {:.2}). Set HEDGE_RATIO to apply.",
        best.ratio, best.objective
    );
    Ok(())
}

async fn cancel_job(config: &Config, job_id: i64) -> Result<()> {
    use courtside_bot::types::{OrderEventKind, OrderState};

    let db = Database::new(&config.database_path).await?;
    let job = db.get_job(job_id).await?;

    if let Some(signal) = db.latest_signal_for_job(job_id).await? {
        if signal.order_status == OrderState::Placed {
            if let Some(order_id) = signal.order_id.as_deref() {
                if config.mode.is_live() {
                    let gateway = ClobGateway::new(config.clob.clone())
                        .map_err(|e| anyhow::anyhow!("gateway init: {}", e))?;
                    if let Err(e) = gateway.cancel_order(order_id).await {
                        error!("Exchange cancel failed for {}: {}", order_id, e);
                    }
                }
            }
            db.mark_signal_terminal(signal.id, OrderState::Cancelled).await?;
            db.insert_order_event(signal.id, OrderEventKind::Cancelled, None, None)
                .await?;
            println!("Cancelled resting order for signal {}", signal.id);
        }
    }

    db.update_job_status(job_id, courtside_bot::types::JobStatus::Cancelled)
        .await?;
    println!("Job {} ({} {}) cancelled", job_id, job.game_id, job.job_side);
    Ok(())
}

async fn show_stats(config: &Config) -> Result<()> {
    let db = Database::new(&config.database_path).await?;

    println!("\n{}", "=".repeat(70));
    println!("  COURTSIDE BOT STATISTICS");
    println!("{}\n", "=".repeat(70));

    println!("Jobs by status:");
    for (status, count) in db.count_jobs_by_status().await? {
        println!("  {:<12} {}", status, count);
    }

    let pnl = db.total_realized_pnl().await?;
    let recovery = db.total_merge_recovery().await?;
    println!("\nRealized PnL:    ${:.2}", pnl);
    println!("Merge recovery:  ${:.2}", recovery);

    let groups = db.get_open_groups().await?;
    if !groups.is_empty() {
        println!("\nOpen position groups ({}):", groups.len());
        for group in groups.iter().take(10) {
            println!(
                "  {} q_dir={} q_opp={} merged={} d={}/{}{}",
                group.game_id,
                group.q_dir,
                group.q_opp,
                group.merged_qty,
                group.imbalance(),
                group.d_max,
                if group.violates_imbalance() {
                    " [VIOLATION]".red().to_string()
                } else {
                    String::new()
                }
            );
        }
    }

    Ok(())
}
