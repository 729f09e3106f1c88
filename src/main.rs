//! Castboard Ingestion Service
//! Budgeted Farcaster engagement ingestion and leaderboard
//!
//! Features:
//! - Sliding-window rate limiting with 429 retries
//! - Multi-variant search fallback and time-sliced backfills
//! - Bulk engagement lookups in budgeted batches
//! - Monotonic merge-upserts and a never-regressing watermark
//! - HTTP trigger, leaderboard and Prometheus endpoints
//! - Graceful shutdown with SIGTERM handling

use anyhow::{bail, Result};
use castboard_ingest::config::Config;
use castboard_ingest::http_client::{HttpClientConfig, RateLimitedClient};
use castboard_ingest::models::LeaderboardMetric;
use castboard_ingest::orchestrator::{IngestRequest, Orchestrator, RunOutcome, MAX_BACKFILL_HOURS};
use castboard_ingest::rate_limiter::SlidingWindowLimiter;
use castboard_ingest::server::{self, AppState};
use castboard_ingest::storage::{self, PgStore, MAX_TOP_LIMIT};
use castboard_ingest::upstream::neynar::NeynarClient;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Castboard - Farcaster engagement ingestion and leaderboard
#[derive(Parser, Debug)]
#[command(name = "castboard-ingest")]
#[command(author = "Castboard Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Budgeted Farcaster engagement ingestion and leaderboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the ingest trigger, leaderboard and metrics endpoints
    Serve {
        /// Bind address, overrides HTTP_BIND
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run one ingestion pass
    #[command(group(ArgGroup::new("depth").args(["hours", "window"])))]
    Ingest {
        /// Backfill depth in hours (0 = incremental)
        #[arg(long, value_parser = clap::value_parser!(u32).range(0..=MAX_BACKFILL_HOURS as i64), conflicts_with = "window")]
        hours: Option<u32>,

        /// Backfill depth as a duration (e.g., "6h", "90m")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        window: Option<Duration>,

        /// Ignore the minimum interval between runs
        #[arg(short, long)]
        force: bool,

        /// Refresh counters of casts already stored
        #[arg(long)]
        include_existing: bool,

        /// Scan the backfill window in fixed-width slices
        #[arg(long, requires = "depth")]
        slices: bool,

        /// Search query, overrides SEARCH_QUERY
        #[arg(short, long)]
        query: Option<String>,

        /// Page ceiling for the selected mode
        #[arg(short, long)]
        pages: Option<u32>,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        output: String,
    },

    /// Print the leaderboard
    Top {
        /// Ranking metric (likes, replies, recasts, score)
        #[arg(long, default_value = "replies")]
        by: String,

        /// Number of entries
        #[arg(short = 'n', long, default_value = "15", value_parser = clap::value_parser!(u32).range(1..=MAX_TOP_LIMIT as i64))]
        limit: u32,

        /// Window in hours
        #[arg(long, default_value = "24", value_parser = clap::value_parser!(u32).range(1..=MAX_BACKFILL_HOURS as i64))]
        hours: u32,
    },

    /// Show configuration and ingest state
    Status,

    /// Create the database schema
    Migrate,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Resolves on SIGTERM/SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Wires limiter, HTTP client, upstream and store into an orchestrator
async fn build_orchestrator(config: Arc<Config>) -> Result<Orchestrator> {
    let limiter = Arc::new(SlidingWindowLimiter::per_minute(config.rate_limit_rpm));
    let http = Arc::new(RateLimitedClient::new(
        HttpClientConfig::from_config(&config),
        limiter,
    )?);
    let api = NeynarClient::new(
        http,
        &config.neynar_api_url,
        config.neynar_api_key.clone().unwrap_or_default(),
    );
    let store = storage::create_store(&config).await?;

    Ok(Orchestrator::new(Arc::new(api), store, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Castboard Ingestion Service"
    );

    let config = Config::load()?;

    match cli.command {
        Commands::Serve { bind } => {
            config.validate()?;
            serve(Arc::new(config), bind).await?;
        }

        Commands::Ingest {
            hours,
            window,
            force,
            include_existing,
            slices,
            query,
            pages,
            output,
        } => {
            config.validate()?;
            let hours = match window {
                Some(window) => window_hours(window)?,
                None => hours.unwrap_or(0),
            };
            let request = IngestRequest {
                hours,
                force,
                include_existing,
                slices,
                query,
                pages,
            };
            ingest_once(Arc::new(config), request, &output).await?;
        }

        Commands::Top { by, limit, hours } => {
            show_top(config, &by, limit, hours).await?;
        }

        Commands::Status => {
            show_status(config).await?;
        }

        Commands::Migrate => {
            migrate(config).await?;
        }
    }

    Ok(())
}

/// Rounds a duration up to whole hours within the backfill limit
fn window_hours(window: Duration) -> Result<u32> {
    let hours = window.as_secs().div_ceil(3600);
    if hours == 0 || hours > u64::from(MAX_BACKFILL_HOURS) {
        bail!("--window must be between 1s and {MAX_BACKFILL_HOURS}h");
    }
    Ok(hours as u32)
}

/// Runs the HTTP surface until shutdown
async fn serve(config: Arc<Config>, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or_else(|| config.http_bind.clone());
    let orchestrator = build_orchestrator(config.clone()).await?;

    info!(
        upstream = %config.neynar_api_url,
        storage_type = %config.storage_type,
        rate_limit_rpm = config.rate_limit_rpm,
        metrics_enabled = config.metrics_enabled,
        "Configuration loaded"
    );

    let listener = TcpListener::bind(&addr).await?;
    let state = Arc::new(AppState::new(orchestrator, config));

    server::serve(listener, state, shutdown_signal()).await?;

    info!("Castboard Ingestion Service stopped");
    Ok(())
}

/// Runs a single ingestion pass from the command line
async fn ingest_once(config: Arc<Config>, request: IngestRequest, output_format: &str) -> Result<()> {
    info!(
        hours = request.hours,
        force = request.force,
        include_existing = request.include_existing,
        slices = request.slices,
        query = ?request.query,
        pages = ?request.pages,
        "Starting ingestion"
    );

    request.check()?;
    let orchestrator = build_orchestrator(config).await?;
    let outcome = orchestrator.run(request).await;

    match output_format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        _ => print_summary(&outcome),
    }

    if let RunOutcome::Failed { error, .. } = &outcome {
        bail!("ingestion failed: {error}");
    }
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(summary) => {
            println!("\nIngest Summary");
            println!("==============");
            println!("Run:        {}", summary.run_id);
            println!("Mode:       {:?}", summary.mode);
            println!(
                "Window:     {} .. {}",
                summary.window_start.format("%Y-%m-%d %H:%M"),
                summary.window_end.format("%Y-%m-%d %H:%M")
            );
            println!("Stopped:    {}", summary.stop_reason);
            println!("Scanned:    {}", summary.scanned);
            println!("Unique:     {}", summary.unique);
            println!("Existing:   {}", summary.skipped_existing);
            println!("Detailed:   {}", summary.detail_fetched);
            println!("Upserted:   {}", summary.upserted);
            println!("No author:  {}", summary.dropped_without_author);
            println!("Authors:    {}", summary.authors_upserted);
            println!(
                "Requests:   {} search, {} bulk",
                summary.search_requests, summary.bulk_requests
            );
            if summary.slices_scanned > 0 {
                println!("Slices:     {}", summary.slices_scanned);
            }
            if let Some(batch) = summary.detail_failed_batch {
                println!("Detail batch {batch} failed, later batches skipped");
            }
            match summary.watermark {
                Some(ts) => println!("Watermark:  {}", ts.to_rfc3339()),
                None => println!("Watermark:  unchanged"),
            }
        }
        RunOutcome::Skipped {
            reason,
            last_run_minutes_ago,
            ..
        } => {
            println!("Skipped ({reason}): last run {last_run_minutes_ago} minutes ago, use --force to override");
        }
        RunOutcome::Failed { run_id, error, kind } => {
            println!("Run {run_id} failed ({kind}): {error}");
        }
    }
}

/// Prints the leaderboard for a window
async fn show_top(config: Config, by: &str, limit: u32, hours: u32) -> Result<()> {
    let metric = LeaderboardMetric::parse_or_default(by);
    let store = storage::create_store(&config).await?;
    let window_start = Utc::now() - ChronoDuration::hours(i64::from(hours));
    let entries = store.query_top_content(metric, window_start, limit).await?;

    println!("\nTop casts by {metric} (last {hours}h)");
    println!(
        "\n{:<4} {:<20} {:>7} {:>7} {:>7} {:>7}  {}",
        "#", "Author", "Replies", "Recasts", "Likes", "Score", "Text"
    );
    println!("{}", "-".repeat(90));
    for (rank, entry) in entries.iter().enumerate() {
        let author = entry
            .handle
            .clone()
            .or_else(|| entry.item.author_id.map(|fid| format!("fid:{fid}")))
            .unwrap_or_default();
        let text: String = entry.item.body.chars().take(40).collect();
        println!(
            "{:<4} {:<20} {:>7} {:>7} {:>7} {:>7}  {}",
            rank + 1,
            author,
            entry.item.reply_count,
            entry.item.recast_count,
            entry.item.like_count,
            entry.score,
            text.replace('\n', " ")
        );
    }
    println!("\nTotal: {} casts", entries.len());
    Ok(())
}

/// Shows configuration and ingest state
async fn show_status(config: Config) -> Result<()> {
    println!("\nCastboard Ingestion Status");
    println!("==========================\n");

    println!("Upstream:");
    println!("  - URL:     {}", config.neynar_api_url);
    println!(
        "  - API key: {}",
        if config.has_api_key() { "set" } else { "missing" }
    );
    println!("  - Rate:    {} req/min", config.rate_limit_rpm);
    println!(
        "  - Budget:  {} search, {} bulk per run",
        config.max_search_requests, config.max_bulk_requests
    );

    println!("\nStorage:");
    println!("  Type: {}", config.storage_type);

    let store = storage::create_store(&config).await?;
    let db_now = store.health_check().await?;
    println!("  Clock: {}", db_now.to_rfc3339());

    println!("\nIngest state:");
    match store.get_ingest_state().await? {
        None => println!("  No runs yet"),
        Some(state) => {
            match state.last_seen_timestamp {
                Some(ts) => println!("  Watermark: {}", ts.to_rfc3339()),
                None => println!("  Watermark: none"),
            }
            let ago = (db_now - state.last_run_at).num_minutes();
            println!(
                "  Last run:  {} ({ago} minutes ago, min interval {}m)",
                state.last_run_at.to_rfc3339(),
                config.min_interval_minutes
            );
        }
    }

    Ok(())
}

/// Creates tables and indexes
async fn migrate(config: Config) -> Result<()> {
    if config.storage_type != "postgres" {
        println!("Storage type is {}, nothing to migrate", config.storage_type);
        return Ok(());
    }

    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
    let store = PgStore::connect(url).await?;
    store.migrate().await?;

    println!("Schema is up to date");
    Ok(())
}
