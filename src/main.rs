//! Earnings Tracker
//!
//! Reconciles the cached earnings dataset against the live index membership
//! and prints views of the cached data.
//!
//! Usage:
//!   earnings-tracker update
//!   earnings-tracker list --sort percent --limit 25
//!   earnings-tracker show AAPL
//!   earnings-tracker quotes AAPL MSFT BRK.B

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use earnings_tracker::{
    config::AppConfig,
    query::{self, EarningsBook, SummarySort, UpcomingEvent},
    reconcile::{ReconcileSettings, Reconciler},
    source::{EarningsSource, HttpSource},
    store::SnapshotStore,
    Symbol,
};

#[derive(Parser, Debug)]
#[command(name = "earnings-tracker")]
#[command(about = "Track earnings dates and post-report price moves for index members")]
struct Cli {
    /// Config file (overrides EARNINGS_CONFIG_PATH)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot file (overrides the configured path)
    #[arg(long, env = "EARNINGS_SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch what is missing or stale and rewrite the snapshot
    Update,

    /// Show everything cached for one symbol
    Show { symbol: String },

    /// Rank cached symbols
    List {
        /// percent, next-event or symbol
        #[arg(short, long, default_value = "percent")]
        sort: SummarySort,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Latest traded prices
    Quotes {
        #[arg(required = true)]
        symbols: Vec<String>,
    },

    /// Snapshot metadata
    SnapshotInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_env()?,
    };
    if let Some(path) = cli.snapshot {
        config.snapshot_path = path;
    }
    config.validate().context("Invalid configuration")?;
    let tz = config.timezone()?;

    match cli.command {
        Commands::Update => update(&config).await?,
        Commands::Show { symbol } => show(&open_book(&config)?, &symbol, tz),
        Commands::List { sort, limit } => list(&open_book(&config)?, sort, limit, tz),
        Commands::Quotes { symbols } => quotes(&config, &symbols).await?,
        Commands::SnapshotInfo => snapshot_info(&config.snapshot_path)?,
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "earnings_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_source(config: &AppConfig) -> Result<Arc<dyn EarningsSource>> {
    let source = HttpSource::new(
        config.http.clone(),
        config.universe_path.clone(),
        config.timezone()?,
    )?;
    Ok(Arc::new(source))
}

fn open_book(config: &AppConfig) -> Result<EarningsBook> {
    let path = &config.snapshot_path;
    let store = SnapshotStore::open(path)
        .with_context(|| format!("Failed to open snapshot {:?}", path))?;
    let mut dataset = store.load_or_default()?;
    dataset.recompute_aggregates(config.aggregate_window);
    Ok(EarningsBook::new(dataset))
}

async fn update(config: &AppConfig) -> Result<()> {
    let store = SnapshotStore::open(&config.snapshot_path)
        .with_context(|| format!("Failed to open snapshot {:?}", config.snapshot_path))?;
    let reconciler = Reconciler::new(
        build_source(config)?,
        config.batch_runner(),
        ReconcileSettings::from_config(config)?,
    );

    info!(
        snapshot = ?config.snapshot_path,
        workers = config.max_workers,
        timeout_secs = config.batch_timeout_secs,
        "🚀 Starting update run"
    );
    let (dataset, report) = reconciler.run_update(&store).await?;

    println!("{}", report.format_summary());
    println!("Records in snapshot: {}", dataset.records.len());
    Ok(())
}

fn fmt_date(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string()
}

fn fmt_opt(v: Option<f64>, suffix: &str) -> String {
    v.map(|x| format!("{:.2}{}", x, suffix))
        .unwrap_or_else(|| "-".to_string())
}

fn show(book: &EarningsBook, symbol: &str, tz: Tz) {
    let sym = Symbol::new(symbol);
    let Some(entity) = book.dataset().entity(&sym) else {
        println!("{} is not in the snapshot", sym);
        return;
    };

    println!("=== {} ({}) ===\n", entity.symbol, entity.name);

    let next = match book.next_event(symbol, Utc::now()) {
        Some(UpcomingEvent::Scheduled(ts)) => fmt_date(ts, tz),
        Some(UpcomingEvent::NoneScheduled) => "none scheduled".to_string(),
        Some(UpcomingEvent::Stale) | None => "unknown (run update)".to_string(),
    };
    println!("Next report:     {}", next);

    match book.averages(symbol) {
        Some(avg) => println!(
            "Average move:    {} pts / {}",
            fmt_opt(Some(avg.point_avg), ""),
            fmt_opt(avg.percent_avg, "%")
        ),
        None => println!("Average move:    -"),
    }
    if let Some(range) = book.event_range(symbol) {
        println!(
            "Event range:     {} .. {}",
            fmt_date(range.start, tz),
            fmt_date(range.end, tz)
        );
    }

    if let Some(rows) = book.changes(symbol) {
        println!(
            "\n{:>18} {:>12} {:>12} {:>10}",
            "Report", "Close pre", "Close post", "Change"
        );
        println!("{}", "-".repeat(55));
        for row in rows {
            println!(
                "{:>18} {:>12.2} {:>12.2} {:>10}",
                fmt_date(row.event, tz),
                row.close_pre,
                row.close_post,
                fmt_opt(row.percent_change, "%")
            );
        }
    }

    match book.detail(symbol) {
        Some(text) if !text.is_empty() => println!("\n{}", text),
        Some(_) => println!("\n(no description available)"),
        None => println!("\n(description not fetched yet)"),
    }
}

fn list(book: &EarningsBook, sort: SummarySort, limit: Option<usize>, tz: Tz) {
    let rows = book.summaries(sort);
    let limit = limit.unwrap_or(rows.len());

    println!(
        "{:<8} {:<32} {:>10} {:>10} {:>18} {:>7}",
        "Symbol", "Name", "Avg pts", "Avg %", "Next report", "Events"
    );
    println!("{}", "-".repeat(90));
    for row in rows.into_iter().take(limit) {
        let mut name = row.name.clone();
        if name.chars().count() > 32 {
            name = name.chars().take(31).collect::<String>() + "…";
        }
        println!(
            "{:<8} {:<32} {:>10} {:>10} {:>18} {:>7}",
            row.symbol.as_str(),
            name,
            fmt_opt(row.aggregate.map(|a| a.point_avg), ""),
            fmt_opt(row.aggregate.and_then(|a| a.percent_avg), "%"),
            row.next_event
                .map(|ts| fmt_date(ts, tz))
                .unwrap_or_else(|| "-".to_string()),
            row.event_count
        );
    }
}

async fn quotes(config: &AppConfig, symbols: &[String]) -> Result<()> {
    let source = build_source(config)?;
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    for (symbol, price) in query::current_quotes(source.as_ref(), &refs).await {
        println!("{:<8} {:>12}", symbol.as_str(), fmt_opt(price, ""));
    }
    Ok(())
}

fn snapshot_info(path: &Path) -> Result<()> {
    let store = SnapshotStore::open(path)
        .with_context(|| format!("Failed to open snapshot {:?}", path))?;
    match store.stats()? {
        Some(stats) => {
            let saved = DateTime::<Utc>::from_timestamp(stats.saved_at, 0)
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| stats.saved_at.to_string());
            println!("Snapshot: {:?}", path);
            println!("  saved at: {}", saved);
            println!("  entities: {}", stats.entity_count);
            println!("  records:  {}", stats.record_count);
            println!("  size:     {} bytes", stats.size_bytes);
        }
        None => println!("No snapshot saved at {:?}", path),
    }
    Ok(())
}
