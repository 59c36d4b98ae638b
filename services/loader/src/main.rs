//! Loader CLI - the scheduler-facing entry point
//!
//! Fetches every selected indicator for the reconciliation window, normalizes
//! it, and upserts it into the warehouse. Exits nonzero when any series failed.
//!
//! Usage:
//!   # All enabled indicators, default lookback window:
//!   cargo run --bin loader
//!
//!   # One series over an explicit window:
//!   cargo run --bin loader -- --series selic_diaria --start 2024-01-01 --end 2024-03-31
//!
//!   # Full pipeline against the in-memory warehouse:
//!   cargo run --bin loader -- --source ibge --dry-run

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, ValueEnum};
use collector::{DateRange, HttpFetcher};
use loader::{Catalog, Config, MemoryWarehouse, PgWarehouse, RunCoordinator, Selection, Warehouse};
use parser::SourceFamily;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads public economic indicators into the warehouse")]
struct Args {
    /// Path to the indicator catalog
    #[arg(long, default_value = "config/indicators.json")]
    catalog: String,

    /// Restrict the run to one source
    #[arg(long, value_enum, default_value = "all")]
    source: SourceArg,

    /// Run a single catalog entry by name (even if disabled)
    #[arg(long)]
    series: Option<String>,

    /// First day of the window (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,

    /// Last day of the window (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,

    /// Dry run - use the in-memory warehouse, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SourceArg {
    All,
    Bcb,
    Ibge,
}

impl SourceArg {
    fn family(self) -> Option<SourceFamily> {
        match self {
            SourceArg::All => None,
            SourceArg::Bcb => Some(SourceFamily::Bcb),
            SourceArg::Ibge => Some(SourceFamily::Ibge),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from_env(args.dry_run)?;

    println!("=== Indicadores Publicos Loader ===");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let catalog = Catalog::load(&args.catalog)?;
    println!("Catalog: {} (version {})", args.catalog, catalog.version);

    let selection = Selection {
        family: args.source.family(),
        series: args.series.clone(),
    };
    let indicators = catalog.indicators(&selection)?;
    if indicators.is_empty() {
        anyhow::bail!("No indicators match the filter criteria");
    }

    let window = match (args.start, args.end) {
        (Some(start), Some(end)) => {
            Some(DateRange::new(start, end).context("--start must not be after --end")?)
        }
        _ => None,
    };

    let fetcher = HttpFetcher::new(&config.timeouts).context("Failed to build HTTP client")?;

    let warehouse: Box<dyn Warehouse> = if args.dry_run {
        Box::new(MemoryWarehouse::new())
    } else {
        let db_url = config.db_url.as_deref().context("DB_URL env var missing")?;
        Box::new(
            PgWarehouse::connect(db_url)
                .await
                .context("Failed to connect to database")?,
        )
    };

    println!("\nProcessing {} indicator(s)...", indicators.len());
    let coordinator = RunCoordinator::new(&fetcher, warehouse.as_ref(), &config.settings);
    let report = coordinator
        .run(&indicators, window, Local::now().date_naive())
        .await;

    println!();
    print!("{}", report.summary());

    if !report.succeeded() {
        let failed: Vec<&str> = report.failed().map(|o| o.name.as_str()).collect();
        anyhow::bail!("{} series failed: {}", failed.len(), failed.join(", "));
    }

    Ok(())
}
