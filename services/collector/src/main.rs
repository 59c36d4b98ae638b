//! Collector CLI - fetches one series window and prints the raw records
//!
//! Used to inspect what a source currently returns, e.g. after the loader
//! reports a structural rejection or a jump in unparseable rows.
//!
//! Usage:
//!   # BCB series, default lookback window:
//!   cargo run --bin collector -- bcb --series-code 11
//!
//!   # IBGE aggregate with explicit periods:
//!   cargo run --bin collector -- ibge --aggregate 1737 --variable 63 \
//!       --period-kind monthly --periods 202401-202406 --classification "315[7169]"

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use collector::{
    build_http_client, BcbClient, BcbRequest, DateRange, IbgeClient, IbgeRequest, Timeouts,
};
use parser::PeriodKind;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Fetches raw indicator records from public sources")]
struct Args {
    /// First day of the window (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,

    /// Last day of the window (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,

    /// Lookback used when no explicit window is given
    #[arg(long, default_value = "90", value_parser = clap::value_parser!(u32).range(0..=36500))]
    lookback_days: u32,

    /// Print only the record count
    #[arg(long, default_value = "false")]
    count_only: bool,

    #[command(subcommand)]
    source: SourceArgs,
}

#[derive(Subcommand, Debug)]
enum SourceArgs {
    /// Banco Central SGS series
    Bcb {
        #[arg(long)]
        series_code: i64,
    },
    /// IBGE aggregate (flat view)
    Ibge {
        #[arg(long)]
        aggregate: String,
        #[arg(long)]
        variable: String,
        #[arg(long, value_enum)]
        period_kind: KindArg,
        #[arg(long)]
        periods: Option<String>,
        #[arg(long, default_value = collector::ibge::DEFAULT_LOCALITIES)]
        localities: String,
        #[arg(long)]
        classification: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Monthly,
    Quarterly,
    Annual,
}

impl From<KindArg> for PeriodKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Monthly => PeriodKind::Monthly,
            KindArg::Quarterly => PeriodKind::Quarterly,
            KindArg::Annual => PeriodKind::Annual,
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
    let timeouts = Timeouts::from_env()?;

    let window = match (args.start, args.end) {
        (Some(start), Some(end)) => {
            DateRange::new(start, end).context("--start must not be after --end")?
        }
        _ => DateRange::lookback(Local::now().date_naive(), args.lookback_days),
    };
    info!(window = %window, "collector window");

    let records = match args.source {
        SourceArgs::Bcb { series_code } => {
            let client = BcbClient::new(build_http_client(timeouts.bcb)?);
            client
                .try_fetch(&BcbRequest { series_code }, &window)
                .await
                .context("BCB fetch failed")?
        }
        SourceArgs::Ibge {
            aggregate,
            variable,
            period_kind,
            periods,
            localities,
            classification,
        } => {
            let client = IbgeClient::new(build_http_client(timeouts.ibge)?);
            let request = IbgeRequest {
                aggregate_code: aggregate,
                variable_code: variable,
                period_kind: period_kind.into(),
                periods,
                localities,
                classification,
            };
            client
                .try_fetch(&request, &window)
                .await
                .context("IBGE fetch failed")?
        }
    };

    if args.count_only {
        println!("{}", records.len());
    } else {
        println!("{}", serde_json::to_string_pretty(&records)?);
    }
    info!(records = records.len(), "done");

    Ok(())
}
