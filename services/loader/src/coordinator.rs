//! Run coordinator
//!
//! Drives each indicator through fetch, projection, staging and merge, one
//! series at a time. A failure ends that series' pipeline only; the run goes
//! on with the next indicator and the aggregate result is the AND of every
//! per-series outcome.

use chrono::NaiveDate;
use collector::{Fetch, SourceRequest};
use parser::{project, DateRange, ProjectionReport, SeriesMeta, SourceFamily};
use std::fmt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::LoadError;
use crate::merge::UpsertMerger;
use crate::staging::StagingWriter;
use crate::warehouse::{TableSchema, Warehouse};

/// One configured series.
#[derive(Debug, Clone, PartialEq)]
pub struct Indicator {
    /// Catalog name, unique per family; part of the relation names.
    pub name: String,
    pub request: SourceRequest,
    pub meta: SeriesMeta,
}

impl Indicator {
    pub fn family(&self) -> SourceFamily {
        self.request.family()
    }

    pub fn final_name(&self) -> String {
        format!("{}_{}", self.family().prefix(), self.name)
    }

    pub fn staging_name(&self) -> String {
        format!("{}_staging", self.final_name())
    }
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetched,
    Normalized,
    Staged,
    Merged,
    Cleaned,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fetched => "fetch",
            Stage::Normalized => "normalize",
            Stage::Staged => "staging",
            Stage::Merged => "merge",
            Stage::Cleaned => "cleanup",
        })
    }
}

/// Terminal state of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    /// Merged and the staging relation dropped.
    Cleaned,
    /// Merged; the staging relation could not be dropped.
    Merged,
    /// Nothing to load, found at `at`.
    SkippedNoData { at: Stage },
    /// The pipeline stopped at `at`.
    Failed { at: Stage },
}

impl SeriesState {
    pub fn is_success(&self) -> bool {
        !matches!(self, SeriesState::Failed { .. })
    }
}

impl fmt::Display for SeriesState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesState::Cleaned => f.write_str("loaded"),
            SeriesState::Merged => f.write_str("loaded (staging kept)"),
            SeriesState::SkippedNoData { at } => write!(f, "skipped at {at}"),
            SeriesState::Failed { at } => write!(f, "FAILED at {at}"),
        }
    }
}

/// What a retrying scheduler may do with a failed series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Nothing durable changed; the next run redoes the whole series.
    SafeToRerun,
    /// The merge failed with staging preserved; look at it before rerunning.
    NeedsInspection,
}

#[derive(Debug, Clone)]
pub struct SeriesOutcome {
    pub name: String,
    pub family: SourceFamily,
    pub state: SeriesState,
    pub records_fetched: usize,
    pub rows_staged: usize,
    pub rows_affected: u64,
    pub report: Option<ProjectionReport>,
    pub error: Option<String>,
    pub retry: Option<RetryDisposition>,
}

impl SeriesOutcome {
    fn new(indicator: &Indicator) -> Self {
        Self {
            name: indicator.name.clone(),
            family: indicator.family(),
            state: SeriesState::SkippedNoData { at: Stage::Fetched },
            records_fetched: 0,
            rows_staged: 0,
            rows_affected: 0,
            report: None,
            error: None,
            retry: None,
        }
    }

    fn failed(mut self, at: Stage, error: impl ToString, retry: RetryDisposition) -> Self {
        self.state = SeriesState::Failed { at };
        self.error = Some(error.to_string());
        self.retry = Some(retry);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub window: DateRange,
    pub outcomes: Vec<SeriesOutcome>,
}

impl RunReport {
    /// True only if no series failed. An empty run succeeds.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(SeriesOutcome::is_success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SeriesOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn outcome(&self, name: &str) -> Option<&SeriesOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Per-series table plus the aggregate line.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run {} window {}\n", self.run_id, self.window));
        out.push_str(&format!("{:-<96}\n", ""));
        out.push_str(&format!(
            "{:<6} {:<40} {:<22} {:>8} {:>8}  {}\n",
            "source", "series", "state", "staged", "merged", "note"
        ));
        for o in &self.outcomes {
            let note = match (&o.error, &o.retry) {
                (Some(e), Some(RetryDisposition::NeedsInspection)) => format!("{e} [inspect staging]"),
                (Some(e), _) => e.clone(),
                (None, _) => match &o.report {
                    Some(r) if r.has_quality_issues() => format!(
                        "{} invalid dates, {} invalid values, {} excluded",
                        r.invalid_dates, r.invalid_values, r.excluded_rows
                    ),
                    _ => String::new(),
                },
            };
            out.push_str(&format!(
                "{:<6} {:<40} {:<22} {:>8} {:>8}  {}\n",
                o.family.to_string(),
                o.name,
                o.state.to_string(),
                o.rows_staged,
                o.rows_affected,
                note
            ));
        }
        out.push_str(&format!("{:-<96}\n", ""));
        let failed = self.failed().count();
        out.push_str(&format!(
            "{} series, {} failed: {}\n",
            self.outcomes.len(),
            failed,
            if self.succeeded() { "SUCCESS" } else { "FAILURE" }
        ));
        out
    }
}

pub struct RunCoordinator<'a, F: Fetch + ?Sized, W: Warehouse + ?Sized> {
    fetcher: &'a F,
    warehouse: &'a W,
    settings: &'a Settings,
}

impl<'a, F: Fetch + ?Sized, W: Warehouse + ?Sized> RunCoordinator<'a, F, W> {
    pub fn new(fetcher: &'a F, warehouse: &'a W, settings: &'a Settings) -> Self {
        Self {
            fetcher,
            warehouse,
            settings,
        }
    }

    /// Reconcile every indicator over `window`, or over the lookback window
    /// ending `today` when none is given.
    pub async fn run(
        &self,
        indicators: &[Indicator],
        window: Option<DateRange>,
        today: NaiveDate,
    ) -> RunReport {
        let window = window.unwrap_or_else(|| DateRange::lookback(today, self.settings.lookback_days));
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);

        async move {
            info!(window = %window, series = indicators.len(), "run started");

            let mut outcomes = Vec::with_capacity(indicators.len());
            for indicator in indicators {
                let span = info_span!("series", series = %indicator.name, source = %indicator.family());
                let outcome = self.run_series(indicator, &window).instrument(span).await;
                outcomes.push(outcome);
            }

            let report = RunReport {
                run_id,
                window,
                outcomes,
            };
            let failed = report.failed().count();
            if failed == 0 {
                info!(series = report.outcomes.len(), "run finished");
            } else {
                error!(series = report.outcomes.len(), failed, "run finished with failures");
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn run_series(&self, indicator: &Indicator, window: &DateRange) -> SeriesOutcome {
        let mut outcome = SeriesOutcome::new(indicator);
        let family = indicator.family();

        let records = self.fetcher.fetch(&indicator.request, window).await;
        outcome.records_fetched = records.len();
        if records.is_empty() {
            info!("no records fetched, skipping");
            return outcome;
        }

        let projection = project(&records, family, &indicator.meta);
        let rejected = projection.report.rejected.clone();
        outcome.report = Some(projection.report);
        if let Some(err) = rejected {
            error!(error = %err, "batch rejected");
            return outcome.failed(Stage::Normalized, err, RetryDisposition::SafeToRerun);
        }
        let batch = projection.batch;
        if batch.is_empty() {
            outcome.state = SeriesState::SkippedNoData { at: Stage::Normalized };
            info!(records = records.len(), "no usable rows, skipping");
            return outcome;
        }

        let destination = self.settings.destination(family);
        let schema = TableSchema::for_family(family);
        let staging_name = indicator.staging_name();
        let final_name = indicator.final_name();
        let writer = StagingWriter::new(self.warehouse, destination, &schema);

        if let Err(e) = writer.write(&batch, &staging_name).await {
            error!(error = %e, "staging failed");
            return outcome.failed(Stage::Staged, e, RetryDisposition::SafeToRerun);
        }
        outcome.rows_staged = batch.len();

        let merger = UpsertMerger::new(self.warehouse, destination, &schema);
        match merger.merge(&staging_name, &final_name).await {
            Ok(affected) => outcome.rows_affected = affected,
            Err(e) => {
                let retry = match e {
                    LoadError::MergeFailed { .. } => RetryDisposition::NeedsInspection,
                    _ => RetryDisposition::SafeToRerun,
                };
                error!(error = %e, staging = %staging_name, "merge failed, staging kept");
                return outcome.failed(Stage::Merged, e, retry);
            }
        }

        outcome.state = match writer.discard(&staging_name).await {
            Ok(()) => SeriesState::Cleaned,
            Err(e) => {
                warn!(error = %e, "merge succeeded but staging could not be dropped");
                SeriesState::Merged
            }
        };
        info!(
            staged = outcome.rows_staged,
            affected = outcome.rows_affected,
            "series loaded"
        );
        outcome
    }
}
