//! Row projection: raw collection + series metadata -> Batch
//!
//! CRITICAL: projection is DETERMINISTIC.
//! Same records + same metadata = same Batch and same report.

use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::decode::{decode, BcbRecord, IbgeRecord, ProjectError, SourceRecords};
use crate::model::{Batch, NormalizedRow, PeriodKind, RawRecord, SeriesMeta, SourceFamily};
use crate::normalize::{classify_value, parse_period, ValueToken};

/// Locality name used when a record does not name one.
pub const AGGREGATE_ROOT_LOCALITY: &str = "Brasil";

/// How many raw tokens to keep as examples of each failure.
const SAMPLE_LIMIT: usize = 5;

/// Data-quality counters for one projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionReport {
    pub input_records: usize,
    pub header_rows_skipped: usize,
    /// Rows whose period token did not parse (these are excluded)
    pub invalid_dates: usize,
    /// Rows whose value token was not numeric (kept with no value)
    pub invalid_values: usize,
    /// Rows whose value was empty or a "not published" sentinel
    pub missing_values: usize,
    /// Rows dropped from the batch
    pub excluded_rows: usize,
    /// Earlier occurrences of a key replaced by a later one
    pub duplicates_collapsed: usize,
    pub sample_invalid_dates: Vec<String>,
    pub sample_invalid_values: Vec<String>,
    /// Set when the whole collection was rejected
    pub rejected: Option<ProjectError>,
}

impl ProjectionReport {
    pub fn has_quality_issues(&self) -> bool {
        self.invalid_dates > 0 || self.invalid_values > 0 || self.duplicates_collapsed > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub batch: Batch,
    pub report: ProjectionReport,
}

impl Projection {
    pub fn is_rejected(&self) -> bool {
        self.report.rejected.is_some()
    }
}

/// Project a raw collection into the output schema.
///
/// Structural failures (missing required columns) reject the whole
/// collection: the batch is empty and `report.rejected` says why. Row-level
/// failures never abort: undated rows are excluded, unparseable values are
/// kept as `None`, and both are counted.
pub fn project(records: &[RawRecord], family: SourceFamily, meta: &SeriesMeta) -> Projection {
    let mut report = ProjectionReport {
        input_records: records.len(),
        ..Default::default()
    };

    let decoded = match decode(family, records) {
        Ok(d) => d,
        Err(e) => {
            warn!(series = meta.series_code, %family, error = %e, "collection rejected");
            report.rejected = Some(e);
            return Projection {
                batch: Batch::empty(),
                report,
            };
        }
    };
    report.header_rows_skipped = decoded.header_rows_skipped;

    let rows: Vec<NormalizedRow> = match &decoded.records {
        SourceRecords::Bcb(rows) => rows
            .iter()
            .filter_map(|r| project_bcb(r, family, meta, &mut report))
            .collect(),
        SourceRecords::Ibge(rows) => rows
            .iter()
            .filter_map(|r| project_ibge(r, family, meta, &mut report))
            .collect(),
    };

    let (rows, collapsed) = dedup_keep_last(rows);
    report.duplicates_collapsed = collapsed;

    log_report(meta, family, &report, rows.len());

    Projection {
        batch: Batch::new(rows),
        report,
    }
}

fn project_bcb(
    record: &BcbRecord,
    family: SourceFamily,
    meta: &SeriesMeta,
    report: &mut ProjectionReport,
) -> Option<NormalizedRow> {
    let date = read_date(record.data.as_deref(), PeriodKind::Daily, report)?;
    let value = read_value(record.valor.as_deref(), family, report);
    Some(NormalizedRow::core(date, meta.series_code, value))
}

fn project_ibge(
    record: &IbgeRecord,
    family: SourceFamily,
    meta: &SeriesMeta,
    report: &mut ProjectionReport,
) -> Option<NormalizedRow> {
    let date = read_date(record.period.as_deref(), meta.period_kind, report)?;
    let value = read_value(record.value.as_deref(), family, report);

    Some(NormalizedRow {
        reference_date: date,
        series_code: meta.series_code,
        value,
        unit: record.unit.clone(),
        locality_code: record.locality_code.clone(),
        locality_name: Some(
            record
                .locality_name
                .clone()
                .unwrap_or_else(|| AGGREGATE_ROOT_LOCALITY.to_string()),
        ),
        display_name: Some(meta.display_name.clone()),
        indicator_code: meta.indicator_code.clone(),
    })
}

fn read_date(
    token: Option<&str>,
    kind: PeriodKind,
    report: &mut ProjectionReport,
) -> Option<NaiveDate> {
    let parsed = token.and_then(|t| parse_period(t, kind));

    if parsed.is_none() {
        report.invalid_dates += 1;
        report.excluded_rows += 1;
        if let Some(t) = token {
            push_sample(&mut report.sample_invalid_dates, t);
        }
    }
    parsed
}

fn read_value(token: Option<&str>, family: SourceFamily, report: &mut ProjectionReport) -> Option<f64> {
    let Some(token) = token else {
        report.missing_values += 1;
        return None;
    };

    match classify_value(token, family.missing_sentinels()) {
        ValueToken::Number(v) => Some(v),
        ValueToken::Missing => {
            report.missing_values += 1;
            None
        }
        ValueToken::Invalid => {
            report.invalid_values += 1;
            push_sample(&mut report.sample_invalid_values, token);
            None
        }
    }
}

fn push_sample(samples: &mut Vec<String>, token: &str) {
    if samples.len() < SAMPLE_LIMIT && !samples.iter().any(|s| s == token) {
        samples.push(token.to_string());
    }
}

/// Keep the last occurrence of each natural key, preserving the order in
/// which those last occurrences appear.
fn dedup_keep_last(rows: Vec<NormalizedRow>) -> (Vec<NormalizedRow>, usize) {
    let total = rows.len();
    let mut seen = HashSet::with_capacity(total);
    let mut kept: Vec<NormalizedRow> = rows
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.key()))
        .collect();
    kept.reverse();
    let collapsed = total - kept.len();
    (kept, collapsed)
}

fn log_report(meta: &SeriesMeta, family: SourceFamily, report: &ProjectionReport, rows: usize) {
    if report.invalid_dates > 0 {
        warn!(
            series = meta.series_code,
            %family,
            count = report.invalid_dates,
            samples = ?report.sample_invalid_dates,
            "rows excluded: period did not parse"
        );
    }
    if report.invalid_values > 0 {
        warn!(
            series = meta.series_code,
            %family,
            count = report.invalid_values,
            samples = ?report.sample_invalid_values,
            "values did not parse; kept as null"
        );
    }
    if report.duplicates_collapsed > 0 {
        warn!(
            series = meta.series_code,
            %family,
            count = report.duplicates_collapsed,
            "duplicate keys collapsed (last occurrence kept)"
        );
    }
    info!(
        series = meta.series_code,
        %family,
        input = report.input_records,
        rows,
        missing_values = report.missing_values,
        "projection complete"
    );
}

// =============================================================================
// TESTS
// =============================================================================
