//! Canonical data shapes shared by the collector, parser and loader.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One record exactly as the upstream API returned it.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// The public statistical source a record collection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    /// Banco Central do Brasil, SGS time series (flat date/value pairs)
    Bcb,
    /// IBGE aggregates API, flat view (coded multi-dimensional records)
    Ibge,
}

impl SourceFamily {
    /// Relation name prefix for this family's tables.
    pub fn prefix(&self) -> &'static str {
        match self {
            SourceFamily::Bcb => "bcb",
            SourceFamily::Ibge => "ibge",
        }
    }

    /// Columns that must be present before any row-level work starts.
    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            SourceFamily::Bcb => &["data", "valor"],
            SourceFamily::Ibge => &["D2C", "V"],
        }
    }

    /// Whether the first record of a collection is a label row.
    pub fn emits_header_row(&self) -> bool {
        matches!(self, SourceFamily::Ibge)
    }

    /// Tokens the source uses for "no value published".
    pub fn missing_sentinels(&self) -> &'static [&'static str] {
        match self {
            SourceFamily::Bcb => &[],
            SourceFamily::Ibge => &["...", "..", "X"],
        }
    }

    /// Whether rows of this family carry the descriptive columns.
    pub fn is_descriptive(&self) -> bool {
        matches!(self, SourceFamily::Ibge)
    }
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceFamily::Bcb => "BCB",
            SourceFamily::Ibge => "IBGE",
        })
    }
}

/// How a period token must be read. Six-digit codes are only meaningful
/// together with a kind, since `202301` is both January and Q1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    /// `dd/mm/YYYY`
    Daily,
    /// `YYYYMM`, MM in 01..=12
    Monthly,
    /// `YYYYQQ`, QQ in 01..=04
    Quarterly,
    /// `YYYY`
    Annual,
}

/// Static metadata describing the series a batch belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMeta {
    pub series_code: i64,
    pub display_name: String,
    /// Upstream grouping code (IBGE aggregate), if any
    pub indicator_code: Option<String>,
    pub period_kind: PeriodKind,
}

/// A row in the uniform output schema. `(reference_date, series_code)` is
/// the natural key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub reference_date: NaiveDate,
    pub series_code: i64,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub locality_code: Option<String>,
    pub locality_name: Option<String>,
    pub display_name: Option<String>,
    pub indicator_code: Option<String>,
}

impl NormalizedRow {
    /// A row with only the key and value set.
    pub fn core(reference_date: NaiveDate, series_code: i64, value: Option<f64>) -> Self {
        Self {
            reference_date,
            series_code,
            value,
            unit: None,
            locality_code: None,
            locality_name: None,
            display_name: None,
            indicator_code: None,
        }
    }

    pub fn key(&self) -> (NaiveDate, i64) {
        (self.reference_date, self.series_code)
    }
}

/// Ordered rows for one series and one requested window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    rows: Vec<NormalizedRow>,
}

impl Batch {
    pub fn new(rows: Vec<NormalizedRow>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[NormalizedRow] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NormalizedRow> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<NormalizedRow> {
        self.rows
    }
}

/// Distinct reference dates of `rows`, ascending. Used to provision day partitions.
pub fn distinct_dates(rows: &[NormalizedRow]) -> Vec<NaiveDate> {
    rows.iter()
        .map(|r| r.reference_date)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl FromIterator<NormalizedRow> for Batch {
    fn from_iter<I: IntoIterator<Item = NormalizedRow>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a NormalizedRow;
    type IntoIter = std::slice::Iter<'a, NormalizedRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Inclusive calendar date window reconciled by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// `today - days ..= today`, starting no earlier than the first
    /// representable date.
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        Self {
            start: today
                .checked_sub_signed(Duration::days(i64::from(days)))
                .unwrap_or(NaiveDate::MIN),
            end: today,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_lookback_window_is_ninety_days_inclusive() {
        let window = DateRange::lookback(date(2024, 4, 30), 90);
        assert_eq!(window.start, date(2024, 1, 31));
        assert_eq!(window.end, date(2024, 4, 30));
        assert!(window.contains(date(2024, 1, 31)));
        assert!(!window.contains(date(2024, 5, 1)));
    }

    #[test]
    fn test_date_range_rejects_inverted_bounds() {
        assert!(DateRange::new(date(2024, 2, 1), date(2024, 1, 1)).is_none());
        assert!(DateRange::new(date(2024, 1, 1), date(2024, 1, 1)).is_some());
    }

    #[test]
    fn test_distinct_dates_sorted() {
        let rows = vec![
            NormalizedRow::core(date(2024, 1, 3), 11, Some(1.0)),
            NormalizedRow::core(date(2024, 1, 1), 11, Some(2.0)),
            NormalizedRow::core(date(2024, 1, 3), 12, None),
        ];

        assert_eq!(distinct_dates(&rows), vec![date(2024, 1, 1), date(2024, 1, 3)]);
        assert!(distinct_dates(&[]).is_empty());
    }

    #[test]
    fn test_lookback_beyond_calendar_start_is_clamped() {
        let window = DateRange::lookback(date(2024, 3, 31), u32::MAX);
        assert_eq!(window.start, NaiveDate::MIN);
        assert_eq!(window.end, date(2024, 3, 31));
    }

    #[test]
    fn test_family_required_columns() {
        assert_eq!(SourceFamily::Bcb.required_columns(), &["data", "valor"]);
        assert_eq!(SourceFamily::Ibge.required_columns(), &["D2C", "V"]);
        assert!(SourceFamily::Ibge.emits_header_row());
        assert!(!SourceFamily::Bcb.emits_header_row());
    }
}
