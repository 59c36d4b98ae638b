//! Period and value normalization
//!
//! Pure functions turning source tokens into canonical `(date, number)` pairs.
//! A token that cannot be read yields `None`; that is a per-row condition the
//! projector counts, never an error.

use chrono::NaiveDate;

use crate::model::PeriodKind;

/// First month of each quarter, indexed by quarter - 1.
const QUARTER_START_MONTH: [u32; 4] = [1, 4, 7, 10];

// =============================================================================
// Dates
// =============================================================================

/// Parse a period token under an explicit period kind.
///
/// - `YYYY` -> Jan 1 (any non-daily kind)
/// - `YYYYMM` under `Monthly` -> first of that month, MM in 1..=12
/// - `YYYYQQ` under `Quarterly` -> first of the quarter's first month, QQ in 1..=4
/// - `dd/mm/YYYY` under `Daily`
///
/// Six-digit tokens under `Annual` yield no date.
pub fn parse_period(token: &str, kind: PeriodKind) -> Option<NaiveDate> {
    let token = token.trim();

    if kind == PeriodKind::Daily {
        return parse_day_date(token);
    }

    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match token.len() {
        4 => NaiveDate::from_ymd_opt(token.parse().ok()?, 1, 1),
        6 => {
            let year: i32 = token[..4].parse().ok()?;
            let code: u32 = token[4..].parse().ok()?;
            let month = match kind {
                PeriodKind::Monthly if (1..=12).contains(&code) => code,
                PeriodKind::Quarterly if (1..=4).contains(&code) => {
                    QUARTER_START_MONTH[(code - 1) as usize]
                }
                _ => return None,
            };
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        _ => None,
    }
}

/// Parse a `dd/mm/YYYY` date. Impossible calendar dates yield `None`.
pub fn parse_day_date(token: &str) -> Option<NaiveDate> {
    let token = token.trim();
    let mut parts = token.split('/');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || year.len() != 4 || day.len() > 2 || month.len() > 2 {
        return None;
    }
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !(digits(day) && digits(month) && digits(year)) {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

// =============================================================================
// Values
// =============================================================================

/// Outcome of reading a value token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueToken {
    Number(f64),
    /// Empty token or a source "not published" sentinel
    Missing,
    /// Something that is not a number after normalization
    Invalid,
}

impl ValueToken {
    pub fn number(self) -> Option<f64> {
        match self {
            ValueToken::Number(v) => Some(v),
            _ => None,
        }
    }
}

/// Classify a locale-formatted numeric token. Accepts a decimal comma or a
/// decimal point; grouping separators are not accepted.
pub fn classify_value(token: &str, sentinels: &[&str]) -> ValueToken {
    let token = token.trim();
    if token.is_empty() || sentinels.contains(&token) {
        return ValueToken::Missing;
    }

    match token.replace(',', ".").parse::<f64>() {
        Ok(v) if v.is_finite() => ValueToken::Number(v),
        _ => ValueToken::Invalid,
    }
}

/// Parse a value token; missing and invalid both yield `None`.
pub fn parse_value(token: &str, sentinels: &[&str]) -> Option<f64> {
    classify_value(token, sentinels).number()
}

/// Normalize one `(period, value)` token pair.
pub fn normalize(
    period: &str,
    value: &str,
    kind: PeriodKind,
    sentinels: &[&str],
) -> (Option<NaiveDate>, Option<f64>) {
    (parse_period(period, kind), parse_value(value, sentinels))
}

// =============================================================================
// TESTS
// =============================================================================
