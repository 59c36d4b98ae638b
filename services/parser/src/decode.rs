//! Typed decoders for the raw record shapes each source family emits.
//!
//! Column presence is validated once here. Everything downstream works on
//! `BcbRecord` / `IbgeRecord` instead of looking fields up by name.

use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;

use crate::model::{RawRecord, SourceFamily};
use crate::normalize::{classify_value, ValueToken};

/// Structural failures found before any row is read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectError {
    #[error("{family} records are missing required columns: {missing:?}")]
    SchemaMissing {
        family: SourceFamily,
        missing: Vec<String>,
    },
}

/// One BCB SGS observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcbRecord {
    pub data: Option<String>,
    pub valor: Option<String>,
}

/// One IBGE flat-view observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IbgeRecord {
    /// `D2C`
    pub period: Option<String>,
    /// `V`
    pub value: Option<String>,
    /// `NC`, falling back to `D1C`
    pub locality_code: Option<String>,
    /// `D1N`
    pub locality_name: Option<String>,
    /// `MN`
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRecords {
    Bcb(Vec<BcbRecord>),
    Ibge(Vec<IbgeRecord>),
}

impl SourceRecords {
    pub fn len(&self) -> usize {
        match self {
            SourceRecords::Bcb(rows) => rows.len(),
            SourceRecords::Ibge(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of decoding, with how many leading label rows were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub records: SourceRecords,
    pub header_rows_skipped: usize,
}

/// Read a field as a string token. Numbers keep their JSON rendering.
fn token(record: &RawRecord, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Columns that appear in at least one record.
fn present_columns(records: &[RawRecord]) -> BTreeSet<&str> {
    records
        .iter()
        .flat_map(|r| r.keys().map(String::as_str))
        .collect()
}

fn check_columns(family: SourceFamily, records: &[RawRecord]) -> Result<(), ProjectError> {
    let present = present_columns(records);
    let missing: Vec<String> = family
        .required_columns()
        .iter()
        .filter(|c| !present.contains(**c))
        .map(|c| c.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ProjectError::SchemaMissing { family, missing })
    }
}

/// Decode a raw collection for `family`.
///
/// An empty collection decodes to no records. A collection lacking a required
/// column is rejected whole. For families that emit a label row, exactly one
/// leading record is skipped, so a header-only collection decodes to nothing.
pub fn decode(family: SourceFamily, records: &[RawRecord]) -> Result<Decoded, ProjectError> {
    if records.is_empty() {
        return Ok(Decoded {
            records: empty(family),
            header_rows_skipped: 0,
        });
    }

    check_columns(family, records)?;

    let (data, header_rows_skipped) = if family.emits_header_row() {
        if looks_like_data(family, &records[0]) {
            warn!(%family, "leading record has a numeric value; skipping it as the label row anyway");
        }
        (&records[1..], 1)
    } else {
        (records, 0)
    };

    let records = match family {
        SourceFamily::Bcb => SourceRecords::Bcb(
            data.iter()
                .map(|r| BcbRecord {
                    data: token(r, "data"),
                    valor: token(r, "valor"),
                })
                .collect(),
        ),
        SourceFamily::Ibge => SourceRecords::Ibge(
            data.iter()
                .map(|r| IbgeRecord {
                    period: token(r, "D2C"),
                    value: token(r, "V"),
                    locality_code: non_blank(token(r, "NC")).or_else(|| non_blank(token(r, "D1C"))),
                    locality_name: non_blank(token(r, "D1N")),
                    unit: non_blank(token(r, "MN")),
                })
                .collect(),
        ),
    };

    Ok(Decoded {
        records,
        header_rows_skipped,
    })
}

fn empty(family: SourceFamily) -> SourceRecords {
    match family {
        SourceFamily::Bcb => SourceRecords::Bcb(Vec::new()),
        SourceFamily::Ibge => SourceRecords::Ibge(Vec::new()),
    }
}

/// A label row carries text like "Valor" in the value column.
fn looks_like_data(family: SourceFamily, record: &RawRecord) -> bool {
    let column = family.required_columns()[1];
    token(record, column)
        .map(|v| matches!(classify_value(&v, &[]), ValueToken::Number(_)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn ibge_header() -> RawRecord {
        record(json!({
            "NC": "Nível Territorial (Código)", "NN": "Nível Territorial",
            "MC": "Unidade de Medida (Código)", "MN": "Unidade de Medida",
            "V": "Valor",
            "D1C": "Localidade (Código)", "D1N": "Localidade",
            "D2C": "Período (Código)", "D2N": "Período",
        }))
    }

    #[test]
    fn test_bcb_decode_keeps_every_record() {
        let records = vec![
            record(json!({"data": "01/01/2024", "valor": "10.50"})),
            record(json!({"data": "02/01/2024", "valor": 11.75})),
        ];
        let decoded = decode(SourceFamily::Bcb, &records).unwrap();
        assert_eq!(decoded.header_rows_skipped, 0);
        match decoded.records {
            SourceRecords::Bcb(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1].valor.as_deref(), Some("11.75"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_column_rejects_collection() {
        let records = vec![record(json!({"data": "01/04/2024"}))];
        let err = decode(SourceFamily::Bcb, &records).unwrap_err();
        assert_eq!(
            err,
            ProjectError::SchemaMissing {
                family: SourceFamily::Bcb,
                missing: vec!["valor".to_string()],
            }
        );
    }

    #[test]
    fn test_ibge_header_row_skipped() {
        let records = vec![
            ibge_header(),
            record(json!({"NC": "1", "D1N": "Brasil", "D2C": "202410", "V": "0.56", "MN": "%"})),
        ];
        let decoded = decode(SourceFamily::Ibge, &records).unwrap();
        assert_eq!(decoded.header_rows_skipped, 1);
        match decoded.records {
            SourceRecords::Ibge(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].period.as_deref(), Some("202410"));
                assert_eq!(rows[0].locality_code.as_deref(), Some("1"));
                assert_eq!(rows[0].unit.as_deref(), Some("%"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_leading_record_is_flagged_but_still_skipped() {
        let leading = record(json!({"NC": "1", "D2C": "202409", "V": "0.44"}));
        assert!(looks_like_data(SourceFamily::Ibge, &leading));
        assert!(!looks_like_data(SourceFamily::Ibge, &ibge_header()));

        let records = vec![
            leading,
            record(json!({"NC": "1", "D2C": "202410", "V": "0.56"})),
        ];
        let decoded = decode(SourceFamily::Ibge, &records).unwrap();
        assert_eq!(decoded.header_rows_skipped, 1);
        match decoded.records {
            SourceRecords::Ibge(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].period.as_deref(), Some("202410"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ibge_header_only_is_empty() {
        let decoded = decode(SourceFamily::Ibge, &[ibge_header()]).unwrap();
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn test_ibge_locality_code_falls_back_to_d1c() {
        let records = vec![
            ibge_header(),
            record(json!({"D1C": "33", "D2C": "2020", "V": "10"})),
        ];
        let decoded = decode(SourceFamily::Ibge, &records).unwrap();
        match decoded.records {
            SourceRecords::Ibge(rows) => {
                assert_eq!(rows[0].locality_code.as_deref(), Some("33"));
                assert_eq!(rows[0].locality_name, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_collection_decodes_to_nothing() {
        let decoded = decode(SourceFamily::Ibge, &[]).unwrap();
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.header_rows_skipped, 0);
    }
}
