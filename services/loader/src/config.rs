//! Process configuration and the indicator catalog

use collector::ibge::DEFAULT_LOCALITIES;
use collector::{BcbRequest, IbgeRequest, SourceRequest, Timeouts};
use parser::{PeriodKind, SeriesMeta, SourceFamily};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::coordinator::Indicator;
use crate::error::ConfigError;
use crate::warehouse::validate_identifier;

pub const DEFAULT_DATASET_BCB: &str = "dados_publicos_bcb";
pub const DEFAULT_DATASET_IBGE: &str = "dados_publicos_ibge";
pub const DEFAULT_LOCATION: &str = "southamerica-east1";
pub const DEFAULT_LOOKBACK_DAYS: u32 = 90;
/// About a century; anything longer is a typo.
pub const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// Where one source family's relations live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub dataset: String,
    pub location: String,
}

/// Settings threaded into the run coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bcb: Destination,
    pub ibge: Destination,
    pub lookback_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bcb: Destination {
                dataset: DEFAULT_DATASET_BCB.to_string(),
                location: DEFAULT_LOCATION.to_string(),
            },
            ibge: Destination {
                dataset: DEFAULT_DATASET_IBGE.to_string(),
                location: DEFAULT_LOCATION.to_string(),
            },
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl Settings {
    pub fn destination(&self, family: SourceFamily) -> &Destination {
        match family {
            SourceFamily::Bcb => &self.bcb,
            SourceFamily::Ibge => &self.ibge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent only in dry runs.
    pub db_url: Option<String>,
    pub settings: Settings,
    pub timeouts: Timeouts,
}

impl Config {
    pub fn from_env(dry_run: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), dry_run)
    }

    /// Build from any key lookup. `DB_URL` is required unless `dry_run`.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        dry_run: bool,
    ) -> Result<Self, ConfigError> {
        let db_url = lookup("DB_URL");
        if db_url.is_none() && !dry_run {
            return Err(ConfigError::MissingVar("DB_URL"));
        }

        let location = lookup("WAREHOUSE_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let dataset = |key: &'static str, default: &str| -> Result<String, ConfigError> {
            let value = lookup(key).unwrap_or_else(|| default.to_string());
            validate_identifier(&value, 63)
                .map_err(|_| ConfigError::InvalidVar { key, value: value.clone() })?;
            Ok(value)
        };
        let lookback_days = match lookup("LOOKBACK_DAYS") {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|days| *days <= MAX_LOOKBACK_DAYS)
                .ok_or(ConfigError::InvalidVar {
                    key: "LOOKBACK_DAYS",
                    value,
                })?,
            None => DEFAULT_LOOKBACK_DAYS,
        };
        let timeouts = Timeouts::from_lookup(&lookup)
            .map_err(|e| ConfigError::InvalidVar { key: e.key, value: e.value })?;

        Ok(Self {
            db_url,
            settings: Settings {
                bcb: Destination {
                    dataset: dataset("WAREHOUSE_DATASET_BCB", DEFAULT_DATASET_BCB)?,
                    location: location.clone(),
                },
                ibge: Destination {
                    dataset: dataset("WAREHOUSE_DATASET_IBGE", DEFAULT_DATASET_IBGE)?,
                    location,
                },
                lookback_days,
            },
            timeouts,
        })
    }
}

// =============================================================================
// Indicator catalog
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_localities() -> String {
    DEFAULT_LOCALITIES.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub version: String,
    #[serde(default)]
    pub bcb: Vec<BcbEntry>,
    #[serde(default)]
    pub ibge: Vec<IbgeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BcbEntry {
    pub name: String,
    /// SGS series code
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IbgeEntry {
    pub name: String,
    pub aggregate_code: String,
    pub variable_code: String,
    pub display_name: String,
    pub period_kind: PeriodKind,
    #[serde(default)]
    pub periods: Option<String>,
    #[serde(default = "default_localities")]
    pub localities: String,
    #[serde(default)]
    pub classification: Option<String>,
    /// Defaults to the variable code; required when several variables are requested.
    #[serde(default)]
    pub series_code: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Which catalog entries a run covers.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// `None` selects both families.
    pub family: Option<SourceFamily>,
    pub series: Option<String>,
}

impl Selection {
    fn matches(&self, family: SourceFamily, name: &str, enabled: bool) -> bool {
        // Naming a series explicitly runs it even when disabled.
        if let Some(series) = &self.series {
            return series == name && self.family.map_or(true, |f| f == family);
        }
        enabled && self.family.map_or(true, |f| f == family)
    }
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::CatalogParse { source, .. } => ConfigError::CatalogParse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let catalog: Catalog =
            serde_json::from_str(content).map_err(|source| ConfigError::CatalogParse {
                path: "<inline>".to_string(),
                source,
            })?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let names = self
            .bcb
            .iter()
            .map(|e| (SourceFamily::Bcb, &e.name))
            .chain(self.ibge.iter().map(|e| (SourceFamily::Ibge, &e.name)));
        for (family, name) in names {
            if !seen.insert((family, name.as_str())) {
                return Err(ConfigError::DuplicateIndicator(name.clone()));
            }
            // Becomes part of the relation names.
            let table = format!("{}_{}_staging", family.prefix(), name);
            if validate_identifier(&table, 50).is_err() {
                return Err(ConfigError::InvalidIndicator {
                    name: name.clone(),
                    reason: "name must be lowercase [a-z0-9_] and short enough for a table name"
                        .to_string(),
                });
            }
        }
        for entry in &self.ibge {
            entry.series_code()?;
            if entry.period_kind == PeriodKind::Daily {
                return Err(ConfigError::InvalidIndicator {
                    name: entry.name.clone(),
                    reason: "IBGE aggregates have no daily periods".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Indicators selected for a run, BCB first, in catalog order.
    pub fn indicators(&self, selection: &Selection) -> Result<Vec<Indicator>, ConfigError> {
        let mut out = Vec::new();
        for entry in &self.bcb {
            if selection.matches(SourceFamily::Bcb, &entry.name, entry.enabled) {
                out.push(entry.to_indicator());
            }
        }
        for entry in &self.ibge {
            if selection.matches(SourceFamily::Ibge, &entry.name, entry.enabled) {
                out.push(entry.to_indicator()?);
            }
        }
        Ok(out)
    }
}

impl BcbEntry {
    fn to_indicator(&self) -> Indicator {
        let display_name = if self.description.is_empty() {
            self.name.clone()
        } else {
            self.description.clone()
        };
        Indicator {
            name: self.name.clone(),
            request: SourceRequest::Bcb(BcbRequest {
                series_code: self.code,
            }),
            meta: SeriesMeta {
                series_code: self.code,
                display_name,
                indicator_code: None,
                period_kind: PeriodKind::Daily,
            },
        }
    }
}

impl IbgeEntry {
    fn series_code(&self) -> Result<i64, ConfigError> {
        match self.series_code {
            Some(code) => Ok(code),
            None => self.variable_code.trim().parse().map_err(|_| ConfigError::InvalidIndicator {
                name: self.name.clone(),
                reason: format!(
                    "variable_code '{}' is not numeric; set series_code explicitly",
                    self.variable_code
                ),
            }),
        }
    }

    fn to_indicator(&self) -> Result<Indicator, ConfigError> {
        Ok(Indicator {
            name: self.name.clone(),
            request: SourceRequest::Ibge(IbgeRequest {
                aggregate_code: self.aggregate_code.clone(),
                variable_code: self.variable_code.clone(),
                period_kind: self.period_kind,
                periods: self.periods.clone(),
                localities: self.localities.clone(),
                classification: self.classification.clone(),
            }),
            meta: SeriesMeta {
                series_code: self.series_code()?,
                display_name: self.display_name.clone(),
                indicator_code: Some(self.aggregate_code.clone()),
                period_kind: self.period_kind,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    const CATALOG: &str = r#"{
        "version": "1.0",
        "bcb": [
            {"name": "selic_diaria", "code": 11, "description": "Taxa Selic diaria"},
            {"name": "dolar_ptax_venda", "code": 1, "enabled": false}
        ],
        "ibge": [
            {
                "name": "ipca_variacao_mensal_brasil",
                "aggregate_code": "1737",
                "variable_code": "63",
                "display_name": "IPCA - Variacao mensal",
                "period_kind": "monthly",
                "classification": "315[7169]"
            }
        ]
    }"#;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup(&[("DB_URL", "postgres://localhost/x")]), false).unwrap();
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/x"));
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.timeouts, Timeouts::default());
    }

    #[test]
    fn test_config_requires_db_url_unless_dry_run() {
        let err = Config::from_lookup(lookup(&[]), false).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("DB_URL")));
        assert!(Config::from_lookup(lookup(&[]), true).unwrap().db_url.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_lookup(
            lookup(&[
                ("WAREHOUSE_DATASET_BCB", "bcb_raw"),
                ("WAREHOUSE_LOCATION", "us-east1"),
                ("LOOKBACK_DAYS", "30"),
                ("HTTP_TIMEOUT_IBGE_SECS", "120"),
            ]),
            true,
        )
        .unwrap();
        assert_eq!(config.settings.bcb.dataset, "bcb_raw");
        assert_eq!(config.settings.ibge.location, "us-east1");
        assert_eq!(config.settings.lookback_days, 30);
        assert_eq!(config.timeouts.ibge, Duration::from_secs(120));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = Config::from_lookup(lookup(&[("LOOKBACK_DAYS", "ninety")]), true).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { key: "LOOKBACK_DAYS", .. }));

        let err = Config::from_lookup(lookup(&[("WAREHOUSE_DATASET_IBGE", "Dados IBGE")]), true)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { key: "WAREHOUSE_DATASET_IBGE", .. }));

        let err = Config::from_lookup(lookup(&[("HTTP_TIMEOUT_BCB_SECS", "abc")]), true).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { key: "HTTP_TIMEOUT_BCB_SECS", .. }));
    }

    #[test]
    fn test_config_bounds_lookback() {
        let err = Config::from_lookup(lookup(&[("LOOKBACK_DAYS", "4000000000")]), true).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar { key: "LOOKBACK_DAYS", ref value } if value == "4000000000"
        ));

        let err = Config::from_lookup(lookup(&[("LOOKBACK_DAYS", "36501")]), true).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVar { key: "LOOKBACK_DAYS", .. }));

        let config = Config::from_lookup(lookup(&[("LOOKBACK_DAYS", "36500")]), true).unwrap();
        assert_eq!(config.settings.lookback_days, MAX_LOOKBACK_DAYS);
    }

    #[test]
    fn test_catalog_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.version, "1.0");
        assert_eq!(catalog.bcb.len(), 2);
        assert_eq!(catalog.ibge[0].localities, "N1[all]");
    }

    #[test]
    fn test_catalog_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::CatalogRead { .. }));
    }

    #[test]
    fn test_catalog_parse_error_names_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = Catalog::load(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_indicators_skip_disabled() {
        let catalog = Catalog::parse(CATALOG).unwrap();
        let names: Vec<String> = catalog
            .indicators(&Selection::default())
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["selic_diaria", "ipca_variacao_mensal_brasil"]);
    }

    #[test]
    fn test_indicators_selection() {
        let catalog = Catalog::parse(CATALOG).unwrap();

        let ibge_only = Selection {
            family: Some(SourceFamily::Ibge),
            series: None,
        };
        let indicators = catalog.indicators(&ibge_only).unwrap();
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].meta.series_code, 63);
        assert_eq!(indicators[0].meta.indicator_code.as_deref(), Some("1737"));
        assert_eq!(indicators[0].meta.period_kind, PeriodKind::Monthly);

        let named = Selection {
            family: None,
            series: Some("dolar_ptax_venda".to_string()),
        };
        let indicators = catalog.indicators(&named).unwrap();
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].meta.display_name, "dolar_ptax_venda");
    }

    #[test]
    fn test_catalog_rejects_duplicates_and_bad_names() {
        let dup = r#"{"version":"1","bcb":[{"name":"a","code":1},{"name":"a","code":2}]}"#;
        assert!(matches!(Catalog::parse(dup), Err(ConfigError::DuplicateIndicator(_))));

        let bad = r#"{"version":"1","bcb":[{"name":"Selic Diaria","code":11}]}"#;
        assert!(matches!(Catalog::parse(bad), Err(ConfigError::InvalidIndicator { .. })));
    }

    #[test]
    fn test_catalog_requires_numeric_series_code() {
        let multi = r#"{"version":"1","ibge":[{"name":"x","aggregate_code":"1","variable_code":"63|69",
            "display_name":"x","period_kind":"monthly"}]}"#;
        assert!(matches!(Catalog::parse(multi), Err(ConfigError::InvalidIndicator { .. })));

        let explicit = r#"{"version":"1","ibge":[{"name":"x","aggregate_code":"1","variable_code":"63|69",
            "display_name":"x","period_kind":"monthly","series_code":63}]}"#;
        assert!(Catalog::parse(explicit).is_ok());
    }

    #[test]
    fn test_shipped_catalog_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/indicators.json");
        let catalog = Catalog::load(path).unwrap();
        let indicators = catalog.indicators(&Selection::default()).unwrap();
        assert_eq!(indicators.len(), 10);
    }
}
