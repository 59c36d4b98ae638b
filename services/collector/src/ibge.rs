//! IBGE aggregates API (v3), flat view

use chrono::{Datelike, NaiveDate};
use parser::{DateRange, PeriodKind, RawRecord};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{read_response, FetchError};

pub const IBGE_AGGREGATE_API_BASE_URL: &str = "https://servicodados.ibge.gov.br/api/v3/agregados";

/// Country-level aggregate.
pub const DEFAULT_LOCALITIES: &str = "N1[all]";

fn default_localities() -> String {
    DEFAULT_LOCALITIES.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbgeRequest {
    pub aggregate_code: String,
    /// One code, or several joined by `|`
    pub variable_code: String,
    pub period_kind: PeriodKind,
    /// Explicit period selector (e.g. `202301-202412`); derived from the run
    /// window when absent
    #[serde(default)]
    pub periods: Option<String>,
    #[serde(default = "default_localities")]
    pub localities: String,
    /// Classification filter, e.g. `315[7169]`
    #[serde(default)]
    pub classification: Option<String>,
}

/// Period selector covering `window` in the codes of `kind`.
pub fn period_range(kind: PeriodKind, window: &DateRange) -> String {
    let code = |d: NaiveDate| match kind {
        PeriodKind::Annual => format!("{}", d.year()),
        PeriodKind::Quarterly => format!("{}{:02}", d.year(), (d.month() - 1) / 3 + 1),
        PeriodKind::Monthly | PeriodKind::Daily => format!("{}{:02}", d.year(), d.month()),
    };
    format!("{}-{}", code(window.start), code(window.end))
}

#[derive(Debug, Clone)]
pub struct IbgeClient {
    http: Client,
    base_url: String,
}

impl IbgeClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, IBGE_AGGREGATE_API_BASE_URL)
    }

    pub fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn aggregate_url(&self, request: &IbgeRequest, window: &DateRange) -> String {
        let periods = request
            .periods
            .clone()
            .unwrap_or_else(|| period_range(request.period_kind, window));
        format!(
            "{}/{}/periodos/{}/variaveis/{}",
            self.base_url, request.aggregate_code, periods, request.variable_code
        )
    }

    pub fn query_params(request: &IbgeRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("localidades", request.localities.clone()),
            ("view", "flat".to_string()),
        ];
        if let Some(classification) = &request.classification {
            params.push(("classificacao", classification.clone()));
        }
        params
    }

    /// Fetch an aggregate, surfacing every failure.
    pub async fn try_fetch(
        &self,
        request: &IbgeRequest,
        window: &DateRange,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.aggregate_url(request, window);
        let params = Self::query_params(request);
        debug!(url = %url, params = ?params, "IBGE request");

        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        read_response(&url, response).await
    }

    /// Fetch an aggregate; failures are logged and yield no records.
    pub async fn fetch(&self, request: &IbgeRequest, window: &DateRange) -> Vec<RawRecord> {
        let aggregate = request.aggregate_code.as_str();
        let variable = request.variable_code.as_str();
        info!(aggregate, variable, window = %window, "requesting IBGE aggregate");

        match self.try_fetch(request, window).await {
            Ok(records) if records.is_empty() => {
                warn!(aggregate, variable, "IBGE returned an empty response");
                records
            }
            Ok(records) => {
                info!(aggregate, variable, records = records.len(), "IBGE aggregate fetched");
                records
            }
            Err(e) => {
                if e.is_timeout() {
                    error!(aggregate, variable, error = %e, "IBGE request timed out");
                } else {
                    error!(aggregate, variable, error = %e, "IBGE request failed");
                }
                if let Some(body) = e.body_preview() {
                    debug!(aggregate, body = %body, "IBGE response body");
                }
                Vec::new()
            }
        }
    }
}
