//! Collector - fetches raw indicator records from public statistical APIs
//!
//! Responsibilities:
//! - Build requests for the BCB SGS and IBGE aggregates APIs
//! - Bound every request with a timeout
//! - Decode responses into raw records without interpreting them
//! - Fail soft: any network, HTTP or decode error becomes an empty collection
//!
//! The loader drives collection through the [`Fetch`] trait so that runs can
//! be exercised without network access.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod bcb;
pub mod ibge;

pub use bcb::{BcbClient, BcbRequest};
pub use ibge::{IbgeClient, IbgeRequest};
pub use parser::{DateRange, RawRecord, SourceFamily};

/// Sent with every request so source operators can identify the traffic.
pub const USER_AGENT: &str =
    "IndicadoresPublicos/1.0 (ingestao de indicadores economicos publicos)";

/// How much of an error body to keep for the logs.
const BODY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
        body: String,
    },
}

impl FetchError {
    /// Leading part of the response body, when one was received.
    pub fn body_preview(&self) -> Option<&str> {
        match self {
            FetchError::Status { body, .. } | FetchError::Decode { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

/// What to fetch for one configured indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SourceRequest {
    Bcb(BcbRequest),
    Ibge(IbgeRequest),
}

impl SourceRequest {
    pub fn family(&self) -> SourceFamily {
        match self {
            SourceRequest::Bcb(_) => SourceFamily::Bcb,
            SourceRequest::Ibge(_) => SourceFamily::Ibge,
        }
    }
}

/// Fetch collaborator. Implementations never fail: problems are logged and
/// reported as an empty collection.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &SourceRequest, window: &DateRange) -> Vec<RawRecord>;
}

/// Per-source request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub bcb: Duration,
    pub ibge: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            bcb: Duration::from_secs(30),
            ibge: Duration::from_secs(90),
        }
    }
}

/// A timeout variable that is set but not a whole number of seconds.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{key} has an invalid value '{value}'")]
pub struct InvalidTimeout {
    pub key: &'static str,
    pub value: String,
}

impl Timeouts {
    /// Defaults overridden by `HTTP_TIMEOUT_BCB_SECS` / `HTTP_TIMEOUT_IBGE_SECS`.
    /// Called once by the binaries at startup.
    pub fn from_env() -> Result<Self, InvalidTimeout> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, InvalidTimeout> {
        let secs = |key: &'static str, default: Duration| -> Result<Duration, InvalidTimeout> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| InvalidTimeout { key, value }),
                None => Ok(default),
            }
        };
        let defaults = Self::default();
        Ok(Self {
            bcb: secs("HTTP_TIMEOUT_BCB_SECS", defaults.bcb)?,
            ibge: secs("HTTP_TIMEOUT_IBGE_SECS", defaults.ibge)?,
        })
    }
}

/// Build the HTTP client shared by a source's requests.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(FetchError::Client)
}

/// Live fetcher dispatching on the request's source.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    bcb: BcbClient,
    ibge: IbgeClient,
}

impl HttpFetcher {
    pub fn new(timeouts: &Timeouts) -> Result<Self, FetchError> {
        Ok(Self {
            bcb: BcbClient::new(build_http_client(timeouts.bcb)?),
            ibge: IbgeClient::new(build_http_client(timeouts.ibge)?),
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &SourceRequest, window: &DateRange) -> Vec<RawRecord> {
        match request {
            SourceRequest::Bcb(r) => self.bcb.fetch(r, window).await,
            SourceRequest::Ibge(r) => self.ibge.fetch(r, window).await,
        }
    }
}

/// Decode a JSON array body. A blank body or `[]` is an empty collection.
pub(crate) fn decode_body(url: &str, body: &str) -> Result<Vec<RawRecord>, FetchError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
        body: preview(body),
    })
}

pub(crate) fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// Read the response, turning non-2xx statuses into errors.
pub(crate) async fn read_response(
    url: &str,
    response: reqwest::Response,
) -> Result<Vec<RawRecord>, FetchError> {
    let status = response.status();
    let body = response.text().await.map_err(|source| FetchError::Request {
        url: url.to_string(),
        source,
    })?;

    decode_response(url, status, &body)
}

fn decode_response(
    url: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> Result<Vec<RawRecord>, FetchError> {
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
            body: preview(body),
        });
    }

    decode_body(url, body)
}
