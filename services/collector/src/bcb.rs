//! Banco Central do Brasil - SGS time series API

use parser::{DateRange, RawRecord};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{read_response, FetchError};

pub const BCB_API_BASE_URL: &str = "https://api.bcb.gov.br/dados/serie";

/// The API expects dates as `dd/mm/YYYY`.
const BCB_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BcbRequest {
    pub series_code: i64,
}

#[derive(Debug, Clone)]
pub struct BcbClient {
    http: Client,
    base_url: String,
}

impl BcbClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, BCB_API_BASE_URL)
    }

    pub fn with_base_url(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn series_url(&self, series_code: i64) -> String {
        format!("{}/bcdata.sgs.{}/dados", self.base_url, series_code)
    }

    pub fn query_params(window: &DateRange) -> [(&'static str, String); 3] {
        [
            ("formato", "json".to_string()),
            ("dataInicial", window.start.format(BCB_DATE_FORMAT).to_string()),
            ("dataFinal", window.end.format(BCB_DATE_FORMAT).to_string()),
        ]
    }

    /// Fetch a series window, surfacing every failure.
    pub async fn try_fetch(
        &self,
        request: &BcbRequest,
        window: &DateRange,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.series_url(request.series_code);
        let params = Self::query_params(window);
        debug!(url = %url, params = ?params, "BCB request");

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

    /// Fetch a series window; failures are logged and yield no records.
    pub async fn fetch(&self, request: &BcbRequest, window: &DateRange) -> Vec<RawRecord> {
        info!(series = request.series_code, window = %window, "requesting BCB series");

        match self.try_fetch(request, window).await {
            Ok(records) if records.is_empty() => {
                warn!(series = request.series_code, window = %window, "BCB returned no data");
                records
            }
            Ok(records) => {
                info!(series = request.series_code, records = records.len(), "BCB series fetched");
                records
            }
            Err(e) => {
                if e.is_timeout() {
                    error!(series = request.series_code, error = %e, "BCB request timed out");
                } else {
                    error!(series = request.series_code, error = %e, "BCB request failed");
                }
                if let Some(body) = e.body_preview() {
                    error!(series = request.series_code, body = %body, "BCB response body");
                }
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn window() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_series_url() {
        let client = BcbClient::new(Client::new());
        assert_eq!(
            client.series_url(11),
            "https://api.bcb.gov.br/dados/serie/bcdata.sgs.11/dados"
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = BcbClient::with_base_url(Client::new(), "http://localhost:9000/");
        assert_eq!(client.series_url(1), "http://localhost:9000/bcdata.sgs.1/dados");
    }

    #[test]
    fn test_query_params_use_brazilian_dates() {
        let params = BcbClient::query_params(&window());
        assert_eq!(params[0], ("formato", "json".to_string()));
        assert_eq!(params[1], ("dataInicial", "01/01/2024".to_string()));
        assert_eq!(params[2], ("dataFinal", "31/03/2024".to_string()));
    }

    /// Answers `connections` requests with a fixed 503 and returns its base URL.
    fn unavailable_server(connections: usize) -> String {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let mut stream = stream.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                let body = "servico indisponivel";
                let response = format!(
                    "HTTP/1.1 503 Service Unavailable\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_error_status_yields_empty_collection() {
        let base_url = unavailable_server(2);
        let http = crate::build_http_client(std::time::Duration::from_secs(5)).unwrap();
        let client = BcbClient::with_base_url(http, &base_url);
        let request = BcbRequest { series_code: 11 };

        let err = client.try_fetch(&request, &window()).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Status { status, .. } if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(err.body_preview(), Some("servico indisponivel"));

        assert!(client.fetch(&request, &window()).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_yields_empty_collection() {
        let http = crate::build_http_client(std::time::Duration::from_millis(200)).unwrap();
        let client = BcbClient::with_base_url(http, "http://127.0.0.1:9");
        let records = client.fetch(&BcbRequest { series_code: 11 }, &window()).await;
        assert!(records.is_empty());
    }
}
