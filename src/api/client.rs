//! HTTP client for the upstream market-data API
//!
//! One GET per (endpoint, ticker). Transport errors are retried with short
//! backoffs; HTTP status errors are classified deterministically and never
//! retried here.

use crate::api::endpoints;
use crate::api::ApiError;
use crate::config::constants::{
    API_BASE_URL, HTTP_POOL_IDLE_TIMEOUT, HTTP_POOL_MAX_IDLE_PER_HOST, HTTP_REQUEST_TIMEOUT,
    RETRY_BACKOFFS,
};
use crate::error::Result;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{debug, warn};

/// Rate-limit headers echoed back to the caller under this key.
pub const RESPONSE_HEADERS_KEY: &str = "_response_headers";
/// Measured request latency (seconds) echoed back under this key.
pub const RESPONSE_TIME_KEY: &str = "_response_time";

const RATE_LIMIT_HEADERS: [&str; 4] = [
    "X-RateLimit-Limit",
    "X-RateLimit-Remaining",
    "X-RateLimit-Reset",
    "Retry-After",
];

const MAX_ATTEMPTS: usize = 3;

/// Shared HTTP client with a pooled connection transport
pub struct Client {
    api_key: RwLock<String>,
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            api_key: RwLock::new(api_key.into()),
            base_url: API_BASE_URL.to_string(),
            http,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: RwLock::new(api_key.into()),
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) {
        *self.api_key.write() = api_key.into();
    }

    fn url_for(&self, endpoint: &str, ticker: &str) -> Option<String> {
        let key = self.api_key.read().clone();
        endpoints::endpoint_url(&self.base_url, ticker, endpoint, &key)
    }

    /// Fetch a single endpoint for a ticker.
    ///
    /// On success the parsed object carries two extra keys:
    /// [`RESPONSE_HEADERS_KEY`] with the observed rate-limit headers and
    /// [`RESPONSE_TIME_KEY`] with the measured latency in seconds. Callers
    /// strip both before merging.
    pub async fn fetch_endpoint(
        &self,
        endpoint: &str,
        ticker: &str,
    ) -> std::result::Result<Map<String, Value>, ApiError> {
        let url = self.url_for(endpoint, ticker).ok_or_else(|| ApiError::Request {
            endpoint: endpoint.to_string(),
            status: None,
            message: format!("Unknown endpoint: {endpoint}"),
        })?;

        let mut last_transport: Option<reqwest::Error> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let started = Instant::now();

            let response = match self.http.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        let delay = RETRY_BACKOFFS[attempt];
                        warn!(
                            endpoint,
                            ticker,
                            attempt = attempt + 1,
                            "Transport error, retrying in {:?}: {e}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        last_transport = Some(e);
                        continue;
                    }
                    return Err(ApiError::Transport {
                        endpoint: endpoint.to_string(),
                        ticker: ticker.to_string(),
                        attempts: MAX_ATTEMPTS,
                        source: e,
                    });
                }
            };

            let status = response.status();
            let rate_limit_headers = extract_rate_limit_headers(&response);

            match status.as_u16() {
                200 => {}
                401 => {
                    return Err(ApiError::Subscription {
                        endpoint: endpoint.to_string(),
                        message: format!(
                            "Unauthorized access to {endpoint} for {ticker}. Check API key and subscription tier."
                        ),
                    });
                }
                403 => {
                    return Err(ApiError::Subscription {
                        endpoint: endpoint.to_string(),
                        message: format!(
                            "Access forbidden to {endpoint} for {ticker}. This endpoint requires a subscription tier you don't have."
                        ),
                    });
                }
                429 => {
                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<f64>().ok());
                    return Err(ApiError::RateLimited {
                        endpoint: endpoint.to_string(),
                        ticker: ticker.to_string(),
                        retry_after,
                    });
                }
                code => {
                    let body = response.text().await.unwrap_or_default();
                    let truncated: String = body.chars().take(200).collect();
                    return Err(ApiError::Request {
                        endpoint: endpoint.to_string(),
                        status: Some(code),
                        message: format!(
                            "HTTP {code} error fetching {endpoint} for {ticker}: {truncated}"
                        ),
                    });
                }
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFFS[attempt]).await;
                        last_transport = Some(e);
                        continue;
                    }
                    return Err(ApiError::Transport {
                        endpoint: endpoint.to_string(),
                        ticker: ticker.to_string(),
                        attempts: MAX_ATTEMPTS,
                        source: e,
                    });
                }
            };

            let response_time = started.elapsed().as_secs_f64();

            let mut data: Map<String, Value> = match serde_json::from_slice(&body) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ApiError::Request {
                        endpoint: endpoint.to_string(),
                        status: None,
                        message: format!(
                            "Unexpected JSON shape from {endpoint} for {ticker}: expected object, got {other}"
                        ),
                    });
                }
                Err(e) => {
                    return Err(ApiError::Request {
                        endpoint: endpoint.to_string(),
                        status: None,
                        message: format!("Invalid JSON response from {endpoint} for {ticker}: {e}"),
                    });
                }
            };

            if !rate_limit_headers.is_empty() {
                data.insert(
                    RESPONSE_HEADERS_KEY.to_string(),
                    Value::Object(
                        rate_limit_headers
                            .into_iter()
                            .map(|(k, v)| (k, Value::String(v)))
                            .collect(),
                    ),
                );
            }
            data.insert(RESPONSE_TIME_KEY.to_string(), response_time.into());

            debug!(
                endpoint,
                ticker,
                response_time,
                fields = data.len(),
                "Fetched endpoint"
            );
            return Ok(data);
        }

        // Loop always returns; reaching here means every attempt hit the
        // retry path, which consumes the final attempt above.
        Err(ApiError::Request {
            endpoint: endpoint.to_string(),
            status: None,
            message: format!(
                "Failed after {MAX_ATTEMPTS} attempts: {}",
                last_transport.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }
}

fn extract_rate_limit_headers(response: &reqwest::Response) -> Vec<(String, String)> {
    RATE_LIMIT_HEADERS
        .iter()
        .filter_map(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| ((*name).to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_known_endpoint() {
        let client = Client::with_base_url("secret", "https://example.test");
        assert_eq!(
            client.url_for("classic_zero", "SPX").as_deref(),
            Some("https://example.test/SPX/classic/zero?key=secret")
        );
    }

    #[test]
    fn test_url_for_unknown_endpoint() {
        let client = Client::with_base_url("secret", "https://example.test");
        assert!(client.url_for("bogus", "SPX").is_none());
    }

    #[test]
    fn test_set_api_key_rebuilds_urls() {
        let client = Client::with_base_url("old", "https://example.test");
        client.set_api_key("new");
        assert_eq!(
            client.url_for("orderflow", "NDX").as_deref(),
            Some("https://example.test/NDX/orderflow/orderflow?key=new")
        );
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_request_error() {
        let client = Client::with_base_url("k", "https://example.test");
        let err = client.fetch_endpoint("bogus", "SPX").await.unwrap_err();
        match err {
            ApiError::Request { status, .. } => assert!(status.is_none()),
            other => panic!("expected Request error, got {other:?}"),
        }
    }
}
