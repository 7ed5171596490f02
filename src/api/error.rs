//! API error taxonomy
//!
//! Errors are classified by kind rather than carried as opaque strings so
//! that the rate-limit tracker and the retry logic can branch on them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Network failure, timeout or connection reset after all retries.
    #[error("Request error fetching {endpoint} for {ticker} after {attempts} attempts: {source}")]
    Transport {
        endpoint: String,
        ticker: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },

    /// 401/403: the API key lacks access to this endpoint. Not retried.
    #[error("{message}")]
    Subscription { endpoint: String, message: String },

    /// 429: the server asked us to back off.
    #[error("Rate limit exceeded for {endpoint} on {ticker}")]
    RateLimited {
        endpoint: String,
        ticker: String,
        /// Parsed Retry-After header, seconds.
        retry_after: Option<f64>,
    },

    /// Any other non-2xx status, or an unparseable body.
    #[error("{message}")]
    Request {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
}

impl ApiError {
    /// The endpoint the failed request was for.
    pub fn endpoint(&self) -> &str {
        match self {
            ApiError::Transport { endpoint, .. }
            | ApiError::Subscription { endpoint, .. }
            | ApiError::RateLimited { endpoint, .. }
            | ApiError::Request { endpoint, .. } => endpoint,
        }
    }
}
