pub mod gate;
pub mod http;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

pub use gate::{ConcurrencyGate, GatePermit};
pub use http::HttpSource;
pub use retry::{Attempt, RetryPolicy};

/// A raw, not yet validated company object as returned by the source.
pub type RawRecord = serde_json::Value;

/// One page of the source's company list.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_num: u32,
    pub records: Vec<RawRecord>,
    pub has_more: bool,
    /// Total record count, when the source reports it.
    pub total: Option<u64>,
    /// Total page count, when the source reports it or it can be derived.
    pub total_pages: Option<u32>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("page {page} failed after retries: {cause}")]
    Exhausted { page: u32, cause: Box<FetchError> },
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) | FetchError::RateLimited { .. } => {
                true
            }
            FetchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map a non-success status code to the matching error.
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => FetchError::Auth(format!("HTTP {status}: {message}")),
            429 => FetchError::RateLimited { retry_after },
            _ => FetchError::Status { status, message },
        }
    }
}

/// The paginated external source of company records.
#[async_trait]
pub trait CompanySource: Send + Sync {
    /// Fetch one page. `page_num` is 1-based and `page_size` positive.
    ///
    /// `updated_since` is a hint; sources that cannot filter may ignore it.
    async fn fetch_page(
        &self,
        page_num: u32,
        page_size: u32,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<PageResult, FetchError>;
}

pub(crate) fn validate_page_request(page_num: u32, page_size: u32) -> Result<(), FetchError> {
    if page_num == 0 {
        return Err(FetchError::InvalidRequest("page number must be >= 1".into()));
    }
    if page_size == 0 {
        return Err(FetchError::InvalidRequest("page size must be > 0".into()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListData {
    #[serde(default)]
    total_page: Option<u32>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    rows: Vec<RawRecord>,
}

/// Decode a list response body into a [`PageResult`].
pub fn parse_page(body: &str, page_num: u32, page_size: u32) -> Result<PageResult, FetchError> {
    let envelope: ListEnvelope =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if envelope.code != 200 && envelope.code != 0 {
        let msg = envelope.msg.unwrap_or_default();
        let status = u16::try_from(envelope.code).unwrap_or(500);
        return Err(match status {
            401 | 403 | 429 => FetchError::from_status(status, msg, None),
            s if s >= 500 => FetchError::Status { status: s, message: msg },
            s => FetchError::Status {
                status: s.max(400),
                message: format!("source code {}: {msg}", envelope.code),
            },
        });
    }

    let data = envelope
        .data
        .ok_or_else(|| FetchError::Malformed("response has no data field".into()))?;

    let total_pages = data.total_page.or_else(|| {
        data.total
            .map(|t| t.div_ceil(u64::from(page_size)) as u32)
    });
    let has_more = match total_pages {
        Some(pages) => page_num < pages,
        None => data.rows.len() as u64 == u64::from(page_size),
    };

    Ok(PageResult {
        page_num,
        records: data.rows,
        has_more,
        total: data.total,
        total_pages,
    })
}
