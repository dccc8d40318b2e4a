use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use url::Url;

use super::gate::ConcurrencyGate;
use super::retry::RetryPolicy;
use super::{parse_page, validate_page_request, CompanySource, FetchError, PageResult};
use crate::config::EngineConfig;
use crate::date_util::format_timestamp;

/// Fetch client for the company list endpoint.
///
/// Every request holds a slot in the shared [`ConcurrencyGate`] for its
/// duration; backoff sleeps do not.
pub struct HttpSource {
    client: reqwest::Client,
    list_url: Url,
    gate: ConcurrencyGate,
    retry: RetryPolicy,
    since_param: Option<String>,
}

impl HttpSource {
    /// Build a source with its own gate sized from `config`.
    pub fn new(config: &EngineConfig) -> Result<Self, FetchError> {
        Self::with_gate(config, ConcurrencyGate::new(config.max_concurrent_requests))
    }

    /// Build a source that shares an existing gate.
    pub fn with_gate(config: &EngineConfig, gate: ConcurrencyGate) -> Result<Self, FetchError> {
        let list_url = config
            .list_url()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_concurrent_requests / 2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            list_url,
            gate,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
            since_param: config.since_param.clone(),
        })
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    async fn fetch_once(
        &self,
        page_num: u32,
        page_size: u32,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<PageResult, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("pageNum", page_num.to_string()),
            ("pageSize", page_size.to_string()),
        ];
        if let (Some(param), Some(since)) = (self.since_param.as_deref(), updated_since) {
            query.push((param, format_timestamp(&since)));
        }

        let _permit = self.gate.acquire().await;
        log::debug!("GET {} page={page_num} size={page_size}", self.list_url);

        let response = self
            .client
            .get(self.list_url.clone())
            .header(ACCEPT, "application/json")
            .query(&query)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(classify_reqwest)?;

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(FetchError::from_status(status.as_u16(), snippet, retry_after));
        }

        parse_page(&body, page_num, page_size)
    }
}

#[async_trait]
impl CompanySource for HttpSource {
    async fn fetch_page(
        &self,
        page_num: u32,
        page_size: u32,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<PageResult, FetchError> {
        validate_page_request(page_num, page_size)?;
        self.retry
            .run(page_num, || self.fetch_once(page_num, page_size, updated_since))
            .await
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else if e.is_builder() {
        FetchError::InvalidRequest(e.to_string())
    } else if e.is_decode() {
        FetchError::Malformed(e.to_string())
    } else {
        // connect errors, resets and truncated bodies
        FetchError::Connection(e.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
