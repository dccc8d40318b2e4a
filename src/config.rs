use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://kaifazhe.fun/prod-api";
pub const DEFAULT_LIST_PATH: &str = "/system/softwareCompany/list";
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_MAX_CONCURRENT: usize = 200;

/// What to do when the source reports a record as removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
    /// Removal reports are treated as no-ops.
    Ignore,
    /// Known records are kept but marked `deleted`.
    #[default]
    SoftDelete,
}

impl DeletionPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "soft" | "soft_delete" | "soft-delete" => Ok(Self::SoftDelete),
            other => Err(Error::FatalConfig(format!("unknown deletion policy: {other}"))),
        }
    }
}

/// Engine settings. Defaults match the upstream company list API.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub list_path: String,
    pub page_size: u32,
    /// Global ceiling on in-flight HTTP requests, shared by every run.
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Attempts per page commit before the page is marked failed.
    pub commit_attempts: u32,
    /// Pages fetched ahead of the page currently being committed.
    pub page_window: usize,
    /// Only consulted when the source does not report a total.
    pub max_consecutive_page_failures: u32,
    /// A `running` row whose heartbeat is older than this is treated as
    /// abandoned by a dead process.
    pub run_stale_after: Duration,
    pub user_agent: String,
    pub deletion_policy: DeletionPolicy,
    /// Query parameter used to ask the source for records updated since
    /// the watermark. `None` means the source is not asked and incremental
    /// runs filter client side.
    pub since_param: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            list_path: DEFAULT_LIST_PATH.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            commit_attempts: 3,
            page_window: 8,
            max_consecutive_page_failures: 20,
            run_stale_after: Duration::from_secs(120),
            user_agent: "CC-Company-Sync/1.0".to_string(),
            deletion_policy: DeletionPolicy::default(),
            since_param: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `COMPANYSYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_var("COMPANYSYNC_BASE_URL") {
            config.base_url = v;
        }
        if let Some(v) = env_var("COMPANYSYNC_LIST_PATH") {
            config.list_path = v;
        }
        if let Some(v) = env_var("COMPANYSYNC_PAGE_SIZE") {
            config.page_size = parse_num("COMPANYSYNC_PAGE_SIZE", &v)?;
        }
        if let Some(v) = env_var("COMPANYSYNC_MAX_CONCURRENT") {
            config.max_concurrent_requests = parse_num("COMPANYSYNC_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = env_var("COMPANYSYNC_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_num("COMPANYSYNC_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = env_var("COMPANYSYNC_MAX_RETRIES") {
            config.max_retries = parse_num("COMPANYSYNC_MAX_RETRIES", &v)?;
        }
        if let Some(v) = env_var("COMPANYSYNC_DELETION_POLICY") {
            config.deletion_policy = DeletionPolicy::parse(&v)?;
        }
        if let Some(v) = env_var("COMPANYSYNC_STALE_RUN_SECS") {
            config.run_stale_after = Duration::from_secs(parse_num("COMPANYSYNC_STALE_RUN_SECS", &v)?);
        }
        if let Some(v) = env_var("COMPANYSYNC_SINCE_PARAM") {
            config.since_param = Some(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::FatalConfig("page size must be positive".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(Error::FatalConfig("max concurrent requests must be positive".into()));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(Error::FatalConfig("timeouts must be positive".into()));
        }
        if self.run_stale_after < Duration::from_secs(1) {
            return Err(Error::FatalConfig("stale run timeout must be at least one second".into()));
        }
        if self.commit_attempts == 0 || self.page_window == 0 {
            return Err(Error::FatalConfig(
                "commit attempts and page window must be positive".into(),
            ));
        }
        self.list_url()?;
        Ok(())
    }

    /// How often a live run refreshes its heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.run_stale_after / 4
    }

    /// Full URL of the paginated list endpoint.
    pub fn list_url(&self) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.list_path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| Error::FatalConfig(format!("invalid base URL {joined}: {e}")))
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::FatalConfig(format!("{key} is not a valid number: {value}")))
}
