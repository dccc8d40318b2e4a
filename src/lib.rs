pub mod company;
pub mod config;
pub mod date_util;
pub mod error;
pub mod reconcile;
pub mod search;
pub mod source;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use company::{CompanyRecord, SyncState};
pub use config::{DeletionPolicy, EngineConfig};
pub use error::{Error, Result};
pub use search::{SearchHit, SearchOptions, SearchResults};
pub use source::{CompanySource, ConcurrencyGate, FetchError, HttpSource, PageResult, RawRecord};
pub use storage::{CommitResult, Database, PersistenceGateway};
pub use sync::{NoopProgress, RunProgress, RunStatus, SyncMode, SyncOptions, SyncProgress, SyncRun};

use storage::repository;
use sync::orchestrator::Orchestrator;

/// The run this process is currently driving.
struct ActiveRun {
    run_id: i64,
    cancel: CancellationToken,
}

/// Main entry point for the company sync engine.
pub struct CompanySync<S: CompanySource + ?Sized + 'static> {
    db: Database,
    gateway: PersistenceGateway,
    source: Arc<S>,
    config: EngineConfig,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl CompanySync<HttpSource> {
    /// Engine backed by the configured HTTP endpoint.
    pub fn connect(db: Database, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let source = HttpSource::new(&config)?;
        Ok(Self::new(db, Arc::new(source), config))
    }
}

impl<S: CompanySource + ?Sized + 'static> CompanySync<S> {
    pub fn new(db: Database, source: Arc<S>, config: EngineConfig) -> Self {
        Self {
            gateway: PersistenceGateway::new(db.clone()),
            db,
            source,
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn orchestrator(&self) -> Orchestrator<S> {
        Orchestrator::new(Arc::clone(&self.source), self.gateway.clone(), self.config.clone())
    }

    // ── Sync runs ──────────────────────────────────────────────────

    /// Run a sync to completion on the current task.
    ///
    /// Always yields a finalized run unless the run could not be started
    /// (for example [`Error::SyncInProgress`]) or its final state could not
    /// be stored.
    pub async fn run_sync(&self, options: &SyncOptions, progress: &dyn SyncProgress) -> Result<SyncRun> {
        let orchestrator = self.orchestrator();
        let run = orchestrator.begin(options.mode).await?;
        let run_id = run.run_id;
        let cancel = self.register(run_id).await;

        let page_size = options.page_size.unwrap_or(self.config.page_size);
        let result = orchestrator.execute(run, page_size, cancel, progress).await;
        clear_active(&self.active, run_id).await;
        result
    }

    /// Start a sync in the background and return its run id immediately.
    pub async fn start_sync(&self, mode: SyncMode) -> Result<i64> {
        let orchestrator = self.orchestrator();
        let run = orchestrator.begin(mode).await?;
        let run_id = run.run_id;
        let cancel = self.register(run_id).await;

        let page_size = self.config.page_size;
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.execute(run, page_size, cancel, &NoopProgress).await {
                log::error!("Sync run {run_id} could not be finalized: {e}");
            }
            clear_active(&active, run_id).await;
        });
        Ok(run_id)
    }

    /// Current state of a run, running or finished.
    pub async fn get_run_status(&self, run_id: i64) -> Result<SyncRun> {
        self.gateway
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync run {run_id}")))
    }

    /// Run history, newest first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        self.gateway.list_runs(limit).await
    }

    /// Ask the active run to stop after its current page. Returns false
    /// if `run_id` is not running in this process.
    pub async fn cancel_sync(&self, run_id: i64) -> bool {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(run) if run.run_id == run_id => {
                log::info!("Cancelling sync run {run_id}");
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel whichever run this process is driving, if any.
    pub async fn cancel_active(&self) -> Option<i64> {
        let active = self.active.lock().await;
        active.as_ref().map(|run| {
            log::info!("Cancelling sync run {}", run.run_id);
            run.cancel.cancel();
            run.run_id
        })
    }

    async fn register(&self, run_id: i64) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.active.lock().await = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
        });
        cancel
    }

    // ── Company reads ──────────────────────────────────────────────

    pub async fn get_company(&self, natural_id: &str) -> Result<Option<CompanyRecord>> {
        let natural_id = natural_id.to_string();
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_company(conn, &natural_id))
            .await?)
    }

    pub async fn search_companies(&self, query: &str, options: &SearchOptions) -> Result<SearchResults> {
        search::search(&self.db, query, options).await
    }

    /// Companies whose source timestamp is newer than `since`, oldest first.
    pub async fn companies_updated_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CompanyRecord>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::companies_updated_since(conn, &since, limit))
            .await?)
    }

    /// Live and soft-deleted company counts.
    pub async fn company_counts(&self) -> Result<(u64, u64)> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::count_companies(conn))
            .await?)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        config_get(&self.db, key).await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        config_set(&self.db, key, value).await
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        config_list(&self.db).await
    }
}

// ── Stored settings ────────────────────────────────────────────────
//
// Usable without an engine: the CLI reads stored settings before it can
// build one, and must be able to repair them when they are invalid.

/// Read one `app_config` value.
pub async fn config_get(db: &Database, key: &str) -> Result<Option<String>> {
    db.reader()
        .call({
            let key = key.to_string();
            move |conn| repository::get_config(conn, &key)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

pub async fn config_set(db: &Database, key: &str, value: &str) -> Result<()> {
    db.writer()
        .call({
            let key = key.to_string();
            let value = value.to_string();
            move |conn| repository::set_config(conn, &key, &value)
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Every stored setting, ordered by key.
pub async fn config_list(db: &Database) -> Result<Vec<(String, String)>> {
    db.reader()
        .call(|conn| repository::list_config(conn))
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

async fn clear_active(active: &Mutex<Option<ActiveRun>>, run_id: i64) {
    let mut guard = active.lock().await;
    if guard.as_ref().is_some_and(|run| run.run_id == run_id) {
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Two pages of two companies; each fetch takes `delay`.
    struct SlowSource {
        delay: Duration,
    }

    #[async_trait]
    impl CompanySource for SlowSource {
        async fn fetch_page(
            &self,
            page_num: u32,
            _page_size: u32,
            _updated_since: Option<DateTime<Utc>>,
        ) -> std::result::Result<PageResult, FetchError> {
            tokio::time::sleep(self.delay).await;
            let first = u64::from(page_num) * 2 - 1;
            Ok(PageResult {
                page_num,
                records: (first..=first + 1)
                    .map(|id| json!({"id": id, "companyName": format!("Co {id}"), "updateTime": "2024-05-01"}))
                    .collect(),
                has_more: page_num < 2,
                total: Some(4),
                total_pages: Some(2),
            })
        }
    }

    async fn engine(delay: Duration) -> CompanySync<SlowSource> {
        let db = Database::open_memory().await.unwrap();
        CompanySync::new(db, Arc::new(SlowSource { delay }), EngineConfig::default())
    }

    async fn wait_finished(sync: &CompanySync<SlowSource>, run_id: i64) -> SyncRun {
        for _ in 0..500 {
            let run = sync.get_run_status(run_id).await.unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[tokio::test]
    async fn test_start_sync_runs_in_background() {
        let sync = engine(Duration::from_millis(5)).await;
        let run_id = sync.start_sync(SyncMode::Full).await.unwrap();

        let run = wait_finished(&sync, run_id).await;
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_added, 4);

        let company = sync.get_company("3").await.unwrap().unwrap();
        assert_eq!(company.name, "Co 3");
        assert_eq!(sync.company_counts().await.unwrap(), (4, 0));
        assert_eq!(sync.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_refused_while_running() {
        let sync = engine(Duration::from_millis(200)).await;
        let run_id = sync.start_sync(SyncMode::Full).await.unwrap();

        let err = sync.run_sync(&SyncOptions::full(), &NoopProgress).await.unwrap_err();
        assert!(matches!(err, Error::SyncInProgress(id) if id == run_id));

        wait_finished(&sync, run_id).await;
        let second = sync.run_sync(&SyncOptions::incremental(), &NoopProgress).await.unwrap();
        assert_eq!(second.mode, SyncMode::Incremental);
        assert_eq!(second.records_unchanged, 4);
    }

    #[tokio::test]
    async fn test_cancel_sync_finishes_page_in_flight() {
        let sync = engine(Duration::from_millis(300)).await;
        let run_id = sync.start_sync(SyncMode::Full).await.unwrap();
        assert!(!sync.cancel_sync(run_id + 1).await);

        // page 1 is being fetched when the cancel lands
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sync.cancel_sync(run_id).await);

        let run = wait_finished(&sync, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.last_error.as_deref(), Some(crate::sync::CANCELLED_MARKER));
        assert_eq!(run.pages_processed, 1);
        assert!(sync.get_company("1").await.unwrap().is_some());
        assert!(sync.get_company("3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_progress_while_running() {
        let sync = engine(Duration::from_millis(200)).await;
        let run_id = sync.start_sync(SyncMode::Full).await.unwrap();

        // page 1 lands at ~200ms, page 2 at ~400ms
        tokio::time::sleep(Duration::from_millis(300)).await;
        let running = sync.get_run_status(run_id).await.unwrap();
        assert_eq!(running.status, RunStatus::Running);
        let progress = running.progress(Utc::now());
        assert_eq!(progress.total_pages, Some(2));
        assert_eq!(progress.pages_done, 1);
        assert!((progress.percent - 50.0).abs() < f64::EPSILON);
        assert!(progress.eta_seconds.is_some());

        let done = wait_finished(&sync, run_id).await;
        assert!((done.progress(Utc::now()).percent - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_config_and_missing_run() {
        let sync = engine(Duration::ZERO).await;
        sync.config_set("page_size", "20").await.unwrap();
        assert_eq!(sync.config_get("page_size").await.unwrap().as_deref(), Some("20"));
        assert_eq!(sync.config_list().await.unwrap().len(), 1);
        assert!(matches!(sync.get_run_status(99).await, Err(Error::NotFound(_))));
    }
}
