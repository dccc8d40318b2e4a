//! The run loop.
//!
//! Pages are fetched ahead of the commit cursor through a bounded window of
//! spawned fetch tasks, then reconciled and committed one at a time in
//! ascending page order. Fetch concurrency is additionally capped by the
//! source's own gate.
//!
//! Cancellation is observed between pages: the page at the head of the
//! window is fetched and committed, fetches queued behind it are dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesOrdered, StreamExt};
use tokio_util::sync::CancellationToken;

use super::{SyncMode, SyncProgress, SyncRun, CANCELLED_MARKER};
use crate::company::natural_id_of;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::reconcile::{apply_to_snapshot, reconcile, ReconcileOptions, Snapshot, WriteBatch};
use crate::source::{CompanySource, PageResult, RetryPolicy};
use crate::storage::PersistenceGateway;

/// Why the page loop stopped early.
enum Abort {
    Cancelled,
    Fatal { page: Option<u32>, error: Error },
}

impl Abort {
    fn fatal(error: Error) -> Self {
        Abort::Fatal { page: None, error }
    }

    fn message(&self) -> String {
        match self {
            Abort::Cancelled => CANCELLED_MARKER.to_string(),
            Abort::Fatal { page: Some(page), error } => format!("page {page}: {error}"),
            Abort::Fatal { page: None, error } => error.to_string(),
        }
    }
}

/// `None` when the fetch was abandoned because the page loop had already stopped.
type FetchOutcome = (u32, Option<Result<PageResult>>);

pub struct Orchestrator<S: ?Sized> {
    source: Arc<S>,
    gateway: PersistenceGateway,
    config: EngineConfig,
}

impl<S> Orchestrator<S>
where
    S: CompanySource + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, gateway: PersistenceGateway, config: EngineConfig) -> Self {
        Self {
            source,
            gateway,
            config,
        }
    }

    /// Insert the `running` row for a new run.
    ///
    /// Incremental runs without a previous successful watermark are
    /// recorded as full runs. The returned run carries the previous
    /// watermark forward.
    pub async fn begin(&self, requested: SyncMode) -> Result<SyncRun> {
        let previous = self.gateway.latest_watermark().await?;
        let mode = match (requested, previous) {
            (SyncMode::Incremental, None) => {
                log::info!("No previous successful run; falling back to a full sync");
                SyncMode::Full
            }
            (mode, _) => mode,
        };
        let mut run = self.gateway.begin_run(mode, Utc::now(), self.config.run_stale_after).await?;
        run.watermark = previous;
        Ok(run)
    }

    /// Drive `run` to a terminal status and persist it.
    ///
    /// Page and record failures end up in the run's counters. The only
    /// error returned is a failure to persist the final run row.
    pub async fn execute(
        &self,
        mut run: SyncRun,
        page_size: u32,
        cancel: CancellationToken,
        progress: &dyn SyncProgress,
    ) -> Result<SyncRun> {
        log::info!(
            "Sync run {} started (mode={}, page_size={page_size})",
            run.run_id,
            run.mode.as_str()
        );
        progress.on_run_start(&run);

        let heartbeat = self.spawn_heartbeat(run.run_id).drop_guard();
        let fetch_cancel = CancellationToken::new();
        let outcome = self
            .drive(&mut run, page_size, &cancel, &fetch_cancel, progress)
            .await;
        fetch_cancel.cancel();
        drop(heartbeat);

        let abort_message = match outcome {
            Ok(()) => None,
            Err(abort) => {
                let message = abort.message();
                match abort {
                    Abort::Cancelled => log::warn!("Sync run {} cancelled", run.run_id),
                    Abort::Fatal { .. } => {
                        log::error!("Sync run {} aborted: {message}", run.run_id)
                    }
                }
                Some(message)
            }
        };

        run.finish(abort_message, Utc::now());
        let finalized = self
            .with_store_retry(&format!("Sync run {}: finalize", run.run_id), || {
                self.gateway.finalize_run(&run)
            })
            .await;

        log::info!(
            "Sync run {} {}: {} pages ({} failed), {} added, {} updated, {} unchanged, {} failed in {}ms",
            run.run_id,
            run.status.as_str(),
            run.pages_processed,
            run.pages_failed,
            run.records_added,
            run.records_updated,
            run.records_unchanged,
            run.records_failed,
            run.duration_ms.unwrap_or(0),
        );
        progress.on_run_complete(&run);

        finalized?;
        Ok(run)
    }

    async fn drive(
        &self,
        run: &mut SyncRun,
        page_size: u32,
        cancel: &CancellationToken,
        fetch_cancel: &CancellationToken,
        progress: &dyn SyncProgress,
    ) -> std::result::Result<(), Abort> {
        let since = match run.mode {
            SyncMode::Incremental => run.watermark,
            SyncMode::Full => None,
        };
        let mut full_snapshot = match run.mode {
            SyncMode::Full => Some(self.gateway.load_snapshot().await.map_err(Abort::fatal)?),
            SyncMode::Incremental => None,
        };

        let window_size = self.config.page_window.max(1);
        let mut window = FuturesOrdered::new();
        let mut next_page: u32 = 1;
        // Last page known to exist, once the source has told us.
        let mut last_page: Option<u32> = None;
        let mut first_page_seen = false;
        let mut consecutive_failures: u32 = 0;
        let mut stop_issuing = false;

        loop {
            if cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            // Until page 1 reports the page count, fetch one page at a time.
            let limit = if first_page_seen { window_size } else { 1 };
            while !stop_issuing
                && window.len() < limit
                && last_page.map_or(true, |last| next_page <= last)
            {
                window.push_back(self.spawn_fetch(next_page, page_size, since, fetch_cancel.clone()));
                next_page += 1;
            }

            let Some((page_num, outcome)) = window.next().await else {
                break;
            };
            first_page_seen = true;

            let Some(outcome) = outcome else {
                return Err(Abort::Cancelled);
            };
            if last_page.is_some_and(|last| page_num > last) {
                // speculative fetch past the end
                continue;
            }

            let page = match outcome {
                Ok(page) => page,
                Err(error) if error.is_fatal() => {
                    return Err(Abort::Fatal { page: Some(page_num), error });
                }
                Err(error) => {
                    Self::page_failed(run, page_num, u64::from(page_size), &error, progress);
                    consecutive_failures += 1;
                    if last_page.is_none()
                        && consecutive_failures >= self.config.max_consecutive_page_failures
                    {
                        log::warn!(
                            "Sync run {}: {consecutive_failures} consecutive page failures without a known page count; stopping",
                            run.run_id
                        );
                        stop_issuing = true;
                    }
                    self.record_progress(run).await?;
                    continue;
                }
            };
            consecutive_failures = 0;

            if let Some(total) = page.total {
                run.total_records = Some(total);
            }
            if let Some(total_pages) = page.total_pages {
                run.total_pages = Some(total_pages);
                last_page = Some(total_pages);
            }
            if !page.has_more {
                last_page = Some(last_page.map_or(page_num, |last| last.min(page_num)));
            }

            let batch = self
                .reconcile_page(&page, full_snapshot.as_ref())
                .await
                .map_err(|error| Abort::Fatal { page: Some(page_num), error })?;
            run.records_failed += batch.rejected.len() as u64;

            let commit = self
                .with_store_retry(&format!("Page {page_num}: commit"), || self.gateway.commit(&batch))
                .await;
            match commit {
                Ok(result) => {
                    run.pages_processed += 1;
                    run.records_added += result.inserted;
                    run.records_updated += result.updated;
                    run.records_unchanged += batch.noops() as u64 + result.unchanged;
                    if let Some(max) = batch.max_source_updated_at() {
                        run.watermark = Some(run.watermark.map_or(max, |w| w.max(max)));
                    }
                    if let Some(snapshot) = full_snapshot.as_mut() {
                        apply_to_snapshot(snapshot, &batch);
                    }
                    log::debug!(
                        "Page {page_num}: {} inserted, {} updated, {} unchanged, {} rejected",
                        result.inserted,
                        result.updated,
                        batch.noops() as u64 + result.unchanged,
                        batch.rejected.len()
                    );
                    progress.on_page_committed(run, page_num);
                }
                Err(error) if error.is_fatal() => {
                    return Err(Abort::Fatal { page: Some(page_num), error });
                }
                Err(error) => {
                    let unwritten = batch.writes().count() as u64;
                    Self::page_failed(run, page_num, unwritten, &error, progress);
                }
            }

            self.record_progress(run).await?;
        }

        Ok(())
    }

    fn spawn_fetch(
        &self,
        page_num: u32,
        page_size: u32,
        since: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> impl Future<Output = FetchOutcome> {
        let source = Arc::clone(&self.source);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = source.fetch_page(page_num, page_size, since) => Some(result),
            }
        });
        async move {
            let outcome = match handle.await {
                Ok(Some(result)) => Some(result.map_err(Error::from)),
                Ok(None) => None,
                Err(e) => Some(Err(Error::Other(format!("fetch task failed: {e}")))),
            };
            (page_num, outcome)
        }
    }

    async fn reconcile_page(&self, page: &PageResult, full_snapshot: Option<&Snapshot>) -> Result<WriteBatch> {
        let options = ReconcileOptions {
            deletion_policy: self.config.deletion_policy,
            fetched_at: Utc::now(),
        };
        match full_snapshot {
            Some(snapshot) => Ok(reconcile(page.page_num, snapshot, &page.records, &options)),
            None => {
                let ids: Vec<String> = page.records.iter().filter_map(natural_id_of).collect();
                let snapshot = self.gateway.load_snapshot_for(ids).await?;
                Ok(reconcile(page.page_num, &snapshot, &page.records, &options))
            }
        }
    }

    /// Run a store operation, retrying transient failures up to
    /// `commit_attempts` times with backoff.
    async fn with_store_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.commit_attempts.max(1);
        let policy = RetryPolicy {
            max_retries: attempts - 1,
            base_delay: self.config.retry_base_delay,
            max_delay: self.config.retry_max_delay,
        };
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let wait = policy.backoff(attempt - 1, None);
                    log::warn!(
                        "{what} failed ({e}); retrying in {}ms ({attempt}/{attempts})",
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keep the run row's heartbeat fresh until the returned token is
    /// cancelled, so other processes do not treat the run as abandoned.
    fn spawn_heartbeat(&self, run_id: i64) -> CancellationToken {
        let stop = CancellationToken::new();
        let gateway = self.gateway.clone();
        let every = self.config.heartbeat_interval().max(Duration::from_millis(250));
        let token = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match gateway.heartbeat(run_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            log::warn!("Sync run {run_id} was finalized elsewhere; stopping heartbeat");
                            break;
                        }
                        Err(e) => log::warn!("Sync run {run_id}: heartbeat failed: {e}"),
                    },
                }
            }
        });
        stop
    }

    async fn record_progress(&self, run: &SyncRun) -> std::result::Result<(), Abort> {
        match self.gateway.record_progress(run).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(Abort::fatal(error)),
            Err(error) => {
                log::warn!("Sync run {}: could not record progress: {error}", run.run_id);
                Ok(())
            }
        }
    }

    fn page_failed(run: &mut SyncRun, page_num: u32, records: u64, error: &Error, progress: &dyn SyncProgress) {
        log::warn!("Page {page_num} failed: {error}");
        run.pages_failed += 1;
        run.records_failed += records;
        run.last_error = Some(format!("page {page_num}: {error}"));
        progress.on_page_failed(run, page_num, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FetchError;
    use crate::storage::Database;
    use crate::sync::RunStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Serves `pages` full pages of synthetic rows.
    struct FakeSource {
        pages: u32,
        page_size: u32,
        updated: &'static str,
        failing: HashSet<u32>,
        fatal_on: Option<u32>,
        report_totals: bool,
        delay: Duration,
        requested: Mutex<Vec<u32>>,
    }

    impl FakeSource {
        fn new(pages: u32, page_size: u32) -> Self {
            Self {
                pages,
                page_size,
                updated: "2024-01-01 00:00:00",
                failing: HashSet::new(),
                fatal_on: None,
                report_totals: true,
                delay: Duration::ZERO,
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompanySource for FakeSource {
        async fn fetch_page(
            &self,
            page_num: u32,
            page_size: u32,
            _updated_since: Option<DateTime<Utc>>,
        ) -> std::result::Result<PageResult, FetchError> {
            self.requested.lock().unwrap().push(page_num);
            tokio::time::sleep(self.delay).await;
            if self.fatal_on == Some(page_num) {
                return Err(FetchError::Auth("HTTP 401".into()));
            }
            if self.failing.contains(&page_num) {
                return Err(FetchError::Status { status: 404, message: "not found".into() });
            }
            let records = if page_num <= self.pages {
                let first = u64::from(page_num - 1) * u64::from(page_size) + 1;
                (first..first + u64::from(page_size))
                    .map(|id| json!({"id": id, "companyName": format!("Company {id}"), "updateTime": self.updated}))
                    .collect()
            } else {
                Vec::new()
            };
            Ok(PageResult {
                page_num,
                has_more: page_num < self.pages,
                total: self.report_totals.then(|| u64::from(self.pages * self.page_size)),
                total_pages: self.report_totals.then_some(self.pages),
                records,
            })
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            page_size: 10,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            ..EngineConfig::default()
        }
    }

    async fn orchestrator(source: FakeSource) -> (Orchestrator<FakeSource>, Database) {
        let db = Database::open_memory().await.unwrap();
        let gateway = PersistenceGateway::new(db.clone());
        (Orchestrator::new(Arc::new(source), gateway, config()), db)
    }

    async fn run(orch: &Orchestrator<FakeSource>, mode: SyncMode) -> SyncRun {
        let run = orch.begin(mode).await.unwrap();
        orch.execute(run, 10, CancellationToken::new(), &crate::sync::NoopProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_run_succeeds() {
        let (orch, _db) = orchestrator(FakeSource::new(5, 10)).await;
        let done = run(&orch, SyncMode::Full).await;

        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.pages_processed, 5);
        assert_eq!(done.records_added, 50);
        assert_eq!(done.total_records, Some(50));
        assert_eq!(done.total_pages, Some(5));
        assert!(done.watermark.is_some());
        assert!(done.last_error.is_none());
        // no fetches past the reported page count
        assert!(orch.source.requested.lock().unwrap().iter().all(|p| *p <= 5));
    }

    #[tokio::test]
    async fn test_incremental_without_watermark_falls_back_to_full() {
        let (orch, _db) = orchestrator(FakeSource::new(2, 10)).await;
        let first = run(&orch, SyncMode::Incremental).await;
        assert_eq!(first.mode, SyncMode::Full);

        let second = run(&orch, SyncMode::Incremental).await;
        assert_eq!(second.mode, SyncMode::Incremental);
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_eq!(second.records_added, 0);
        assert_eq!(second.records_unchanged, 20);
        assert_eq!(second.watermark, first.watermark);
    }

    #[tokio::test]
    async fn test_permanent_page_failure_is_isolated() {
        let mut source = FakeSource::new(4, 10);
        source.failing.insert(2);
        let (orch, _db) = orchestrator(source).await;
        let done = run(&orch, SyncMode::Full).await;

        assert_eq!(done.status, RunStatus::PartialFailure);
        assert_eq!(done.pages_processed, 3);
        assert_eq!(done.pages_failed, 1);
        assert_eq!(done.records_added, 30);
        assert_eq!(done.records_failed, 10);
        assert!(done.last_error.as_deref().unwrap().starts_with("page 2:"));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_run() {
        let mut source = FakeSource::new(4, 10);
        source.fatal_on = Some(3);
        let (orch, db) = orchestrator(source).await;
        let done = run(&orch, SyncMode::Full).await;

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.pages_processed, 2);
        assert!(done.last_error.as_deref().unwrap().contains("page 3"));

        let stored = PersistenceGateway::new(db).get_run(done.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_without_totals_stops_at_short_page() {
        let mut source = FakeSource::new(3, 10);
        source.report_totals = false;
        let (orch, _db) = orchestrator(source).await;
        let done = run(&orch, SyncMode::Full).await;

        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.records_added, 30);
        assert_eq!(done.pages_failed, 0);
        assert_eq!(done.total_records, None);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let (orch, _db) = orchestrator(FakeSource::new(3, 10)).await;
        let begun = orch.begin(SyncMode::Full).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = orch
            .execute(begun, 10, cancel, &crate::sync::NoopProgress)
            .await
            .unwrap();

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.last_error.as_deref(), Some(CANCELLED_MARKER));
        assert_eq!(done.pages_processed, 0);
    }

    #[tokio::test]
    async fn test_cancel_lets_head_page_commit() {
        let mut source = FakeSource::new(3, 10);
        source.delay = Duration::from_millis(300);
        let (orch, db) = orchestrator(source).await;
        let begun = orch.begin(SyncMode::Full).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let done = orch
            .execute(begun, 10, cancel, &crate::sync::NoopProgress)
            .await
            .unwrap();

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.last_error.as_deref(), Some(CANCELLED_MARKER));
        assert_eq!(done.pages_processed, 1);
        assert_eq!(done.records_added, 10);
        let rows: i64 = db
            .reader()
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM companies", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(rows, 10);
    }

    #[tokio::test]
    async fn test_finalize_retried_on_transient_store_error() {
        let db = Database::open_memory().await.unwrap();
        let config = EngineConfig {
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(400),
            ..config()
        };
        let orch = Orchestrator::new(
            Arc::new(FakeSource::new(1, 10)),
            PersistenceGateway::new(db.clone()),
            config,
        );
        let begun = orch.begin(SyncMode::Full).await.unwrap();

        // terminal updates are refused until the trigger goes away
        db.writer()
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER flaky_finalize BEFORE UPDATE OF finished_at ON sync_runs
                     WHEN NEW.finished_at IS NOT NULL
                     BEGIN SELECT RAISE(ABORT, 'database is busy'); END;",
                )
            })
            .await
            .unwrap();
        let writer = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer
                .writer()
                .call(|conn| conn.execute_batch("DROP TRIGGER flaky_finalize;"))
                .await
                .unwrap();
        });

        let done = orch
            .execute(begun, 10, CancellationToken::new(), &crate::sync::NoopProgress)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);

        let stored = PersistenceGateway::new(db).get_run(done.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.finished_at.is_some());
        // the guard is released for the next run
        assert!(orch.begin(SyncMode::Full).await.is_ok());
    }
}
