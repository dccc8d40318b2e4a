use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;
use serde::Serialize;

use super::repository::{self, UpsertOutcome};
use super::Database;
use crate::company::CompanyRecord;
use crate::error::{Error, Result};
use crate::reconcile::{Snapshot, WriteBatch};
use crate::sync::{SyncMode, SyncRun, INTERRUPTED_MARKER};

/// Row counts from one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    pub inserted: u64,
    pub updated: u64,
    /// Writes skipped because the stored row was already as new.
    pub unchanged: u64,
}

/// The only writer of company rows and run rows.
///
/// Record batches and run bookkeeping use separate transactions, so a
/// failed run update never rolls back company data.
#[derive(Clone)]
pub struct PersistenceGateway {
    db: Database,
}

impl PersistenceGateway {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Apply every non-noop operation of `batch` in one transaction.
    ///
    /// All or nothing: on error the transaction is rolled back and no row
    /// from the batch is visible. Replaying an applied batch is a no-op.
    pub async fn commit(&self, batch: &WriteBatch) -> Result<CommitResult> {
        let records: Vec<CompanyRecord> = batch.writes().map(|w| w.record.clone()).collect();
        if records.is_empty() {
            return Ok(CommitResult::default());
        }

        let outcome = self
            .db
            .writer()
            .call(move |conn| Ok::<_, rusqlite::Error>(apply_records(conn, &records)))
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        outcome.map_err(Error::from_storage)
    }

    /// Insert a `running` row, refusing if another run is still active.
    ///
    /// A `running` row whose heartbeat is older than `stale_after` belongs
    /// to a process that died mid-run; it is finalized as interrupted first.
    pub async fn begin_run(
        &self,
        mode: SyncMode,
        started_at: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<SyncRun> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::FatalConfig(format!("stale run timeout: {e}")))?;
        let stale_before = started_at - stale_after;
        let (recovered, inserted) = self
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let recovered =
                    repository::fail_stale_runs(&tx, &stale_before, &started_at, INTERRUPTED_MARKER)?;
                let inserted = match repository::get_running_run(&tx)? {
                    Some(active) => Err(active),
                    None => Ok(repository::insert_sync_run(&tx, mode, &started_at)?),
                };
                tx.commit()?;
                Ok::<_, rusqlite::Error>((recovered, inserted))
            })
            .await?;

        if recovered > 0 {
            log::warn!("Marked {recovered} abandoned sync run(s) as {INTERRUPTED_MARKER}");
        }
        match inserted {
            Ok(run_id) => Ok(SyncRun::new(run_id, mode, started_at)),
            Err(active) => Err(Error::SyncInProgress(active)),
        }
    }

    /// Persist the counters of a running run and refresh its heartbeat.
    ///
    /// Fails with [`Error::RunLost`] if the row was finalized behind our back.
    pub async fn record_progress(&self, run: &SyncRun) -> Result<()> {
        let run_id = run.run_id;
        let run = run.clone();
        let now = Utc::now();
        let written = self
            .db
            .writer()
            .call(move |conn| repository::update_sync_run(conn, &run, &now))
            .await
            .map_err(Error::from_storage_call)?;
        if written {
            Ok(())
        } else {
            Err(Error::RunLost(run_id))
        }
    }

    /// Refresh the heartbeat of a live run. Returns false once the row is
    /// finalized.
    pub async fn heartbeat(&self, run_id: i64) -> Result<bool> {
        let now = Utc::now();
        self.db
            .writer()
            .call(move |conn| repository::touch_sync_run(conn, run_id, &now))
            .await
            .map_err(Error::from_storage_call)
    }

    /// Persist the terminal state of a run. Fails if the row was already
    /// finalized.
    pub async fn finalize_run(&self, run: &SyncRun) -> Result<()> {
        if !run.is_finished() {
            return Err(Error::Other(format!("run {} has not finished", run.run_id)));
        }
        let run_id = run.run_id;
        let run = run.clone();
        let now = Utc::now();
        let written = self
            .db
            .writer()
            .call(move |conn| repository::update_sync_run(conn, &run, &now))
            .await
            .map_err(Error::from_storage_call)?;
        if written {
            Ok(())
        } else {
            Err(Error::RunLost(run_id))
        }
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::get_sync_run(conn, run_id))
            .await?)
    }

    pub async fn list_runs(&self, limit: u32) -> Result<Vec<SyncRun>> {
        Ok(self
            .db
            .reader()
            .call(move |conn| repository::list_sync_runs(conn, limit))
            .await?)
    }

    pub async fn latest_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .db
            .reader()
            .call(|conn| repository::latest_watermark(conn))
            .await?)
    }

    /// Entire cache, for full runs.
    pub async fn load_snapshot(&self) -> Result<Snapshot> {
        self.db
            .reader()
            .call(|conn| repository::load_snapshot(conn))
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    /// Cache entries for one page's ids, for incremental runs.
    pub async fn load_snapshot_for(&self, natural_ids: Vec<String>) -> Result<Snapshot> {
        self.db
            .reader()
            .call(move |conn| repository::load_snapshot_for(conn, &natural_ids))
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }
}

fn apply_records(
    conn: &mut rusqlite::Connection,
    records: &[CompanyRecord],
) -> std::result::Result<CommitResult, rusqlite::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut result = CommitResult::default();
    for record in records {
        match repository::upsert_company(&tx, record)? {
            UpsertOutcome::Inserted => result.inserted += 1,
            UpsertOutcome::Updated => result.updated += 1,
            UpsertOutcome::Unchanged => result.unchanged += 1,
        }
    }
    tx.commit()?;
    Ok(result)
}
