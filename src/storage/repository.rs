use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::company::{CompanyRecord, SyncState};
use crate::date_util::{format_timestamp, parse_stored_timestamp};
use crate::reconcile::{Snapshot, SnapshotEntry};
use crate::sync::{RunStatus, SyncMode, SyncRun};

// ── Companies ──────────────────────────────────────────────────────

/// What an upsert did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row is newer; nothing was written.
    Unchanged,
}

/// Keyed upsert on `natural_id`. Never lets an older `source_updated_at`
/// overwrite a newer one, so replaying a batch is harmless.
pub fn upsert_company(
    conn: &Connection,
    company: &CompanyRecord,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let existed: bool = conn
        .query_row(
            "SELECT 1 FROM companies WHERE natural_id = ?1",
            params![company.natural_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let attributes = serde_json::Value::Object(company.attributes.clone()).to_string();
    let changed = conn.execute(
        "INSERT INTO companies (
            natural_id, company_name, owner, address, code, uuid, create_time,
            attributes, source_updated_at, fetched_at, sync_state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(natural_id) DO UPDATE SET
            company_name=excluded.company_name, owner=excluded.owner,
            address=excluded.address, code=excluded.code, uuid=excluded.uuid,
            create_time=excluded.create_time, attributes=excluded.attributes,
            source_updated_at=excluded.source_updated_at,
            fetched_at=excluded.fetched_at, sync_state=excluded.sync_state
        WHERE excluded.source_updated_at >= companies.source_updated_at",
        params![
            company.natural_id,
            company.name,
            company.attr_str("owner"),
            company.attr_str("address"),
            company.attr_str("code"),
            company.attr_str("uuid"),
            company.attr_str("createTime"),
            attributes,
            format_timestamp(&company.source_updated_at),
            format_timestamp(&company.fetched_at),
            company.sync_state.as_str(),
        ],
    )?;

    Ok(match (existed, changed) {
        (false, _) => UpsertOutcome::Inserted,
        (true, 0) => UpsertOutcome::Unchanged,
        (true, _) => UpsertOutcome::Updated,
    })
}

const COMPANY_COLUMNS: &str =
    "natural_id, company_name, attributes, source_updated_at, fetched_at, sync_state";

fn row_to_company(row: &Row<'_>) -> Result<CompanyRecord, rusqlite::Error> {
    let attributes: String = row.get(2)?;
    let attributes = match serde_json::from_str(&attributes) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let state: String = row.get(5)?;
    Ok(CompanyRecord {
        natural_id: row.get(0)?,
        name: row.get(1)?,
        attributes,
        source_updated_at: timestamp_column(row, 3)?,
        fetched_at: timestamp_column(row, 4)?,
        sync_state: SyncState::parse(&state).unwrap_or(SyncState::Pending),
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    parse_stored_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp: {raw}").into(),
        )
    })
}

fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_stored_timestamp))
}

/// A live (not soft-deleted) company by natural id.
pub fn get_company(
    conn: &Connection,
    natural_id: &str,
) -> Result<Option<CompanyRecord>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT {COMPANY_COLUMNS} FROM companies
             WHERE natural_id = ?1 AND sync_state != 'deleted'"
        ),
        params![natural_id],
        row_to_company,
    )
    .optional()
}

/// Range scan by source update time, oldest first.
pub fn companies_updated_since(
    conn: &Connection,
    since: &DateTime<Utc>,
    limit: u32,
) -> Result<Vec<CompanyRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMPANY_COLUMNS} FROM companies
         WHERE source_updated_at > ?1
         ORDER BY source_updated_at, natural_id LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![format_timestamp(since), limit], row_to_company)?;
    rows.collect()
}

/// Count of live and soft-deleted companies.
pub fn count_companies(conn: &Connection) -> Result<(u64, u64), rusqlite::Error> {
    conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN sync_state != 'deleted' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN sync_state = 'deleted' THEN 1 ELSE 0 END), 0)
         FROM companies",
        [],
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
    )
}

fn row_to_snapshot_entry(row: &Row<'_>) -> Result<(String, SnapshotEntry), rusqlite::Error> {
    let state: String = row.get(2)?;
    Ok((
        row.get(0)?,
        SnapshotEntry {
            source_updated_at: timestamp_column(row, 1)?,
            deleted: state == SyncState::Deleted.as_str(),
        },
    ))
}

/// The whole cache as a snapshot.
pub fn load_snapshot(conn: &Connection) -> Result<Snapshot, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT natural_id, source_updated_at, sync_state FROM companies")?;
    let rows = stmt.query_map([], row_to_snapshot_entry)?;
    rows.collect()
}

/// Snapshot restricted to the given ids.
pub fn load_snapshot_for(conn: &Connection, natural_ids: &[String]) -> Result<Snapshot, rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT natural_id, source_updated_at, sync_state FROM companies WHERE natural_id = ?1",
    )?;
    let mut snapshot = Snapshot::with_capacity(natural_ids.len());
    for id in natural_ids {
        if let Some((key, entry)) = stmt.query_row(params![id], row_to_snapshot_entry).optional()? {
            snapshot.insert(key, entry);
        }
    }
    Ok(snapshot)
}

// ── Sync Runs ──────────────────────────────────────────────────────

/// Id of the run currently marked `running`, if any.
pub fn get_running_run(conn: &Connection) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT run_id FROM sync_runs WHERE status = 'running' ORDER BY run_id LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}

pub fn insert_sync_run(
    conn: &Connection,
    mode: SyncMode,
    started_at: &DateTime<Utc>,
) -> Result<i64, rusqlite::Error> {
    let started_at = format_timestamp(started_at);
    conn.execute(
        "INSERT INTO sync_runs (mode, status, started_at, heartbeat_at)
         VALUES (?1, 'running', ?2, ?2)",
        params![mode.as_str(), started_at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write every mutable column of `run` and bump its heartbeat. Returns
/// false when the row is missing or already finalized.
pub fn update_sync_run(
    conn: &Connection,
    run: &SyncRun,
    heartbeat_at: &DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_runs SET
            mode = ?2, status = ?3, finished_at = ?4,
            pages_processed = ?5, pages_failed = ?6,
            records_added = ?7, records_updated = ?8,
            records_unchanged = ?9, records_failed = ?10,
            total_records = ?11, watermark = ?12,
            last_error = ?13, duration_ms = ?14,
            total_pages = ?15, heartbeat_at = ?16
         WHERE run_id = ?1 AND finished_at IS NULL",
        params![
            run.run_id,
            run.mode.as_str(),
            run.status.as_str(),
            run.finished_at.as_ref().map(format_timestamp),
            run.pages_processed,
            run.pages_failed,
            run.records_added as i64,
            run.records_updated as i64,
            run.records_unchanged as i64,
            run.records_failed as i64,
            run.total_records.map(|t| t as i64),
            run.watermark.as_ref().map(format_timestamp),
            run.last_error,
            run.duration_ms.map(|d| d as i64),
            run.total_pages,
            format_timestamp(heartbeat_at),
        ],
    )?;
    Ok(count > 0)
}

/// Mark a live run as still owned. Returns false once the row is finalized.
pub fn touch_sync_run(
    conn: &Connection,
    run_id: i64,
    heartbeat_at: &DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE sync_runs SET heartbeat_at = ?2 WHERE run_id = ?1 AND finished_at IS NULL",
        params![run_id, format_timestamp(heartbeat_at)],
    )?;
    Ok(count > 0)
}

const RUN_COLUMNS: &str = "run_id, mode, status, started_at, finished_at,
    pages_processed, pages_failed, records_added, records_updated,
    records_unchanged, records_failed, total_records, watermark, last_error, duration_ms,
    total_pages";

fn row_to_run(row: &Row<'_>) -> Result<SyncRun, rusqlite::Error> {
    let mode: String = row.get(1)?;
    let status: String = row.get(2)?;
    let conversion = |idx: usize, e: crate::error::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    Ok(SyncRun {
        run_id: row.get(0)?,
        mode: SyncMode::parse(&mode).map_err(|e| conversion(1, e))?,
        status: RunStatus::parse(&status).map_err(|e| conversion(2, e))?,
        started_at: timestamp_column(row, 3)?,
        finished_at: optional_timestamp_column(row, 4)?,
        pages_processed: row.get(5)?,
        pages_failed: row.get(6)?,
        records_added: row.get::<_, i64>(7)? as u64,
        records_updated: row.get::<_, i64>(8)? as u64,
        records_unchanged: row.get::<_, i64>(9)? as u64,
        records_failed: row.get::<_, i64>(10)? as u64,
        total_records: row.get::<_, Option<i64>>(11)?.map(|t| t as u64),
        total_pages: row.get(15)?,
        watermark: optional_timestamp_column(row, 12)?,
        last_error: row.get(13)?,
        duration_ms: row.get::<_, Option<i64>>(14)?.map(|d| d as u64),
    })
}

pub fn get_sync_run(conn: &Connection, run_id: i64) -> Result<Option<SyncRun>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE run_id = ?1"),
        params![run_id],
        row_to_run,
    )
    .optional()
}

/// Run history, newest first.
pub fn list_sync_runs(conn: &Connection, limit: u32) -> Result<Vec<SyncRun>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY run_id DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], row_to_run)?;
    rows.collect()
}

/// Watermark of the most recent succeeded run.
pub fn latest_watermark(conn: &Connection) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT watermark FROM sync_runs
             WHERE status = 'succeeded' AND watermark IS NOT NULL
             ORDER BY run_id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.as_deref().and_then(parse_stored_timestamp))
}

/// Finalize `running` rows whose owner stopped heartbeating before
/// `stale_before`. Live runs are left alone.
pub fn fail_stale_runs(
    conn: &Connection,
    stale_before: &DateTime<Utc>,
    now: &DateTime<Utc>,
    marker: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET status = 'failed', finished_at = ?2, last_error = ?3
         WHERE status = 'running' AND finished_at IS NULL AND heartbeat_at < ?1",
        params![format_timestamp(stale_before), format_timestamp(now), marker],
    )
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}
