pub mod orchestrator;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Marker stored in `last_error` for runs stopped by `cancel_sync`.
pub const CANCELLED_MARKER: &str = "cancelled";
/// Marker stored in `last_error` for runs whose owning process stopped
/// heartbeating.
pub const INTERRUPTED_MARKER: &str = "interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(Error::Other(format!("unknown sync mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartialFailure => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "partial" => Ok(RunStatus::PartialFailure),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Other(format!("unknown run status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != RunStatus::Running
    }
}

/// Audit record of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub run_id: i64,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_processed: u32,
    pub pages_failed: u32,
    pub records_added: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub records_failed: u64,
    /// Record count reported by the source, if any.
    pub total_records: Option<u64>,
    /// Page count reported by the source, if any.
    pub total_pages: Option<u32>,
    /// Newest `source_updated_at` committed, carried over from the previous run.
    pub watermark: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl SyncRun {
    pub fn new(run_id: i64, mode: SyncMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            mode,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            pages_processed: 0,
            pages_failed: 0,
            records_added: 0,
            records_updated: 0,
            records_unchanged: 0,
            records_failed: 0,
            total_records: None,
            total_pages: None,
            watermark: None,
            last_error: None,
            duration_ms: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Completion estimate as of `now`.
    ///
    /// Percentage is by pages when the source reported a page count, else
    /// by records. The remaining-time estimate extrapolates the page rate
    /// so far and is only given for unfinished runs with a known page count.
    pub fn progress(&self, now: DateTime<Utc>) -> RunProgress {
        let pages_done = self.pages_processed + self.pages_failed;
        let records_done =
            self.records_added + self.records_updated + self.records_unchanged + self.records_failed;

        let percent = match (self.total_pages, self.total_records) {
            (Some(pages), _) if pages > 0 => f64::from(pages_done) / f64::from(pages) * 100.0,
            (_, Some(records)) if records > 0 => records_done as f64 / records as f64 * 100.0,
            _ if self.status == RunStatus::Succeeded => 100.0,
            _ => 0.0,
        };

        let elapsed_ms = (self.finished_at.unwrap_or(now) - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let eta_seconds = match self.total_pages {
            Some(total) if !self.is_finished() && pages_done > 0 && elapsed_ms > 0 => {
                let remaining = u64::from(total.saturating_sub(pages_done));
                Some(remaining * elapsed_ms / u64::from(pages_done) / 1000)
            }
            _ => None,
        };

        RunProgress {
            pages_done,
            total_pages: self.total_pages,
            records_done,
            total_records: self.total_records,
            percent: percent.min(100.0),
            eta_seconds,
        }
    }

    /// Move to the terminal status implied by the counters.
    ///
    /// `fatal` is the error that aborted the loop, if any. Only the first
    /// call has any effect.
    pub fn finish(&mut self, fatal: Option<String>, now: DateTime<Utc>) {
        if self.is_finished() {
            return;
        }
        self.status = match (&fatal, self.pages_failed) {
            (Some(_), _) => RunStatus::Failed,
            (None, 0) => RunStatus::Succeeded,
            (None, _) => RunStatus::PartialFailure,
        };
        if fatal.is_some() {
            self.last_error = fatal;
        }
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

/// Point-in-time completion estimate for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProgress {
    /// Committed plus failed pages.
    pub pages_done: u32,
    pub total_pages: Option<u32>,
    pub records_done: u64,
    pub total_records: Option<u64>,
    pub percent: f64,
    pub eta_seconds: Option<u64>,
}

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Overrides the configured page size for this run.
    pub page_size: Option<u32>,
}

impl SyncOptions {
    pub fn full() -> Self {
        Self { mode: SyncMode::Full, page_size: None }
    }

    pub fn incremental() -> Self {
        Self { mode: SyncMode::Incremental, page_size: None }
    }
}

/// Observer for run progress. All methods default to no-ops.
pub trait SyncProgress: Send + Sync {
    fn on_run_start(&self, _run: &SyncRun) {}
    fn on_page_committed(&self, _run: &SyncRun, _page_num: u32) {}
    fn on_page_failed(&self, _run: &SyncRun, _page_num: u32, _error: &Error) {}
    fn on_run_complete(&self, _run: &SyncRun) {}
}

/// Progress reporter that ignores every event.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
