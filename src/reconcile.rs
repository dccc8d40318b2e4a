//! Change detection between a fetched page and the cached snapshot.
//!
//! [`reconcile`] is pure: it reads the snapshot and the raw page and
//! produces a [`WriteBatch`]. Persisting the batch is the gateway's job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::company::{CompanyRecord, SyncState};
use crate::config::DeletionPolicy;
use crate::error::Error;
use crate::source::RawRecord;

/// What the cache currently knows about one natural id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub source_updated_at: DateTime<Utc>,
    pub deleted: bool,
}

/// Cached state keyed by natural id.
pub type Snapshot = HashMap<String, SnapshotEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Noop,
}

#[derive(Debug, Clone)]
pub struct WriteOp {
    pub record: CompanyRecord,
    pub op: Operation,
}

/// A record excluded from the batch, counted as a record-level failure.
#[derive(Debug, Clone)]
pub struct RecordRejection {
    pub natural_id: Option<String>,
    pub reason: String,
}

/// Operations computed for one page, in page order.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub page_num: u32,
    pub ops: Vec<WriteOp>,
    pub rejected: Vec<RecordRejection>,
}

impl WriteBatch {
    fn count(&self, op: Operation) -> usize {
        self.ops.iter().filter(|w| w.op == op).count()
    }

    pub fn inserts(&self) -> usize {
        self.count(Operation::Insert)
    }

    pub fn updates(&self) -> usize {
        self.count(Operation::Update)
    }

    pub fn noops(&self) -> usize {
        self.count(Operation::Noop)
    }

    /// Operations that will touch the store.
    pub fn writes(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter().filter(|w| w.op != Operation::Noop)
    }

    pub fn has_writes(&self) -> bool {
        self.writes().next().is_some()
    }

    /// Newest `source_updated_at` among records that will be written.
    pub fn max_source_updated_at(&self) -> Option<DateTime<Utc>> {
        self.writes().map(|w| w.record.source_updated_at).max()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub deletion_policy: DeletionPolicy,
    /// Stamped on every record as its `fetched_at`.
    pub fetched_at: DateTime<Utc>,
}

/// Partition a raw page into insert/update/noop operations.
///
/// - unknown id → insert
/// - known id with a strictly newer `source_updated_at` → update
/// - known id with an equal or older timestamp → noop
///
/// Removal reports follow `deletion_policy`. Malformed rows land in
/// `rejected` and never abort the page. A duplicate id later in the same
/// page replaces the earlier one only if it is newer.
pub fn reconcile(
    page_num: u32,
    existing: &Snapshot,
    incoming: &[RawRecord],
    options: &ReconcileOptions,
) -> WriteBatch {
    let mut batch = WriteBatch {
        page_num,
        ..WriteBatch::default()
    };
    let mut positions: HashMap<String, usize> = HashMap::new();

    for raw in incoming {
        let record = match CompanyRecord::from_raw(raw, options.fetched_at) {
            Ok(r) => r,
            Err(Error::RecordValidation { natural_id, message }) => {
                log::debug!("Page {page_num}: rejecting record {natural_id}: {message}");
                batch.rejected.push(RecordRejection {
                    natural_id: (natural_id != "<missing>").then_some(natural_id),
                    reason: message,
                });
                continue;
            }
            Err(e) => {
                batch.rejected.push(RecordRejection {
                    natural_id: None,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if let Some(&idx) = positions.get(&record.natural_id) {
            let earlier = &mut batch.ops[idx];
            if record.source_updated_at > earlier.record.source_updated_at {
                let op = match earlier.op {
                    Operation::Noop => classify(existing.get(&record.natural_id), &record, options)
                        .unwrap_or(Operation::Noop),
                    kept => kept,
                };
                *earlier = WriteOp { record, op };
            }
            continue;
        }

        let Some(op) = classify(existing.get(&record.natural_id), &record, options) else {
            // removal of a record we never had
            continue;
        };
        positions.insert(record.natural_id.clone(), batch.ops.len());
        batch.ops.push(WriteOp { record, op });
    }

    batch
}

fn classify(
    current: Option<&SnapshotEntry>,
    record: &CompanyRecord,
    options: &ReconcileOptions,
) -> Option<Operation> {
    if record.sync_state == SyncState::Deleted {
        return match (options.deletion_policy, current) {
            (DeletionPolicy::Ignore, Some(_)) => Some(Operation::Noop),
            (_, None) => None,
            (DeletionPolicy::SoftDelete, Some(entry)) if entry.deleted => Some(Operation::Noop),
            // the store keeps the newer live version
            (DeletionPolicy::SoftDelete, Some(entry))
                if record.source_updated_at < entry.source_updated_at =>
            {
                Some(Operation::Noop)
            }
            (DeletionPolicy::SoftDelete, Some(_)) => Some(Operation::Update),
        };
    }
    Some(match current {
        None => Operation::Insert,
        Some(entry) if record.source_updated_at > entry.source_updated_at => Operation::Update,
        Some(_) => Operation::Noop,
    })
}

/// Fold a committed batch back into the snapshot.
pub fn apply_to_snapshot(snapshot: &mut Snapshot, batch: &WriteBatch) {
    for w in batch.writes() {
        snapshot.insert(
            w.record.natural_id.clone(),
            SnapshotEntry {
                source_updated_at: w.record.source_updated_at,
                deleted: w.record.is_deleted(),
            },
        );
    }
}
