pub mod gateway;
pub mod repository;

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

pub use gateway::{CommitResult, PersistenceGateway};

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode for concurrent access. The writer serializes writes via
/// `tokio_rusqlite`'s internal channel; the reader can proceed without blocking.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open the database at the default path (`~/.companysync/companysync.db`).
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::FatalConfig("cannot determine home directory".into()))?
            .join(".companysync");
        std::fs::create_dir_all(&dir).map_err(|e| Error::FatalConfig(e.to_string()))?;
        Self::open_at(dir.join("companysync.db")).await
    }

    /// Open the database at the given path.
    pub async fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Self::init_reader(&reader).await?;

        Ok(Self { writer, reader })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // For in-memory, we share the same connection for reader/writer
        // since in-memory DBs are per-connection.
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA synchronous=NORMAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            let migrations = Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))]);
            migrations
                .to_latest(conn)
                .map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    /// Get a reference to the writer connection.
    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    /// Get a reference to the reader connection.
    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{RunStatus, SyncMode, INTERRUPTED_MARKER};
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        assert!(tables.contains(&"companies".to_string()));
        assert!(tables.contains(&"companies_fts".to_string()));
        assert!(tables.contains(&"sync_runs".to_string()));
        assert!(tables.contains(&"app_config".to_string()));
    }

    #[tokio::test]
    async fn test_second_open_leaves_live_run_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let stale_after = Duration::from_secs(120);

        let first = PersistenceGateway::new(Database::open_at(&path).await.unwrap());
        let mut live = first.begin_run(SyncMode::Full, Utc::now(), stale_after).await.unwrap();

        let second = PersistenceGateway::new(Database::open_at(&path).await.unwrap());
        let seen = second.get_run(live.run_id).await.unwrap().unwrap();
        assert_eq!(seen.status, RunStatus::Running);
        assert!(seen.finished_at.is_none());

        let err = second
            .begin_run(SyncMode::Incremental, Utc::now(), stale_after)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SyncInProgress(id) if id == live.run_id));

        live.pages_processed = 1;
        first.record_progress(&live).await.unwrap();
        live.finish(None, Utc::now());
        first.finalize_run(&live).await.unwrap();
        let stored = second.get_run(live.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_abandoned_run_recovered_by_next_begin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let stale_after = Duration::from_secs(120);

        let abandoned = {
            let gateway = PersistenceGateway::new(Database::open_at(&path).await.unwrap());
            let started = Utc::now() - chrono::Duration::hours(1);
            gateway.begin_run(SyncMode::Full, started, stale_after).await.unwrap()
        };

        let gateway = PersistenceGateway::new(Database::open_at(&path).await.unwrap());
        // opening alone changes nothing
        let still = gateway.get_run(abandoned.run_id).await.unwrap().unwrap();
        assert_eq!(still.status, RunStatus::Running);

        let next = gateway.begin_run(SyncMode::Full, Utc::now(), stale_after).await.unwrap();
        assert!(next.run_id > abandoned.run_id);
        let recovered = gateway.get_run(abandoned.run_id).await.unwrap().unwrap();
        assert_eq!(recovered.status, RunStatus::Failed);
        assert_eq!(recovered.last_error.as_deref(), Some(INTERRUPTED_MARKER));
        assert!(recovered.finished_at.is_some());

        // the dead process can no longer write to its row
        let err = gateway.record_progress(&abandoned).await.unwrap_err();
        assert!(matches!(err, Error::RunLost(id) if id == abandoned.run_id));
    }
}
