use std::fmt;
use thiserror::Error;

use crate::source::FetchError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Permanent request error: {0}")]
    PermanentRequest(String),

    #[error("Fetch failed for page {page}: {cause}")]
    FetchFailed { page: u32, cause: String },

    #[error("Invalid record {natural_id}: {message}")]
    RecordValidation { natural_id: String, message: String },

    #[error("Storage transaction error: {0}")]
    StorageTransaction(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Authentication rejected: {0}")]
    FatalAuth(String),

    #[error("Configuration error: {0}")]
    FatalConfig(String),

    #[error("A sync run is already in progress (run {0})")]
    SyncInProgress(i64),

    #[error("Sync run {0} was finalized by someone else")]
    RunLost(i64),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that abort a whole run rather than a single page or record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FatalAuth(_)
                | Error::FatalConfig(_)
                | Error::StoreUnavailable(_)
                | Error::RunLost(_)
        )
    }

    /// Errors worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::StorageTransaction(_))
    }

    /// Classify a rusqlite failure raised inside a store transaction.
    pub fn from_storage(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e.sqlite_error_code() {
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) | Some(ErrorCode::ReadOnly) => {
                Error::StoreUnavailable(e.to_string())
            }
            Some(_) => Error::StorageTransaction(e.to_string()),
            None => Error::Database(e.to_string()),
        }
    }

    /// Classify the result of a `Connection::call` whose closure failed
    /// with a plain rusqlite error.
    pub fn from_storage_call(e: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match e {
            tokio_rusqlite::Error::Error(e) => Error::from_storage(e),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Auth(msg) => Error::FatalAuth(msg),
            FetchError::InvalidRequest(msg) => Error::FatalConfig(msg),
            FetchError::Exhausted { page, cause } => Error::FetchFailed {
                page,
                cause: cause.to_string(),
            },
            e if e.is_transient() => Error::TransientNetwork(e.to_string()),
            e => Error::PermanentRequest(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
