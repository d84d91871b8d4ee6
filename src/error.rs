use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("local storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("network: {0}")]
    Network(String),
    #[error("backend rejected action: {0}")]
    BackendRejected(String),
    #[error("action {action_id} reached the attempts cap ({attempts}): {last_error}")]
    QueueCapacityExceeded {
        action_id: i64,
        attempts: u32,
        last_error: String,
    },
    #[error("reconciliation conflict on {table} row {row_id}: {detail}")]
    ReconciliationConflict {
        table: &'static str,
        row_id: String,
        detail: String,
    },
    #[error("invalid state: {0}")]
    State(&'static str),
}

/// Coarse classification used at the UI boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StorageUnavailable,
    NetworkError,
    BackendRejected,
    QueueCapacityExceeded,
    ReconciliationConflict,
    InvalidState,
    Internal,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Sqlite(e) if is_storage_failure(e) => ErrorKind::StorageUnavailable,
            SyncError::Sqlite(_) | SyncError::Serde(_) => ErrorKind::Internal,
            SyncError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            SyncError::Network(_) => ErrorKind::NetworkError,
            SyncError::BackendRejected(_) => ErrorKind::BackendRejected,
            SyncError::QueueCapacityExceeded { .. } => ErrorKind::QueueCapacityExceeded,
            SyncError::ReconciliationConflict { .. } => ErrorKind::ReconciliationConflict,
            SyncError::State(_) => ErrorKind::InvalidState,
        }
    }

    /// Transient errors leave the action eligible for the next drain.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::NetworkError)
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

fn is_storage_failure(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            ErrorCode::CannotOpen
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::SystemIoFailure
                | ErrorCode::ReadOnly
                | ErrorCode::DiskFull
                | ErrorCode::PermissionDenied
        ),
        _ => false,
    }
}

/// Serializable error half of the `{ok, kind, message}` result shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn offline() -> Self {
        Failure {
            kind: ErrorKind::NetworkError,
            message: "offline".to_string(),
        }
    }
}

impl From<&SyncError> for Failure {
    fn from(e: &SyncError) -> Self {
        e.to_failure()
    }
}

/// Render a result as the JSON envelope handed to UI collaborators.
pub fn envelope<T: Serialize>(result: &Result<T, SyncError>) -> serde_json::Value {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => serde_json::json!({ "ok": true, "value": value }),
            Err(e) => failure_envelope(&SyncError::from(e).to_failure()),
        },
        Err(e) => failure_envelope(&e.to_failure()),
    }
}

pub fn failure_envelope(failure: &Failure) -> serde_json::Value {
    serde_json::json!({
        "ok": false,
        "kind": failure.kind,
        "message": failure.message,
    })
}
