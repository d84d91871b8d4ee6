use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncError;
use crate::model::{CanonicalRow, Table, TimeWindow};
use crate::outbox::ActionPayload;

/// Bulk read of canonical rows for one table and scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchRequest {
    pub table: Table,
    pub business_id: String,
    pub window: Option<TimeWindow>,
    pub limit: usize,
}

/// Backend answer to an applied action: the canonical records it produced
/// or touched. For a created order the order row comes first, followed by
/// its items.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppliedAction {
    pub records: Vec<(Table, CanonicalRow)>,
}

impl AppliedAction {
    pub fn primary(&self, table: Table) -> Option<&CanonicalRow> {
        self.records
            .iter()
            .find(|(t, _)| *t == table)
            .map(|(_, row)| row)
    }
}

#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BackendError {
    /// Transport failure; the action may or may not have been applied.
    #[error("network: {0}")]
    Network(String),
    /// The backend validated and refused the action.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<BackendError> for SyncError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Network(m) => SyncError::Network(m),
            BackendError::Rejected(m) => SyncError::BackendRejected(m),
        }
    }
}

/// Contract of the remote data store. Implementations must deduplicate
/// `apply_action` by `ActionPayload::idempotency_key`.
pub trait Backend {
    fn fetch_rows(&self, request: &FetchRequest) -> Result<Vec<CanonicalRow>, BackendError>;

    fn apply_action(&self, payload: &ActionPayload) -> Result<AppliedAction, BackendError>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn fetch_rows(&self, request: &FetchRequest) -> Result<Vec<CanonicalRow>, BackendError> {
        (**self).fetch_rows(request)
    }

    fn apply_action(&self, payload: &ActionPayload) -> Result<AppliedAction, BackendError> {
        (**self).apply_action(payload)
    }
}
