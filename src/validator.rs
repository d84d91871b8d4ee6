//! On-demand comparison of local orders against the backend.
//!
//! Validation is read-only. The two remediations mutate the local store and
//! each demands a [`UserConfirmed`] token.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::backend::{Backend, FetchRequest};
use crate::config::PullConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::model::{CanonicalRow, LocalRecord, RecordKey, Table, TimeWindow, UserConfirmed};
use crate::store::{LocalStore, Query};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteOnly {
    pub id: String,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalOnly {
    pub key: RecordKey,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMismatch {
    /// Server id both sides share.
    pub id: String,
    /// Local row carrying the mismatch; may still be provisionally keyed.
    pub local_key: RecordKey,
    pub local: Option<String>,
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub scope: String,
    pub window: TimeWindow,
    pub checked_at: DateTime<Utc>,
    pub remote_count: usize,
    pub local_count: usize,
    pub remote_only: Vec<RemoteOnly>,
    pub local_only: Vec<LocalOnly>,
    pub status_mismatch: Vec<StatusMismatch>,
    /// Rows awaiting an outbox action; drift on them is expected.
    pub in_flight: usize,
    /// False when the remote listing hit the batch limit. Rows missing from
    /// a truncated listing are not reported as local-only.
    pub remote_complete: bool,
    pub is_valid: bool,
}

impl ValidationResult {
    pub fn summary(&self) -> String {
        if !self.remote_complete {
            format!(
                "remote listing truncated at {} orders; {} remote only, {} status mismatches",
                self.remote_count,
                self.remote_only.len(),
                self.status_mismatch.len()
            )
        } else if self.is_valid {
            format!(
                "{} orders match ({} awaiting sync)",
                self.local_count, self.in_flight
            )
        } else {
            format!(
                "{} remote only, {} local only, {} status mismatches",
                self.remote_only.len(),
                self.local_only.len(),
                self.status_mismatch.len()
            )
        }
    }
}

pub struct Validator<'c> {
    store: &'c LocalStore,
    backend: &'c dyn Backend,
    connectivity: &'c dyn Connectivity,
    config: &'c PullConfig,
}

impl<'c> Validator<'c> {
    pub fn new(
        store: &'c LocalStore,
        backend: &'c dyn Backend,
        connectivity: &'c dyn Connectivity,
        config: &'c PullConfig,
    ) -> Self {
        Self {
            store,
            backend,
            connectivity,
            config,
        }
    }

    #[instrument(skip(self))]
    pub fn validate(&self, scope: &str, window: TimeWindow) -> Result<ValidationResult, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Network("offline".into()));
        }
        let remote = self.backend.fetch_rows(&FetchRequest {
            table: Table::Orders,
            business_id: scope.to_string(),
            window: Some(window),
            limit: self.config.batch_size,
        })?;
        let remote_complete = remote.len() < self.config.batch_size;
        if !remote_complete {
            warn!(
                limit = self.config.batch_size,
                "remote listing hit the batch limit, local-only rows not classified"
            );
        }
        let local = self.store.query(Table::Orders, scope, Query::CreatedIn(window))?;
        let result = diff(scope, window, remote, local, remote_complete);
        if result.is_valid {
            info!(summary = %result.summary(), "local orders match backend");
        } else {
            warn!(summary = %result.summary(), "local orders drifted from backend");
        }
        Ok(result)
    }

    /// Remove local rows the backend does not know about, with their items.
    /// Refused for a result built from a truncated remote listing.
    pub fn delete_local_only(
        &self,
        result: &ValidationResult,
        _confirmed: UserConfirmed,
    ) -> Result<usize, SyncError> {
        if !result.remote_complete {
            return Err(SyncError::State(
                "validation saw a truncated remote listing; local-only rows are unknown",
            ));
        }
        let deleted = self.store.with_tx(|tx| {
            let mut deleted = 0;
            for row in &result.local_only {
                let (rows, _) = tx.delete_cascade(Table::Orders, &result.scope, row.key.id())?;
                deleted += rows;
            }
            Ok(deleted)
        })?;
        info!(scope = %result.scope, deleted, "deleted local-only orders");
        Ok(deleted)
    }

    /// Take the backend status for every mismatch that is still not awaiting sync.
    pub fn adopt_remote_status(
        &self,
        result: &ValidationResult,
        _confirmed: UserConfirmed,
    ) -> Result<usize, SyncError> {
        let adopted = self.store.with_tx(|tx| {
            let mut adopted = 0;
            for mismatch in &result.status_mismatch {
                let (Some(mut row), Some(remote)) = (
                    tx.get(Table::Orders, &result.scope, mismatch.local_key.id())?,
                    mismatch.remote.as_deref(),
                ) else {
                    continue;
                };
                if row.pending_sync {
                    continue;
                }
                row.set_status(remote);
                row.updated_at = Utc::now();
                tx.put(Table::Orders, &row)?;
                adopted += 1;
            }
            Ok(adopted)
        })?;
        info!(scope = %result.scope, adopted, "adopted remote order status");
        Ok(adopted)
    }
}

fn diff(
    scope: &str,
    window: TimeWindow,
    remote: Vec<CanonicalRow>,
    local: Vec<LocalRecord>,
    remote_complete: bool,
) -> ValidationResult {
    let remote: BTreeMap<String, CanonicalRow> = remote
        .into_iter()
        .filter(|r| r.business_id == scope)
        .map(|r| (r.id.clone(), r))
        .collect();

    // A confirmed provisional row and its server copy describe one order;
    // the server-keyed row speaks for it.
    let mut by_id: BTreeMap<String, LocalRecord> = BTreeMap::new();
    for row in local {
        let id = effective_id(&row).to_string();
        match by_id.get(&id) {
            Some(existing) if !existing.key.is_local() => {}
            _ => {
                by_id.insert(id, row);
            }
        }
    }

    let mut result = ValidationResult {
        scope: scope.to_string(),
        window,
        checked_at: Utc::now(),
        remote_count: remote.len(),
        local_count: by_id.len(),
        remote_only: Vec::new(),
        local_only: Vec::new(),
        status_mismatch: Vec::new(),
        in_flight: 0,
        remote_complete,
        is_valid: false,
    };

    for (id, row) in &by_id {
        if row.pending_sync {
            result.in_flight += 1;
            continue;
        }
        match remote.get(id) {
            None if !remote_complete => {}
            None => result.local_only.push(LocalOnly {
                key: row.key.clone(),
                status: row.status.clone(),
                created_at: row.created_at,
            }),
            Some(canonical) if canonical.status != row.status => {
                result.status_mismatch.push(StatusMismatch {
                    id: id.clone(),
                    local_key: row.key.clone(),
                    local: row.status.clone(),
                    remote: canonical.status.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for (id, canonical) in &remote {
        if !by_id.contains_key(id) {
            result.remote_only.push(RemoteOnly {
                id: id.clone(),
                status: canonical.status.clone(),
                created_at: canonical.created_at,
            });
        }
    }

    result.is_valid = remote_complete
        && result.remote_only.is_empty()
        && result.local_only.is_empty()
        && result.status_mismatch.is_empty();
    result
}

fn effective_id(row: &LocalRecord) -> &str {
    match (&row.key, row.server_id.as_deref()) {
        (RecordKey::Local(_), Some(server_id)) => server_id,
        (key, _) => key.id(),
    }
}
