use chrono::Utc;
use tracing::debug;

use crate::error::SyncError;
use crate::model::{CanonicalRow, LocalRecord, Table};
use crate::outbox::{self, ActionStatus};
use crate::store::StoreTx;

/// Whether canonical data may replace `existing`.
///
/// A row whose linked action is still unfinished holds the operator's newer
/// intent and wins, unless that action is the one being confirmed.
pub fn may_overwrite(
    existing: Option<&LocalRecord>,
    linked_status: Option<ActionStatus>,
    applying: Option<i64>,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    let Some(linked) = existing.linked_action_id else {
        return true;
    };
    if applying == Some(linked) {
        return true;
    }
    match linked_status {
        None | Some(ActionStatus::Completed) => true,
        Some(ActionStatus::Pending | ActionStatus::InFlight | ActionStatus::Failed) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merged {
    Written,
    /// Kept the local row; it is linked to an unfinished action.
    KeptLocal,
}

/// Write a canonical row unless the local copy is protected.
///
/// With `applying` set the write is a confirmation: the row records the
/// confirming action and time and keeps whatever offline flags it had, so
/// reconciliation decides when they clear.
pub(crate) fn upsert_canonical(
    tx: &StoreTx<'_>,
    table: Table,
    row: CanonicalRow,
    applying: Option<i64>,
) -> Result<Merged, SyncError> {
    let existing = tx.get(table, &row.business_id, &row.id)?;
    let linked_status = match existing.as_ref().and_then(|r| r.linked_action_id) {
        Some(id) => outbox::status_of(tx.conn(), id)?,
        None => None,
    };
    if !may_overwrite(existing.as_ref(), linked_status, applying) {
        debug!(%table, id = %row.id, "kept local row linked to an unfinished action");
        return Ok(Merged::KeptLocal);
    }

    let mut record = LocalRecord::from_canonical(row);
    match (applying, existing) {
        (Some(action_id), existing) => {
            record.linked_action_id = Some(action_id);
            record.confirmed_at = Some(Utc::now());
            if let Some(existing) = existing {
                record.pending_sync = existing.pending_sync;
                record.is_offline = existing.is_offline;
            }
        }
        (None, Some(existing)) => record.confirmed_at = existing.confirmed_at,
        (None, None) => {}
    }
    tx.put(table, &record)?;
    Ok(Merged::Written)
}
