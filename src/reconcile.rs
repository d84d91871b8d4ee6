use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Failure, SyncError};
use crate::model::{LocalRecord, Table};
use crate::outbox::{self, ActionStatus};
use crate::store::{LocalStore, Query, StoreTx};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationResult {
    /// Provisional rows replaced by their server copy.
    pub deleted_local: usize,
    /// Child rows removed with them.
    pub deleted_children: usize,
    pub flags_cleared: usize,
    /// Rows left untouched because their state could not be settled.
    pub conflicts: Vec<Failure>,
}

impl ReconciliationResult {
    pub fn is_noop(&self) -> bool {
        self.deleted_local == 0 && self.deleted_children == 0 && self.flags_cleared == 0
    }
}

/// Collapses confirmed provisional rows into their server rows.
pub struct Reconciler<'c> {
    store: &'c LocalStore,
}

impl<'c> Reconciler<'c> {
    pub fn new(store: &'c LocalStore) -> Self {
        Self { store }
    }

    /// Safe to run any number of times; a second run finds nothing to do.
    #[instrument(skip(self))]
    pub fn reconcile(&self, scope: &str) -> Result<ReconciliationResult, SyncError> {
        let result = self.store.with_tx(|tx| {
            let mut result = ReconciliationResult::default();
            collapse_confirmed_orders(tx, scope, &mut result)?;
            for table in Table::ALL {
                clear_settled_flags(tx, scope, table, &mut result)?;
            }
            Ok(result)
        })?;
        if result.is_noop() {
            debug!("nothing to reconcile");
        } else {
            info!(
                deleted_local = result.deleted_local,
                deleted_children = result.deleted_children,
                flags_cleared = result.flags_cleared,
                "reconciled local rows"
            );
        }
        Ok(result)
    }
}

fn collapse_confirmed_orders(
    tx: &StoreTx<'_>,
    scope: &str,
    result: &mut ReconciliationResult,
) -> Result<(), SyncError> {
    for row in tx.query(Table::Orders, scope, Query::All)? {
        let (true, Some(server_id)) = (row.key.is_local(), row.server_id.as_deref()) else {
            continue;
        };
        if tx.get(Table::Orders, scope, server_id)?.is_none() {
            let conflict = SyncError::ReconciliationConflict {
                table: Table::Orders.as_str(),
                row_id: row.key.id().to_string(),
                detail: format!("server copy {server_id} is missing"),
            };
            warn!(error = %conflict, "keeping provisional order");
            result.conflicts.push(conflict.to_failure());
            continue;
        }
        let (rows, children) = tx.delete_cascade(Table::Orders, scope, row.key.id())?;
        result.deleted_local += rows;
        result.deleted_children += children;
    }
    Ok(())
}

fn clear_settled_flags(
    tx: &StoreTx<'_>,
    scope: &str,
    table: Table,
    result: &mut ReconciliationResult,
) -> Result<(), SyncError> {
    for row in tx.query(table, scope, Query::PendingSync)? {
        if row.key.is_local() || !is_settled(tx, &row)? {
            continue;
        }
        if tx.clear_flags(table, scope, row.key.id())? {
            result.flags_cleared += 1;
        }
    }
    Ok(())
}

/// The linked action completed, or it was purged after a confirmation.
fn is_settled(tx: &StoreTx<'_>, row: &LocalRecord) -> Result<bool, SyncError> {
    let Some(action_id) = row.linked_action_id else {
        return Ok(false);
    };
    Ok(match outbox::status_of(tx.conn(), action_id)? {
        Some(ActionStatus::Completed) => true,
        None => row.confirmed_at.is_some(),
        Some(_) => false,
    })
}
