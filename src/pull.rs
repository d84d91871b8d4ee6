use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, FetchRequest};
use crate::config::PullConfig;
use crate::connectivity::Connectivity;
use crate::error::{Failure, SyncError};
use crate::merge::{self, Merged};
use crate::model::{CanonicalRow, Table, TimeWindow};
use crate::store::{LocalStore, StoreTx};

/// Result of pulling one table (or the order/item pair).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullOutcome {
    pub success: bool,
    /// Rows written.
    pub count: usize,
    /// Rows left alone: protected local rows and rows from another scope.
    pub skipped: usize,
    pub reason: Option<Failure>,
}

impl PullOutcome {
    fn failed(reason: Failure) -> Self {
        Self {
            reason: Some(reason),
            ..Self::default()
        }
    }

    fn merge(mut self, other: &PullOutcome) -> Self {
        self.success &= other.success;
        self.count += other.count;
        self.skipped += other.skipped;
        if self.reason.is_none() {
            self.reason = other.reason.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InitialLoadReport {
    /// True only when every table loaded.
    pub success: bool,
    pub reason: Option<Failure>,
    pub duration_ms: u64,
    pub tables: BTreeMap<Table, PullOutcome>,
}

impl InitialLoadReport {
    /// Some tables loaded even though others failed.
    pub fn is_partial(&self) -> bool {
        !self.success && self.tables.values().any(|t| t.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub table: Table,
    pub done: usize,
    pub total: usize,
}

/// Pulls canonical rows into the local store. Never deletes local rows.
pub struct PullService<'c> {
    store: &'c LocalStore,
    backend: &'c dyn Backend,
    connectivity: &'c dyn Connectivity,
    config: &'c PullConfig,
}

impl<'c> PullService<'c> {
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

    /// Pull one table. Orders and their items always travel together.
    pub fn sync_table(&self, scope: &str, table: Table) -> PullOutcome {
        match table {
            Table::Orders | Table::OrderItems => self.sync_orders(scope),
            other => self.guarded(|| self.pull_whole_table(scope, other)),
        }
    }

    /// Pull orders created within the configured window, then their items.
    #[instrument(skip(self))]
    pub fn sync_orders(&self, scope: &str) -> PullOutcome {
        self.guarded(|| {
            let (orders, items) = self.pull_orders(scope)?;
            Ok(orders.merge(&items))
        })
    }

    pub fn sync_loyalty(&self, scope: &str) -> BTreeMap<Table, PullOutcome> {
        [Table::LoyaltyCards, Table::LoyaltyTransactions]
            .into_iter()
            .map(|t| (t, self.sync_table(scope, t)))
            .collect()
    }

    pub fn initial_load(&self, scope: &str) -> InitialLoadReport {
        self.initial_load_with_progress(scope, |_| {})
    }

    /// Bootstrap every mirrored table for `scope`, then the order aggregate.
    /// Each table commits on its own; a failure leaves earlier tables loaded.
    #[instrument(skip(self, progress))]
    pub fn initial_load_with_progress(
        &self,
        scope: &str,
        mut progress: impl FnMut(&LoadProgress),
    ) -> InitialLoadReport {
        let started = Instant::now();
        let mut report = InitialLoadReport::default();
        if !self.connectivity.is_online() {
            report.reason = Some(Failure::offline());
            return report;
        }

        let total = self.config.mirrored_tables.len() + 2;
        for (i, table) in self.config.mirrored_tables.iter().copied().enumerate() {
            let outcome = self.sync_table(scope, table);
            report.tables.insert(table, outcome);
            progress(&LoadProgress {
                table,
                done: i + 1,
                total,
            });
        }

        match self.pull_orders(scope) {
            Ok((orders, items)) => {
                report.tables.insert(Table::Orders, orders);
                report.tables.insert(Table::OrderItems, items);
            }
            Err(e) => {
                warn!(error = %e, "order pull failed during initial load");
                let failed = PullOutcome::failed(e.to_failure());
                report.tables.insert(Table::Orders, failed.clone());
                report.tables.insert(Table::OrderItems, failed);
            }
        }
        progress(&LoadProgress {
            table: Table::OrderItems,
            done: total,
            total,
        });

        report.success = report.tables.values().all(|t| t.success);
        report.reason = report.tables.values().find_map(|t| t.reason.clone());
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            success = report.success,
            duration_ms = report.duration_ms,
            "initial load finished"
        );
        report
    }

    fn guarded(&self, pull: impl FnOnce() -> Result<PullOutcome, SyncError>) -> PullOutcome {
        if !self.connectivity.is_online() {
            return PullOutcome::failed(Failure::offline());
        }
        pull().unwrap_or_else(|e| {
            warn!(error = %e, "pull failed");
            PullOutcome::failed(e.to_failure())
        })
    }

    fn fetch(&self, scope: &str, table: Table, window: Option<TimeWindow>) -> Result<Vec<CanonicalRow>, SyncError> {
        let rows = self.backend.fetch_rows(&FetchRequest {
            table,
            business_id: scope.to_string(),
            window,
            limit: self.config.batch_size,
        })?;
        if rows.len() >= self.config.batch_size {
            warn!(%table, limit = self.config.batch_size, "pull reached the batch size limit");
        }
        Ok(rows)
    }

    fn pull_whole_table(&self, scope: &str, table: Table) -> Result<PullOutcome, SyncError> {
        let rows = self.fetch(scope, table, None)?;
        let outcome = self.store.with_tx(|tx| {
            let (outcome, _) = write_rows(tx, scope, table, rows, &HashSet::new())?;
            tx.record_sync(table, scope)?;
            Ok(outcome)
        })?;
        debug!(%table, count = outcome.count, skipped = outcome.skipped, "pulled table");
        Ok(outcome)
    }

    fn pull_orders(&self, scope: &str) -> Result<(PullOutcome, PullOutcome), SyncError> {
        let window = TimeWindow::last_days(self.config.order_window_days);
        let orders = self.fetch(scope, Table::Orders, Some(window))?;
        let items = self.fetch(scope, Table::OrderItems, Some(window))?;

        let (orders, items) = self.store.with_tx(|tx| {
            let (orders, protected) = write_rows(tx, scope, Table::Orders, orders, &HashSet::new())?;
            let (items, _) = write_rows(tx, scope, Table::OrderItems, items, &protected)?;
            tx.record_sync(Table::Orders, scope)?;
            tx.record_sync(Table::OrderItems, scope)?;
            Ok((orders, items))
        })?;
        info!(
            orders = orders.count,
            items = items.count,
            skipped = orders.skipped + items.skipped,
            "pulled orders"
        );
        Ok((orders, items))
    }
}

/// Merge `rows` into `table`. Rows whose parent is in `protected_parents`
/// are skipped. Returns the outcome and the ids kept local.
fn write_rows(
    tx: &StoreTx<'_>,
    scope: &str,
    table: Table,
    rows: Vec<CanonicalRow>,
    protected_parents: &HashSet<String>,
) -> Result<(PullOutcome, HashSet<String>), SyncError> {
    let mut outcome = PullOutcome {
        success: true,
        ..PullOutcome::default()
    };
    let mut kept = HashSet::new();
    for row in rows {
        if row.business_id != scope {
            warn!(%table, id = %row.id, "dropping pulled row from another business scope");
            outcome.skipped += 1;
            continue;
        }
        if row
            .parent_id
            .as_ref()
            .is_some_and(|p| protected_parents.contains(p))
        {
            outcome.skipped += 1;
            continue;
        }
        let id = row.id.clone();
        match merge::upsert_canonical(tx, table, row, None)? {
            Merged::Written => outcome.count += 1,
            Merged::KeptLocal => {
                outcome.skipped += 1;
                kept.insert(id);
            }
        }
    }
    Ok((outcome, kept))
}
