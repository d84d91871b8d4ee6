use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::backend::Backend;
use crate::commit::{ProvisionalOrder, ProvisionalWriter};
use crate::config::EngineConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, Transition};
use crate::error::{Failure, SyncError};
use crate::model::{Order, OrderItem, OrderStatus, Table, TimeWindow, UserConfirmed};
use crate::outbox::{Action, DrainReport, Outbox, OutboxAction, QueueStats};
use crate::pull::{InitialLoadReport, PullOutcome, PullService};
use crate::reconcile::{ReconciliationResult, Reconciler};
use crate::store::{LocalStore, Snapshot, SyncStatusRecord};
use crate::validator::{ValidationResult, Validator};

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Step<T> {
    Done(T),
    Failed(Failure),
    Skipped(String),
}

impl<T> Step<T> {
    fn from_result(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(v) => Step::Done(v),
            Err(e) => Step::Failed(e.to_failure()),
        }
    }

    pub fn done(&self) -> Option<&T> {
        match self {
            Step::Done(v) => Some(v),
            _ => None,
        }
    }
}

/// First pull of a scope loads every table; later cycles refresh orders only.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PullStep {
    InitialLoad(InitialLoadReport),
    Orders(PullOutcome),
}

impl PullStep {
    pub fn success(&self) -> bool {
        match self {
            PullStep::InitialLoad(report) => report.success,
            PullStep::Orders(outcome) => outcome.success,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncCycleReport {
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub drain: Step<DrainReport>,
    pub pull: Step<PullStep>,
    pub reconcile: Step<ReconciliationResult>,
}

impl SyncCycleReport {
    /// Every step ran and no outbox action failed.
    pub fn success(&self) -> bool {
        let drained = self.drain.done().is_some_and(|d| d.failures.is_empty());
        let pulled = self.pull.done().is_some_and(PullStep::success);
        drained && pulled && self.reconcile.done().is_some()
    }
}

/// Engine facade used by the UI: local writes, sync cycles and maintenance
/// for one client session.
pub struct SyncEngine<'c, B> {
    store: &'c LocalStore,
    backend: B,
    connectivity: &'c ConnectivityMonitor,
    config: &'c EngineConfig,
    running: AtomicBool,
}

/// Clears the running flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<'c, B: Backend> SyncEngine<'c, B> {
    pub fn new(
        store: &'c LocalStore,
        backend: B,
        connectivity: &'c ConnectivityMonitor,
        config: &'c EngineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            connectivity,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn outbox(&self) -> Outbox<'_> {
        Outbox::new(self.store, &self.backend, self.connectivity, &self.config.outbox)
    }

    pub fn pull(&self) -> PullService<'_> {
        PullService::new(self.store, &self.backend, self.connectivity, &self.config.pull)
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.store)
    }

    pub fn validator(&self) -> Validator<'_> {
        Validator::new(self.store, &self.backend, self.connectivity, &self.config.pull)
    }

    fn writer(&self) -> ProvisionalWriter<'_> {
        ProvisionalWriter::new(self.store, self.connectivity)
    }

    /// Apply `action` locally and queue it for the backend.
    pub fn enqueue_action(&self, scope: &str, action: Action) -> Result<OutboxAction, SyncError> {
        self.writer().submit(scope, action)
    }

    pub fn create_order_offline(
        &self,
        scope: &str,
        order: Order,
        items: Vec<OrderItem>,
    ) -> Result<ProvisionalOrder, SyncError> {
        self.writer().create_order(scope, order, items)
    }

    pub fn update_order_status(
        &self,
        scope: &str,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<OutboxAction, SyncError> {
        self.writer().update_order_status(scope, order_id, status)
    }

    /// Run drain → pull → reconcile for `scope`. Steps run in order even when
    /// an earlier one fails; a concurrent call is refused.
    #[instrument(skip(self))]
    pub fn run_sync_cycle(&self, scope: &str) -> Result<SyncCycleReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(SyncError::State("sync cycle already running"));
        }
        let _guard = CycleGuard(&self.running);

        let started_at = Utc::now();
        let started = Instant::now();
        let mut report = SyncCycleReport {
            scope: scope.to_string(),
            started_at,
            duration_ms: 0,
            drain: Step::Skipped("offline".into()),
            pull: Step::Skipped("offline".into()),
            reconcile: Step::Skipped("offline".into()),
        };
        if !self.connectivity.is_online() {
            info!("offline, sync cycle skipped");
            return Ok(report);
        }

        report.drain = Step::from_result(self.outbox().drain(scope));
        report.pull = Step::from_result(self.pull_step(scope));
        report.reconcile = Step::from_result(self.reconciler().reconcile(scope));
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if report.success() {
            info!(duration_ms = report.duration_ms, "sync cycle finished");
        } else {
            warn!(duration_ms = report.duration_ms, "sync cycle finished with failures");
        }
        Ok(report)
    }

    fn pull_step(&self, scope: &str) -> Result<PullStep, SyncError> {
        let bootstrapped = self
            .store
            .sync_status(scope)?
            .iter()
            .any(|s| s.table == Table::Orders);
        let pull = self.pull();
        Ok(if bootstrapped {
            PullStep::Orders(pull.sync_orders(scope))
        } else {
            PullStep::InitialLoad(pull.initial_load(scope))
        })
    }

    /// Record a platform connectivity signal. Coming back online runs a cycle.
    pub fn handle_connectivity_change(
        &self,
        online: bool,
        scope: &str,
    ) -> Result<Option<SyncCycleReport>, SyncError> {
        match self.connectivity.set_online(online) {
            Transition::CameOnline => self.run_sync_cycle(scope).map(Some),
            Transition::WentOffline | Transition::Unchanged => Ok(None),
        }
    }

    pub fn queue_stats(&self, scope: &str) -> Result<QueueStats, SyncError> {
        self.outbox().queue_stats(scope)
    }

    /// Outbox counts over every scope on this device.
    pub fn queue_stats_all(&self) -> Result<QueueStats, SyncError> {
        self.outbox().queue_stats_all()
    }

    pub fn validate(&self, scope: &str, window: TimeWindow) -> Result<ValidationResult, SyncError> {
        self.validator().validate(scope, window)
    }

    /// Wipe every table and the outbox, unsent actions included.
    pub fn clear_all_local_data(&self, _confirmed: UserConfirmed) -> Result<(), SyncError> {
        if self.running.load(Ordering::Acquire) {
            return Err(SyncError::State("sync cycle running"));
        }
        warn!("clearing all local data");
        self.store.clear_all()
    }

    pub fn export_snapshot(&self) -> Result<Snapshot, SyncError> {
        self.store.export_snapshot()
    }

    pub fn sync_status(&self, scope: &str) -> Result<Vec<SyncStatusRecord>, SyncError> {
        self.store.sync_status(scope)
    }

    pub fn subscribe(&self, table: Table) -> watch::Receiver<u64> {
        self.store.subscribe(table)
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }
}
