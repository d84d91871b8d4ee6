use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::commit;
use crate::config::OutboxConfig;
use crate::connectivity::Connectivity;
use crate::error::{Failure, SyncError};
use crate::model::{Order, OrderItem, OrderStatus, ts_from_sql, ts_to_sql};
use crate::store::{LocalStore, StoreTx};

/// Delivery state of an outbox action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "in_flight" => Ok(ActionStatus::InFlight),
            "completed" => Ok(ActionStatus::Completed),
            "failed" => Ok(ActionStatus::Failed),
            _ => Err(SyncError::State("unknown action status")),
        }
    }

    /// pending → in_flight → {completed, failed}; failed → pending.
    pub fn can_transition_to(self, next: ActionStatus) -> bool {
        matches!(
            (self, next),
            (ActionStatus::Pending, ActionStatus::InFlight)
                | (ActionStatus::InFlight, ActionStatus::Completed)
                | (ActionStatus::InFlight, ActionStatus::Failed)
                | (ActionStatus::Failed, ActionStatus::Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateOrder,
    UpdateOrderStatus,
    UpdateItemStatus,
    UpdateCustomer,
    ConfirmPayment,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateOrder => "create_order",
            ActionType::UpdateOrderStatus => "update_order_status",
            ActionType::UpdateItemStatus => "update_item_status",
            ActionType::UpdateCustomer => "update_customer",
            ActionType::ConfirmPayment => "confirm_payment",
        }
    }
}

/// An order line created offline together with its provisional id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionalItem {
    pub local_item_id: String,
    pub item: OrderItem,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateOrder {
    pub local_order_id: String,
    pub order: Order,
    pub items: Vec<ProvisionalItem>,
}

/// Mutation kinds the backend knows how to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Action {
    CreateOrder(CreateOrder),
    UpdateOrderStatus {
        order_id: String,
        new_status: OrderStatus,
    },
    UpdateItemStatus {
        order_id: String,
        item_id: String,
        new_status: OrderStatus,
    },
    UpdateCustomer {
        order_id: String,
        customer_id: Option<String>,
        customer_name: Option<String>,
        customer_phone: Option<String>,
    },
    ConfirmPayment {
        order_id: String,
        payment_method: String,
    },
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::CreateOrder(_) => ActionType::CreateOrder,
            Action::UpdateOrderStatus { .. } => ActionType::UpdateOrderStatus,
            Action::UpdateItemStatus { .. } => ActionType::UpdateItemStatus,
            Action::UpdateCustomer { .. } => ActionType::UpdateCustomer,
            Action::ConfirmPayment { .. } => ActionType::ConfirmPayment,
        }
    }

    /// Order this action applies to; actions on one order run in FIFO order.
    pub fn order_ref(&self) -> &str {
        match self {
            Action::CreateOrder(create) => &create.local_order_id,
            Action::UpdateOrderStatus { order_id, .. }
            | Action::UpdateItemStatus { order_id, .. }
            | Action::UpdateCustomer { order_id, .. }
            | Action::ConfirmPayment { order_id, .. } => order_id,
        }
    }

    /// Point the action at confirmed server ids: `from` becomes `to` for the
    /// order, and `items` maps provisional item ids to server item ids.
    pub fn retarget(&mut self, from: &str, to: &str, items: &BTreeMap<String, String>) -> bool {
        let mut changed = false;
        if let Action::UpdateItemStatus { item_id, .. } = self {
            if let Some(server_item) = items.get(item_id.as_str()) {
                *item_id = server_item.clone();
                changed = true;
            }
        }
        match self {
            Action::CreateOrder(_) => changed,
            Action::UpdateOrderStatus { order_id, .. }
            | Action::UpdateItemStatus { order_id, .. }
            | Action::UpdateCustomer { order_id, .. }
            | Action::ConfirmPayment { order_id, .. } => {
                if order_id != from || from == to {
                    return changed;
                }
                *order_id = to.to_string();
                true
            }
        }
    }
}

/// Self-contained, replayable unit sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionPayload {
    /// Client-generated key the backend deduplicates on.
    pub idempotency_key: Uuid,
    pub business_id: String,
    pub action: Action,
}

impl ActionPayload {
    pub fn new(business_id: &str, action: Action) -> Self {
        Self {
            idempotency_key: Uuid::new_v4(),
            business_id: business_id.to_string(),
            action,
        }
    }
}

/// Pending mutation recorded by the client outbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxAction {
    pub id: i64,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxAction {
    pub fn action_type(&self) -> ActionType {
        self.payload.action.action_type()
    }

    pub fn business_id(&self) -> &str {
        &self.payload.business_id
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub completed: u64,
}

/// Why one action did not complete during a drain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionFailure {
    pub action_id: i64,
    pub action_type: ActionType,
    pub attempts: u32,
    /// False once the attempts cap is reached.
    pub will_retry: bool,
    pub failure: Failure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DrainReport {
    pub skipped_offline: bool,
    pub recovered_in_flight: usize,
    pub attempted: usize,
    pub completed: usize,
    /// Held back behind an unfinished earlier action on the same order.
    pub blocked: usize,
    /// Left untouched because connectivity dropped mid-drain.
    pub deferred: usize,
    pub purged: usize,
    pub failures: Vec<ActionFailure>,
}

/// Outbox queue manager bound to a store, a backend and a connectivity gate.
pub struct Outbox<'c> {
    store: &'c LocalStore,
    backend: &'c dyn Backend,
    connectivity: &'c dyn Connectivity,
    config: &'c OutboxConfig,
}

impl<'c> Outbox<'c> {
    pub fn new(
        store: &'c LocalStore,
        backend: &'c dyn Backend,
        connectivity: &'c dyn Connectivity,
        config: &'c OutboxConfig,
    ) -> Self {
        Self {
            store,
            backend,
            connectivity,
            config,
        }
    }

    /// Append an action for `scope`. Local only; never touches the network.
    pub fn enqueue(&self, scope: &str, action: Action) -> Result<OutboxAction, SyncError> {
        self.enqueue_payload(ActionPayload::new(scope, action))
    }

    /// Append a prebuilt payload. Re-enqueueing a known idempotency key
    /// returns the existing action instead of duplicating it.
    pub fn enqueue_payload(&self, payload: ActionPayload) -> Result<OutboxAction, SyncError> {
        self.store.with_tx(|tx| enqueue_in(tx, &payload))
    }

    pub fn get(&self, id: i64) -> Result<Option<OutboxAction>, SyncError> {
        load(self.store.conn(), id)
    }

    /// Pending actions of `scope` in FIFO order.
    pub fn pending_actions(&self, scope: &str) -> Result<Vec<OutboxAction>, SyncError> {
        load_where(
            self.store.conn(),
            "business_id=?1 AND status='pending'",
            params![scope],
        )
    }

    /// Failed actions of `scope`, including those past the attempts cap.
    pub fn failed_actions(&self, scope: &str) -> Result<Vec<OutboxAction>, SyncError> {
        load_where(
            self.store.conn(),
            "business_id=?1 AND status='failed'",
            params![scope],
        )
    }

    /// Counts per status for `scope`.
    pub fn queue_stats(&self, scope: &str) -> Result<QueueStats, SyncError> {
        count_by_status(self.store.conn(), "WHERE business_id=?1", params![scope])
    }

    /// Counts per status across every scope on this device. Diagnostics only.
    pub fn queue_stats_all(&self) -> Result<QueueStats, SyncError> {
        count_by_status(self.store.conn(), "", params![])
    }

    /// Delete completed actions of `scope`. Pending and failed rows are never touched.
    pub fn purge_completed(&self, scope: &str) -> Result<usize, SyncError> {
        let n = self.store.conn().execute(
            "DELETE FROM outbox_actions WHERE business_id=?1 AND status='completed'",
            params![scope],
        )?;
        debug!(purged = n, "purged completed outbox actions");
        Ok(n)
    }

    /// Manual resolution: give a failed action a fresh set of attempts.
    pub fn retry_action(&self, id: i64) -> Result<OutboxAction, SyncError> {
        self.store.with_tx(|tx| {
            let action = load(tx.conn(), id)?.ok_or(SyncError::State("unknown outbox action"))?;
            transition(tx.conn(), &action, ActionStatus::Pending, 0, None)?;
            load(tx.conn(), id)?.ok_or(SyncError::State("unknown outbox action"))
        })
    }

    /// Manual resolution: drop a failed action for good.
    pub fn discard_action(&self, id: i64) -> Result<(), SyncError> {
        let n = self.store.conn().execute(
            "DELETE FROM outbox_actions WHERE action_id=?1 AND status='failed'",
            params![id],
        )?;
        if n == 0 {
            return Err(SyncError::State("only failed actions can be discarded"));
        }
        info!(action_id = id, "discarded failed outbox action");
        Ok(())
    }

    /// Deliver retry-eligible actions of `scope` one at a time, oldest first.
    #[instrument(skip(self))]
    pub fn drain(&self, scope: &str) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        if !self.connectivity.is_online() {
            debug!("offline, skipping drain");
            report.skipped_offline = true;
            return Ok(report);
        }

        report.recovered_in_flight = self.recover_in_flight(scope)?;
        let candidates = self.retry_eligible_ids(scope)?;
        if candidates.is_empty() {
            debug!("no pending actions to drain");
        }

        for (pos, id) in candidates.iter().copied().enumerate() {
            if !self.connectivity.is_online() {
                report.deferred = candidates.len() - pos;
                warn!(deferred = report.deferred, "connectivity lost mid-drain");
                break;
            }
            // Reload: an earlier confirmation may have re-targeted this payload.
            let Some(action) = load(self.store.conn(), id)? else {
                continue;
            };
            if self.has_unfinished_predecessor(&action)? {
                debug!(action_id = id, "blocked behind an earlier action on the same order");
                report.blocked += 1;
                continue;
            }

            report.attempted += 1;
            self.store.with_tx(|tx| {
                let mut current = action.clone();
                let last_error = current.last_error.clone();
                if current.status == ActionStatus::Failed {
                    transition(
                        tx.conn(),
                        &current,
                        ActionStatus::Pending,
                        current.attempts,
                        last_error.as_deref(),
                    )?;
                    current.status = ActionStatus::Pending;
                }
                // The previous error stays visible until the attempt settles.
                transition(
                    tx.conn(),
                    &current,
                    ActionStatus::InFlight,
                    current.attempts,
                    last_error.as_deref(),
                )
            })?;
            let in_flight = OutboxAction {
                status: ActionStatus::InFlight,
                ..action
            };

            let applied = self.backend.apply_action(&in_flight.payload).map_err(SyncError::from);
            let outcome = applied.and_then(|applied| {
                self.store.with_tx(|tx| {
                    transition(tx.conn(), &in_flight, ActionStatus::Completed, in_flight.attempts, None)?;
                    commit::confirm(tx, &in_flight, &applied)
                })
            });

            match outcome {
                Ok(effect) => {
                    info!(
                        action_id = id,
                        action_type = in_flight.action_type().as_str(),
                        server_id = effect.server_id.as_deref(),
                        "outbox action confirmed"
                    );
                    report.completed += 1;
                }
                Err(e) => {
                    let failure = self.record_failure(&in_flight, &e)?;
                    report.failures.push(failure);
                }
            }
        }

        if self.config.purge_completed_after_drain && report.completed > 0 {
            report.purged = self.purge_completed(scope)?;
        }
        info!(
            completed = report.completed,
            failed = report.failures.len(),
            blocked = report.blocked,
            "drain finished"
        );
        Ok(report)
    }

    /// An action left in flight by an interrupted cycle counts as a failed attempt.
    fn recover_in_flight(&self, scope: &str) -> Result<usize, SyncError> {
        let stuck = load_where(
            self.store.conn(),
            "business_id=?1 AND status='in_flight'",
            params![scope],
        )?;
        for action in &stuck {
            warn!(action_id = action.id, "recovering action left in flight");
            self.record_failure(action, &SyncError::Network("interrupted while in flight".into()))?;
        }
        Ok(stuck.len())
    }

    fn retry_eligible_ids(&self, scope: &str) -> Result<Vec<i64>, SyncError> {
        let mut stmt = self.store.conn().prepare(
            "SELECT action_id FROM outbox_actions
WHERE business_id=?1 AND (status='pending' OR (status='failed' AND attempts<?2))
ORDER BY action_id ASC",
        )?;
        let rows = stmt.query_map(params![scope, self.config.max_attempts], |r| r.get(0))?;
        let mut out = Vec::new();
        for id in rows {
            out.push(id?);
        }
        Ok(out)
    }

    fn has_unfinished_predecessor(&self, action: &OutboxAction) -> Result<bool, SyncError> {
        let n: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM outbox_actions
WHERE business_id=?1 AND order_ref=?2 AND action_id<?3 AND status!='completed'",
            params![action.business_id(), action.payload.action.order_ref(), action.id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    /// in_flight → failed, and back to pending when the error is transient and
    /// attempts remain.
    fn record_failure(&self, action: &OutboxAction, err: &SyncError) -> Result<ActionFailure, SyncError> {
        let attempts = action.attempts + 1;
        let capped = attempts >= self.config.max_attempts;
        let message = err.to_string();
        self.store.with_tx(|tx| {
            transition(tx.conn(), action, ActionStatus::Failed, attempts, Some(&message))?;
            if err.is_transient() && !capped {
                let failed = OutboxAction {
                    status: ActionStatus::Failed,
                    ..action.clone()
                };
                transition(tx.conn(), &failed, ActionStatus::Pending, attempts, Some(&message))?;
            }
            Ok(())
        })?;

        let failure = if capped {
            warn!(action_id = action.id, attempts, error = %message, "attempts cap reached");
            SyncError::QueueCapacityExceeded {
                action_id: action.id,
                attempts,
                last_error: message,
            }
            .to_failure()
        } else {
            warn!(action_id = action.id, attempts, error = %message, "outbox action failed");
            err.to_failure()
        };
        Ok(ActionFailure {
            action_id: action.id,
            action_type: action.action_type(),
            attempts,
            will_retry: !capped,
            failure,
        })
    }
}

fn count_by_status(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<QueueStats, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT status, COUNT(*) FROM outbox_actions {filter} GROUP BY status"
    ))?;
    let rows = stmt.query_map(args, |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    let mut stats = QueueStats::default();
    for row in rows {
        let (status, count) = row?;
        let count = u64::try_from(count).unwrap_or(0);
        match ActionStatus::parse(&status)? {
            ActionStatus::Pending => stats.pending = count,
            ActionStatus::InFlight => stats.in_flight = count,
            ActionStatus::Completed => stats.completed = count,
            ActionStatus::Failed => stats.failed = count,
        }
    }
    Ok(stats)
}

/// Insert `payload` inside an open transaction.
pub(crate) fn enqueue_in(tx: &StoreTx<'_>, payload: &ActionPayload) -> Result<OutboxAction, SyncError> {
    let now = ts_to_sql(&Utc::now());
    let key = payload.idempotency_key.to_string();
    let inserted = tx.conn().execute(
        "INSERT INTO outbox_actions
(idempotency_key,business_id,action_type,order_ref,payload,status,attempts,created_at,updated_at)
VALUES (?1,?2,?3,?4,?5,'pending',0,?6,?6)
ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            key,
            payload.business_id,
            payload.action.action_type().as_str(),
            payload.action.order_ref(),
            serde_json::to_string(payload)?,
            now,
        ],
    )?;
    let id: i64 = tx.conn().query_row(
        "SELECT action_id FROM outbox_actions WHERE idempotency_key=?1",
        params![key],
        |r| r.get(0),
    )?;
    if inserted == 0 {
        debug!(action_id = id, "idempotency key already queued");
    } else {
        debug!(
            action_id = id,
            action_type = payload.action.action_type().as_str(),
            "queued outbox action"
        );
    }
    load(tx.conn(), id)?.ok_or(SyncError::State("queued action vanished"))
}

/// Move `action` to `next`, refusing transitions the lifecycle forbids or
/// rows that changed underneath us.
fn transition(
    conn: &Connection,
    action: &OutboxAction,
    next: ActionStatus,
    attempts: u32,
    last_error: Option<&str>,
) -> Result<(), SyncError> {
    if !action.status.can_transition_to(next) {
        return Err(SyncError::State("illegal outbox status transition"));
    }
    let n = conn.execute(
        "UPDATE outbox_actions
SET status=?1, attempts=?2, last_error=?3, updated_at=?4
WHERE action_id=?5 AND status=?6",
        params![
            next.as_str(),
            attempts,
            last_error,
            ts_to_sql(&Utc::now()),
            action.id,
            action.status.as_str(),
        ],
    )?;
    if n == 0 {
        return Err(SyncError::State("outbox action changed concurrently"));
    }
    Ok(())
}

/// Rewrite queued actions of `scope` that still reference order `from` or
/// one of its provisional items.
pub(crate) fn retarget_order_refs(
    conn: &Connection,
    scope: &str,
    from: &str,
    to: &str,
    items: &BTreeMap<String, String>,
) -> Result<usize, SyncError> {
    let queued = load_where(
        conn,
        "business_id=?1 AND order_ref=?2 AND status IN ('pending','failed')",
        params![scope, from],
    )?;
    let mut changed = 0;
    for mut action in queued {
        if !action.payload.action.retarget(from, to, items) {
            continue;
        }
        conn.execute(
            "UPDATE outbox_actions SET order_ref=?1, payload=?2, updated_at=?3 WHERE action_id=?4",
            params![
                to,
                serde_json::to_string(&action.payload)?,
                ts_to_sql(&Utc::now()),
                action.id
            ],
        )?;
        changed += 1;
    }
    Ok(changed)
}

/// Newest unfinished action on `order_ref`, other than `except`.
pub(crate) fn latest_open_action(
    conn: &Connection,
    scope: &str,
    order_ref: &str,
    except: i64,
) -> Result<Option<i64>, SyncError> {
    let id = conn
        .query_row(
            "SELECT action_id FROM outbox_actions
WHERE business_id=?1 AND order_ref=?2 AND action_id!=?3 AND status!='completed'
ORDER BY action_id DESC LIMIT 1",
            params![scope, order_ref, except],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn status_of(conn: &Connection, id: i64) -> Result<Option<ActionStatus>, SyncError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM outbox_actions WHERE action_id=?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    status.map(|s| ActionStatus::parse(&s)).transpose()
}

pub(crate) fn load(conn: &Connection, id: i64) -> Result<Option<OutboxAction>, SyncError> {
    Ok(load_where(conn, "action_id=?1", params![id])?.pop())
}

pub(crate) fn load_all(conn: &Connection) -> Result<Vec<OutboxAction>, SyncError> {
    load_where(conn, "1=1", params![])
}

fn load_where(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<OutboxAction>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT action_id, payload, status, attempts, last_error, created_at, updated_at
FROM outbox_actions
WHERE {filter}
ORDER BY action_id ASC"
    ))?;
    let rows = stmt.query_map(args, |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, u32>(3)?,
            r.get::<_, Option<String>>(4)?,
            ts_from_sql(5, &r.get::<_, String>(5)?)?,
            ts_from_sql(6, &r.get::<_, String>(6)?)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, payload, status, attempts, last_error, created_at, updated_at) = row?;
        out.push(OutboxAction {
            id,
            payload: serde_json::from_str(&payload)?,
            status: ActionStatus::parse(&status)?,
            attempts,
            last_error,
            created_at,
            updated_at,
        });
    }
    Ok(out)
}
