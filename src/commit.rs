//! Two-phase write path for order mutations.
//!
//! Phase one applies the operator's intent to the local store and queues the
//! matching outbox action in the same transaction. Phase two runs inside the
//! drain once the backend has applied the action: canonical rows land under
//! their server keys and the provisional rows record the confirmation.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::AppliedAction;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::merge::{self, Merged};
use crate::model::{LocalRecord, Order, OrderItem, OrderStatus, RecordKey, Table, ts_to_sql};
use crate::outbox::{
    self, Action, ActionPayload, ActionStatus, CreateOrder, OutboxAction, ProvisionalItem,
};
use crate::store::{LocalStore, Query, StoreTx};

/// Order fields a queued action may change ahead of the backend.
const OPTIMISTIC_ORDER_FIELDS: [&str; 6] = [
    "status",
    "customer_id",
    "customer_name",
    "customer_phone",
    "is_paid",
    "payment_method",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionalOrder {
    pub order: LocalRecord<Order>,
    pub items: Vec<LocalRecord<OrderItem>>,
    pub action: OutboxAction,
}

/// What a confirmation changed locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmEffect {
    pub server_id: Option<String>,
    pub retargeted: usize,
    pub written: usize,
    pub kept_local: usize,
}

pub struct ProvisionalWriter<'c> {
    store: &'c LocalStore,
    connectivity: &'c dyn Connectivity,
}

impl<'c> ProvisionalWriter<'c> {
    pub fn new(store: &'c LocalStore, connectivity: &'c dyn Connectivity) -> Self {
        Self {
            store,
            connectivity,
        }
    }

    /// Create an order and its items under provisional keys and queue the
    /// create action.
    pub fn create_order(
        &self,
        scope: &str,
        order: Order,
        items: Vec<OrderItem>,
    ) -> Result<ProvisionalOrder, SyncError> {
        let local_order_id = RecordKey::new_local().id().to_string();
        let items = items
            .into_iter()
            .map(|item| ProvisionalItem {
                local_item_id: RecordKey::new_local().id().to_string(),
                item: OrderItem {
                    order_id: local_order_id.clone(),
                    ..item
                },
            })
            .collect::<Vec<_>>();
        let item_ids = items
            .iter()
            .map(|i| i.local_item_id.clone())
            .collect::<Vec<_>>();

        let action = self.submit(
            scope,
            Action::CreateOrder(CreateOrder {
                local_order_id: local_order_id.clone(),
                order,
                items,
            }),
        )?;

        let order = self
            .store
            .get_record::<Order>(scope, &local_order_id)?
            .ok_or(SyncError::State("provisional order vanished"))?;
        let mut records = Vec::with_capacity(item_ids.len());
        for id in &item_ids {
            records.push(
                self.store
                    .get_record::<OrderItem>(scope, id)?
                    .ok_or(SyncError::State("provisional item vanished"))?,
            );
        }
        Ok(ProvisionalOrder {
            order,
            items: records,
            action,
        })
    }

    pub fn update_order_status(
        &self,
        scope: &str,
        order_id: &str,
        new_status: OrderStatus,
    ) -> Result<OutboxAction, SyncError> {
        self.submit(
            scope,
            Action::UpdateOrderStatus {
                order_id: order_id.to_string(),
                new_status,
            },
        )
    }

    /// Apply `action` optimistically and queue it, atomically.
    pub fn submit(&self, scope: &str, mut action: Action) -> Result<OutboxAction, SyncError> {
        let offline = !self.connectivity.is_online();
        let queued = self.store.with_tx(|tx| {
            redirect_to_server_id(tx, scope, &mut action)?;
            let queued = outbox::enqueue_in(tx, &ActionPayload::new(scope, action))?;
            apply_optimistic(tx, scope, &queued.payload.action, queued.id, offline)?;
            Ok(queued)
        })?;
        info!(
            action_id = queued.id,
            action_type = queued.action_type().as_str(),
            order_ref = queued.payload.action.order_ref(),
            offline,
            "recorded local change"
        );
        Ok(queued)
    }
}

/// An order confirmed but not yet reconciled still answers to its local id,
/// and so do its items; new actions go straight to the server ids.
fn redirect_to_server_id(tx: &StoreTx<'_>, scope: &str, action: &mut Action) -> Result<(), SyncError> {
    if matches!(action, Action::CreateOrder(_)) {
        return Ok(());
    }
    let order_ref = action.order_ref().to_string();
    let order_target = confirmed_server_id(tx, Table::Orders, scope, &order_ref)?;
    let mut items = BTreeMap::new();
    if let Action::UpdateItemStatus { item_id, .. } = &*action {
        if let Some(server_item) = confirmed_server_id(tx, Table::OrderItems, scope, item_id)? {
            items.insert(item_id.clone(), server_item);
        }
    }
    if order_target.is_none() && items.is_empty() {
        return Ok(());
    }
    let to = order_target.unwrap_or_else(|| order_ref.clone());
    debug!(local = %order_ref, server = %to, "redirecting action to confirmed order");
    action.retarget(&order_ref, &to, &items);
    Ok(())
}

/// Server id recorded on a provisional row by its confirmation.
fn confirmed_server_id(
    tx: &StoreTx<'_>,
    table: Table,
    scope: &str,
    id: &str,
) -> Result<Option<String>, SyncError> {
    Ok(tx
        .get(table, scope, id)?
        .filter(|row| row.key.is_local())
        .and_then(|row| row.server_id))
}

fn apply_optimistic(
    tx: &StoreTx<'_>,
    scope: &str,
    action: &Action,
    action_id: i64,
    offline: bool,
) -> Result<(), SyncError> {
    match action {
        Action::CreateOrder(create) => {
            let mut order = LocalRecord::provisional(scope, create.order.clone()).into_untyped()?;
            order.key = RecordKey::Local(create.local_order_id.clone());
            mark_pending(&mut order, action_id, offline);
            tx.put(Table::Orders, &order)?;
            for item in &create.items {
                let mut row = LocalRecord::provisional(scope, item.item.clone()).into_untyped()?;
                row.key = RecordKey::Local(item.local_item_id.clone());
                mark_pending(&mut row, action_id, offline);
                tx.put(Table::OrderItems, &row)?;
            }
        }
        Action::UpdateOrderStatus {
            order_id,
            new_status,
        } => {
            let mut order = require(tx, Table::Orders, scope, order_id)?;
            order.set_status(new_status.as_str());
            mark_pending(&mut order, action_id, offline);
            tx.put(Table::Orders, &order)?;
            for mut item in tx.query(Table::OrderItems, scope, Query::Parent(order_id))? {
                set_item_status(&mut item, new_status.item_status());
                mark_pending(&mut item, action_id, offline);
                tx.put(Table::OrderItems, &item)?;
            }
        }
        Action::UpdateItemStatus {
            item_id,
            new_status,
            ..
        } => {
            let mut item = require(tx, Table::OrderItems, scope, item_id)?;
            set_item_status(&mut item, *new_status);
            mark_pending(&mut item, action_id, offline);
            tx.put(Table::OrderItems, &item)?;
        }
        Action::UpdateCustomer {
            order_id,
            customer_id,
            customer_name,
            customer_phone,
        } => {
            let mut order = require(tx, Table::Orders, scope, order_id)?;
            for (field, value) in [
                ("customer_id", customer_id),
                ("customer_name", customer_name),
                ("customer_phone", customer_phone),
            ] {
                if let Some(value) = value {
                    set_field(&mut order, field, Value::String(value.clone()));
                }
            }
            mark_pending(&mut order, action_id, offline);
            tx.put(Table::Orders, &order)?;
        }
        Action::ConfirmPayment {
            order_id,
            payment_method,
        } => {
            let mut order = require(tx, Table::Orders, scope, order_id)?;
            set_field(&mut order, "is_paid", Value::Bool(true));
            set_field(&mut order, "payment_method", Value::String(payment_method.clone()));
            mark_pending(&mut order, action_id, offline);
            tx.put(Table::Orders, &order)?;
        }
    }
    Ok(())
}

/// Record a backend-applied action locally. Runs in the transaction that
/// marks the action completed.
pub(crate) fn confirm(
    tx: &StoreTx<'_>,
    action: &OutboxAction,
    applied: &AppliedAction,
) -> Result<ConfirmEffect, SyncError> {
    let scope = action.business_id();
    let mut effect = ConfirmEffect::default();

    let create = match &action.payload.action {
        Action::CreateOrder(create) => {
            let server = applied
                .primary(Table::Orders)
                .ok_or(SyncError::State("create confirmation carried no order row"))?;
            effect.server_id = Some(server.id.clone());
            Some((create, server.id.clone()))
        }
        _ => None,
    };

    for (table, row) in &applied.records {
        if row.business_id != scope {
            return Err(SyncError::State("backend returned a row from another business scope"));
        }
        match merge::upsert_canonical(tx, *table, row.clone(), Some(action.id))? {
            Merged::Written => effect.written += 1,
            Merged::KeptLocal => effect.kept_local += 1,
        }
    }

    let items = match &create {
        Some((create, server_id)) => pair_items(create, server_id, applied),
        None => BTreeMap::new(),
    };
    if let Some((create, server_id)) = &create {
        link_provisional(tx, Table::Orders, scope, &create.local_order_id, server_id)?;
        for (local_id, server_item) in &items {
            link_provisional(tx, Table::OrderItems, scope, local_id, server_item)?;
        }
    }
    stamp_confirmed(tx, scope, action.id)?;

    if let Some((create, server_id)) = &create {
        effect.retargeted = outbox::retarget_order_refs(
            tx.conn(),
            scope,
            &create.local_order_id,
            server_id,
            &items,
        )?;
        carry_optimistic_state(tx, scope, &create.local_order_id, server_id, action.id)?;
        for (local_id, server_item) in &items {
            carry_item_state(tx, scope, local_id, server_item, action.id)?;
        }
        debug!(
            local = %create.local_order_id,
            server = %server_id,
            retargeted = effect.retargeted,
            "linked provisional order to server id"
        );
    }
    Ok(effect)
}

/// Pair provisional items with the server item rows of a created order.
/// The backend answers with items in request order.
fn pair_items(
    create: &CreateOrder,
    server_order: &str,
    applied: &AppliedAction,
) -> BTreeMap<String, String> {
    let server_items = applied
        .records
        .iter()
        .filter(|(table, row)| {
            *table == Table::OrderItems && row.parent_id.as_deref() == Some(server_order)
        })
        .map(|(_, row)| row.id.clone())
        .collect::<Vec<_>>();
    if server_items.len() != create.items.len() {
        warn!(
            local = create.items.len(),
            server = server_items.len(),
            "item count differs from the request, item ids left unmapped"
        );
        return BTreeMap::new();
    }
    create
        .items
        .iter()
        .map(|item| item.local_item_id.clone())
        .zip(server_items)
        .collect()
}

fn link_provisional(
    tx: &StoreTx<'_>,
    table: Table,
    scope: &str,
    local_id: &str,
    server_id: &str,
) -> Result<(), SyncError> {
    if let Some(mut local) = tx.get(table, scope, local_id)? {
        local.server_id = Some(server_id.to_string());
        local.confirmed_at = Some(Utc::now());
        tx.put(table, &local)?;
    }
    Ok(())
}

/// A provisional item changed by a still-queued action lends that state to
/// its server row until the action settles.
fn carry_item_state(
    tx: &StoreTx<'_>,
    scope: &str,
    local_id: &str,
    server_id: &str,
    confirmed_action: i64,
) -> Result<(), SyncError> {
    let (Some(local), Some(mut server)) = (
        tx.get(Table::OrderItems, scope, local_id)?,
        tx.get(Table::OrderItems, scope, server_id)?,
    ) else {
        return Ok(());
    };
    let Some(linked) = local.linked_action_id.filter(|id| *id != confirmed_action) else {
        return Ok(());
    };
    if !matches!(
        outbox::status_of(tx.conn(), linked)?,
        Some(ActionStatus::Pending | ActionStatus::InFlight | ActionStatus::Failed)
    ) {
        return Ok(());
    }
    if let Some(value) = local.fields.get("item_status") {
        set_field(&mut server, "item_status", value.clone());
    }
    server.status = local.status.clone();
    server.pending_sync = true;
    server.is_offline = local.is_offline;
    server.linked_action_id = Some(linked);
    tx.put(Table::OrderItems, &server)
}

/// While later actions on a freshly created order are still queued, the
/// server row keeps the operator's newer local state.
fn carry_optimistic_state(
    tx: &StoreTx<'_>,
    scope: &str,
    local_id: &str,
    server_id: &str,
    confirmed_action: i64,
) -> Result<(), SyncError> {
    let Some(successor) = outbox::latest_open_action(tx.conn(), scope, server_id, confirmed_action)?
    else {
        return Ok(());
    };
    let (Some(local), Some(mut server)) = (
        tx.get(Table::Orders, scope, local_id)?,
        tx.get(Table::Orders, scope, server_id)?,
    ) else {
        return Ok(());
    };
    for field in OPTIMISTIC_ORDER_FIELDS {
        if let Some(value) = local.fields.get(field) {
            set_field(&mut server, field, value.clone());
        }
    }
    server.status = local.status.clone();
    server.pending_sync = true;
    server.is_offline = local.is_offline;
    server.linked_action_id = Some(successor);
    tx.put(Table::Orders, &server)
}

/// Every row still linked to `action_id` is now confirmed.
fn stamp_confirmed(tx: &StoreTx<'_>, scope: &str, action_id: i64) -> Result<(), SyncError> {
    let now = ts_to_sql(&Utc::now());
    for table in [Table::Orders, Table::OrderItems] {
        let n = tx.conn().execute(
            &format!(
                "UPDATE {} SET confirmed_at=?1 WHERE business_id=?2 AND linked_action_id=?3",
                table.as_str()
            ),
            rusqlite::params![now, scope, action_id],
        )?;
        if n > 0 {
            tx.touch(table);
        }
    }
    Ok(())
}

fn require(tx: &StoreTx<'_>, table: Table, scope: &str, id: &str) -> Result<LocalRecord, SyncError> {
    tx.get(table, scope, id)?
        .ok_or(SyncError::State("target row not found in local store"))
}

fn mark_pending(record: &mut LocalRecord, action_id: i64, offline: bool) {
    record.pending_sync = true;
    record.is_offline |= offline;
    record.linked_action_id = Some(action_id);
    record.updated_at = Utc::now();
}

fn set_item_status(item: &mut LocalRecord, status: OrderStatus) {
    item.status = Some(status.as_str().to_string());
    set_field(item, "item_status", Value::String(status.as_str().to_string()));
}

fn set_field(record: &mut LocalRecord, field: &str, value: Value) {
    if let Some(obj) = record.fields.as_object_mut() {
        obj.insert(field.to_string(), value);
    }
}
