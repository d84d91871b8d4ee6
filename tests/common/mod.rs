#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{Duration, Utc};
use pos_sync::{
    Action, ActionPayload, AppliedAction, Backend, BackendError, CanonicalRow, FetchRequest,
    LocalRecord, LocalStore, Order, OrderItem, OrderStatus, Table,
};
use serde_json::{Value, json};
use uuid::Uuid;

pub const SCOPE: &str = "biz-1";

#[derive(Default)]
struct State {
    tables: BTreeMap<Table, Vec<CanonicalRow>>,
    applied: HashMap<Uuid, AppliedAction>,
    calls: Vec<ActionPayload>,
    scripted: VecDeque<BackendError>,
    lost_responses: usize,
    reject: Option<String>,
    next_id: u64,
}

/// In-memory backend with server-side idempotency and scripted failures.
pub struct MockBackend {
    state: RefCell<State>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Server ids are handed out as `S-{n}` starting at `first_id`.
    pub fn starting_at(first_id: u64) -> Self {
        Self {
            state: RefCell::new(State {
                next_id: first_id,
                ..State::default()
            }),
        }
    }

    pub fn seed(&self, table: Table, row: CanonicalRow) {
        self.state
            .borrow_mut()
            .tables
            .entry(table)
            .or_default()
            .push(row);
    }

    /// Fail the next apply call with `err` before touching any data.
    pub fn fail_next(&self, err: BackendError) {
        self.state.borrow_mut().scripted.push_back(err);
    }

    /// Apply the next `n` actions but report a network error to the caller.
    pub fn lose_responses(&self, n: usize) {
        self.state.borrow_mut().lost_responses = n;
    }

    pub fn reject_all(&self, message: &str) {
        self.state.borrow_mut().reject = Some(message.to_string());
    }

    pub fn accept_all(&self) {
        self.state.borrow_mut().reject = None;
    }

    pub fn calls(&self) -> Vec<ActionPayload> {
        self.state.borrow().calls.clone()
    }

    pub fn rows(&self, table: Table) -> Vec<CanonicalRow> {
        self.state
            .borrow()
            .tables
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: Table, id: &str) -> Option<CanonicalRow> {
        self.rows(table).into_iter().find(|r| r.id == id)
    }

    fn next_id(state: &mut State, prefix: &str) -> String {
        let id = format!("{prefix}-{}", state.next_id);
        state.next_id += 1;
        id
    }

    fn apply(state: &mut State, payload: &ActionPayload) -> Result<AppliedAction, BackendError> {
        let scope = payload.business_id.clone();
        let now = Utc::now();
        match &payload.action {
            Action::CreateOrder(create) => {
                let order_id = Self::next_id(state, "S");
                let mut records = vec![(
                    Table::Orders,
                    CanonicalRow {
                        id: order_id.clone(),
                        business_id: scope.clone(),
                        parent_id: None,
                        status: Some(create.order.status.as_str().to_string()),
                        created_at: now,
                        updated_at: now,
                        data: serde_json::to_value(&create.order)
                            .map_err(|e| BackendError::Rejected(e.to_string()))?,
                    },
                )];
                for item in &create.items {
                    let item = OrderItem {
                        order_id: order_id.clone(),
                        ..item.item.clone()
                    };
                    records.push((
                        Table::OrderItems,
                        CanonicalRow {
                            id: Self::next_id(state, "SI"),
                            business_id: scope.clone(),
                            parent_id: Some(order_id.clone()),
                            status: Some(item.item_status.as_str().to_string()),
                            created_at: now,
                            updated_at: now,
                            data: serde_json::to_value(&item)
                                .map_err(|e| BackendError::Rejected(e.to_string()))?,
                        },
                    ));
                }
                for (table, row) in &records {
                    state.tables.entry(*table).or_default().push(row.clone());
                }
                Ok(AppliedAction { records })
            }
            Action::UpdateOrderStatus {
                order_id,
                new_status,
            } => {
                let row = Self::update(state, Table::Orders, &scope, order_id, |row| {
                    row.status = Some(new_status.as_str().to_string());
                    row.data["status"] = json!(new_status.as_str());
                })?;
                Ok(AppliedAction {
                    records: vec![(Table::Orders, row)],
                })
            }
            Action::UpdateItemStatus {
                item_id,
                new_status,
                ..
            } => {
                let row = Self::update(state, Table::OrderItems, &scope, item_id, |row| {
                    row.status = Some(new_status.as_str().to_string());
                    row.data["item_status"] = json!(new_status.as_str());
                })?;
                Ok(AppliedAction {
                    records: vec![(Table::OrderItems, row)],
                })
            }
            Action::UpdateCustomer {
                order_id,
                customer_id,
                customer_name,
                customer_phone,
            } => {
                let row = Self::update(state, Table::Orders, &scope, order_id, |row| {
                    for (field, value) in [
                        ("customer_id", customer_id),
                        ("customer_name", customer_name),
                        ("customer_phone", customer_phone),
                    ] {
                        if let Some(value) = value {
                            row.data[field] = json!(value);
                        }
                    }
                })?;
                Ok(AppliedAction {
                    records: vec![(Table::Orders, row)],
                })
            }
            Action::ConfirmPayment {
                order_id,
                payment_method,
            } => {
                let row = Self::update(state, Table::Orders, &scope, order_id, |row| {
                    row.data["is_paid"] = json!(true);
                    row.data["payment_method"] = json!(payment_method);
                })?;
                Ok(AppliedAction {
                    records: vec![(Table::Orders, row)],
                })
            }
        }
    }

    fn update(
        state: &mut State,
        table: Table,
        scope: &str,
        id: &str,
        change: impl FnOnce(&mut CanonicalRow),
    ) -> Result<CanonicalRow, BackendError> {
        let row = state
            .tables
            .entry(table)
            .or_default()
            .iter_mut()
            .find(|r| r.id == id && r.business_id == scope)
            .ok_or_else(|| BackendError::Rejected(format!("unknown {table} {id}")))?;
        change(row);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

impl Backend for MockBackend {
    fn fetch_rows(&self, request: &FetchRequest) -> Result<Vec<CanonicalRow>, BackendError> {
        Ok(self
            .rows(request.table)
            .into_iter()
            .filter(|r| r.business_id == request.business_id)
            .filter(|r| request.window.is_none_or(|w| w.contains(r.created_at)))
            .take(request.limit)
            .collect())
    }

    fn apply_action(&self, payload: &ActionPayload) -> Result<AppliedAction, BackendError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(payload.clone());
        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(message) = &state.reject {
            return Err(BackendError::Rejected(message.clone()));
        }
        let cached = state.applied.get(&payload.idempotency_key).cloned();
        let applied = match cached {
            Some(done) => done,
            None => {
                let applied = Self::apply(&mut state, payload)?;
                state
                    .applied
                    .insert(payload.idempotency_key, applied.clone());
                applied
            }
        };
        if state.lost_responses > 0 {
            state.lost_responses -= 1;
            return Err(BackendError::Network("response lost".into()));
        }
        Ok(applied)
    }
}

pub fn order(status: OrderStatus) -> Order {
    Order {
        order_number: None,
        status,
        customer_id: None,
        customer_name: Some("Maya".into()),
        customer_phone: Some("0500000000".into()),
        total_amount: 46.0,
        order_type: "dine_in".into(),
        is_paid: false,
        payment_method: None,
    }
}

pub fn item(menu_item_id: &str) -> OrderItem {
    OrderItem {
        order_id: String::new(),
        menu_item_id: menu_item_id.to_string(),
        quantity: 1,
        price: 23.0,
        item_status: OrderStatus::InProgress,
        notes: None,
        mods: Value::Null,
    }
}

/// A canonical order row created `age_hours` ago.
pub fn canonical_order(id: &str, status: OrderStatus, age_hours: i64) -> CanonicalRow {
    let at = Utc::now() - Duration::hours(age_hours);
    let mut data = serde_json::to_value(order(status)).unwrap_or(Value::Null);
    data["order_number"] = json!(7);
    CanonicalRow {
        id: id.to_string(),
        business_id: SCOPE.to_string(),
        parent_id: None,
        status: Some(status.as_str().to_string()),
        created_at: at,
        updated_at: at,
        data,
    }
}

pub fn canonical_item(id: &str, order_id: &str) -> CanonicalRow {
    let now = Utc::now();
    let item = OrderItem {
        order_id: order_id.to_string(),
        ..item("menu-falafel")
    };
    CanonicalRow {
        id: id.to_string(),
        business_id: SCOPE.to_string(),
        parent_id: Some(order_id.to_string()),
        status: Some(item.item_status.as_str().to_string()),
        created_at: now,
        updated_at: now,
        data: serde_json::to_value(item).unwrap_or(Value::Null),
    }
}

pub fn local_orders(store: &LocalStore) -> Vec<LocalRecord> {
    store
        .query(Table::Orders, SCOPE, pos_sync::Query::All)
        .unwrap()
}
