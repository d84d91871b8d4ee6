use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;

/// Backend entities mirrored in the local store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Orders,
    OrderItems,
    MenuItems,
    Customers,
    LoyaltyCards,
    LoyaltyTransactions,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Orders,
        Table::OrderItems,
        Table::MenuItems,
        Table::Customers,
        Table::LoyaltyCards,
        Table::LoyaltyTransactions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
            Table::MenuItems => "menu_items",
            Table::Customers => "customers",
            Table::LoyaltyCards => "loyalty_cards",
            Table::LoyaltyTransactions => "loyalty_transactions",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(SyncError::State("unknown table"))
    }

    /// Child tables whose rows die with their parent.
    pub fn children(self) -> &'static [Table] {
        match self {
            Table::Orders => &[Table::OrderItems],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a mirrored row. The kind is persisted next to the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RecordKey {
    Local(String),
    Server(String),
}

impl RecordKey {
    /// Fresh client-side id for a provisional row.
    pub fn new_local() -> Self {
        RecordKey::Local(format!("L-{}", Uuid::new_v4().simple()))
    }

    pub fn id(&self) -> &str {
        match self {
            RecordKey::Local(id) | RecordKey::Server(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RecordKey::Local(_))
    }

    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            RecordKey::Local(_) => "local",
            RecordKey::Server(_) => "server",
        }
    }

    pub(crate) fn from_parts(kind: &str, id: String) -> Result<Self, SyncError> {
        match kind {
            "local" => Ok(RecordKey::Local(id)),
            "server" => Ok(RecordKey::Server(id)),
            _ => Err(SyncError::State("unknown key kind")),
        }
    }
}

/// A mirrored row. `T` is the entity payload; untyped rows use `Value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalRecord<T = Value> {
    pub key: RecordKey,
    pub business_id: String,
    /// Canonical id this row is linked to, set by confirmation or pull.
    pub server_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: Option<String>,
    pub pending_sync: bool,
    pub is_offline: bool,
    pub linked_action_id: Option<i64>,
    /// Set only by the drain's confirmation callback.
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: T,
}

impl<T: Entity> LocalRecord<T> {
    /// Provisional row written before the backend has seen it.
    pub fn provisional(business_id: &str, fields: T) -> Self {
        let now = Utc::now();
        Self {
            key: RecordKey::new_local(),
            business_id: business_id.to_string(),
            server_id: None,
            parent_id: fields.parent_id().map(str::to_string),
            status: fields.status().map(str::to_string),
            pending_sync: true,
            is_offline: true,
            linked_action_id: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
            fields,
        }
    }

    pub fn into_untyped(self) -> Result<LocalRecord, SyncError> {
        let fields = serde_json::to_value(&self.fields)?;
        Ok(LocalRecord {
            key: self.key,
            business_id: self.business_id,
            server_id: self.server_id,
            parent_id: self.parent_id,
            status: self.status,
            pending_sync: self.pending_sync,
            is_offline: self.is_offline,
            linked_action_id: self.linked_action_id,
            confirmed_at: self.confirmed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            fields,
        })
    }
}

impl LocalRecord {
    pub fn decode<T: Entity>(self) -> Result<LocalRecord<T>, SyncError> {
        let fields = serde_json::from_value(self.fields)?;
        Ok(LocalRecord {
            key: self.key,
            business_id: self.business_id,
            server_id: self.server_id,
            parent_id: self.parent_id,
            status: self.status,
            pending_sync: self.pending_sync,
            is_offline: self.is_offline,
            linked_action_id: self.linked_action_id,
            confirmed_at: self.confirmed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            fields,
        })
    }

    /// Row as written by a pull: server keyed, flags cleared.
    pub fn from_canonical(row: CanonicalRow) -> Self {
        Self {
            key: RecordKey::Server(row.id.clone()),
            business_id: row.business_id,
            server_id: Some(row.id),
            parent_id: row.parent_id,
            status: row.status,
            pending_sync: false,
            is_offline: false,
            linked_action_id: None,
            confirmed_at: None,
            created_at: row.created_at,
            updated_at: row.updated_at,
            fields: row.data,
        }
    }

    /// Overwrite the status column and the `status` field of the payload.
    pub fn set_status(&mut self, status: &str) {
        self.status = Some(status.to_string());
        if let Some(obj) = self.fields.as_object_mut() {
            obj.insert("status".to_string(), Value::String(status.to_string()));
        }
    }
}

/// Typed entity payload stored in one mirrored table.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    const TABLE: Table;

    fn parent_id(&self) -> Option<&str> {
        None
    }

    fn status(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Ready => "ready",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Status the order's items take when the order moves to `self`.
    pub fn item_status(self) -> OrderStatus {
        match self {
            OrderStatus::Completed => OrderStatus::Completed,
            OrderStatus::Ready => OrderStatus::Ready,
            _ => OrderStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_number: Option<i64>,
    pub status: OrderStatus,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub total_amount: f64,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default)]
    pub is_paid: bool,
    pub payment_method: Option<String>,
}

fn default_order_type() -> String {
    "dine_in".to_string()
}

impl Entity for Order {
    const TABLE: Table = Table::Orders;

    fn status(&self) -> Option<&str> {
        Some(self.status.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub order_id: String,
    pub menu_item_id: String,
    pub quantity: u32,
    pub price: f64,
    pub item_status: OrderStatus,
    pub notes: Option<String>,
    #[serde(default)]
    pub mods: Value,
}

impl Entity for OrderItem {
    const TABLE: Table = Table::OrderItems;

    fn parent_id(&self) -> Option<&str> {
        Some(&self.order_id)
    }

    fn status(&self) -> Option<&str> {
        Some(self.item_status.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MenuItem {
    pub name: String,
    pub category: Option<String>,
    pub price: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Entity for MenuItem {
    const TABLE: Table = Table::MenuItems;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub name: Option<String>,
    pub phone_number: Option<String>,
}

impl Entity for Customer {
    const TABLE: Table = Table::Customers;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoyaltyCard {
    pub customer_id: Option<String>,
    pub customer_phone: Option<String>,
    pub points_balance: i64,
}

impl Entity for LoyaltyCard {
    const TABLE: Table = Table::LoyaltyCards;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoyaltyTransaction {
    pub card_id: String,
    pub order_id: Option<String>,
    pub points: i64,
    pub transaction_type: String,
}

impl Entity for LoyaltyTransaction {
    const TABLE: Table = Table::LoyaltyTransactions;

    fn parent_id(&self) -> Option<&str> {
        Some(&self.card_id)
    }
}

/// Backend's authoritative version of a row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalRow {
    pub id: String,
    pub business_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: Value,
}

/// Half-open `[from, to)` range over `created_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn last_days(days: i64) -> Self {
        let to = Utc::now();
        Self {
            from: to - Duration::days(days),
            to,
        }
    }

    /// From the start of the current UTC day until now.
    pub fn today() -> Self {
        let to = Utc::now();
        let from = to
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(to);
        Self { from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}

/// Proof that the operator explicitly approved a destructive operation.
#[derive(Debug, Clone, Copy)]
pub struct UserConfirmed(());

impl UserConfirmed {
    pub fn acknowledge() -> Self {
        UserConfirmed(())
    }
}

/// Fixed-width timestamp text so SQL comparisons order chronologically.
pub(crate) fn ts_to_sql(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
