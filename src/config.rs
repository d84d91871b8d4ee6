use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;
use crate::model::Table;

/// Runtime knobs for the engine. Every field has a default so a partial
/// document (or none at all) is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub database_path: Option<PathBuf>,
    pub outbox: OutboxConfig,
    pub pull: PullConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Attempts after which a failed action is left for manual resolution.
    pub max_attempts: u32,
    pub purge_completed_after_drain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullConfig {
    pub order_window_days: i64,
    pub batch_size: usize,
    pub mirrored_tables: Vec<Table>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            purge_completed_after_drain: false,
        }
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            order_window_days: 30,
            batch_size: 1000,
            mirrored_tables: vec![
                Table::MenuItems,
                Table::Customers,
                Table::LoyaltyCards,
                Table::LoyaltyTransactions,
            ],
        }
    }
}

#[derive(Deserialize)]
struct OutboxSection {
    max_attempts: Option<u32>,
    purge_completed_after_drain: Option<bool>,
}

#[derive(Deserialize)]
struct PullSection {
    order_window_days: Option<i64>,
    batch_size: Option<usize>,
    mirrored_tables: Option<Vec<Table>>,
}

impl EngineConfig {
    pub fn from_json(value: &Value) -> Result<Self, SyncError> {
        let database_path = value
            .get("database_path")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        let outbox = OutboxConfig::from_json(value)?;
        let pull = PullConfig::from_json(value)?;
        let config = Self {
            database_path,
            outbox,
            pull,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::StorageUnavailable(format!("config: {e}")))?;
        let value: Value = serde_json::from_str(&raw)?;
        Self::from_json(&value)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.outbox.max_attempts == 0 {
            return Err(SyncError::State("outbox.max_attempts must be at least 1"));
        }
        if self.pull.order_window_days <= 0 {
            return Err(SyncError::State("pull.order_window_days must be positive"));
        }
        if self.pull.batch_size == 0 {
            return Err(SyncError::State("pull.batch_size must be positive"));
        }
        if self
            .pull
            .mirrored_tables
            .iter()
            .any(|t| matches!(t, Table::Orders | Table::OrderItems))
        {
            return Err(SyncError::State(
                "orders are pulled through sync_orders, not mirrored_tables",
            ));
        }
        Ok(())
    }
}

impl OutboxConfig {
    fn from_json(value: &Value) -> Result<Self, SyncError> {
        let defaults = Self::default();
        let Some(section) = value.get("outbox") else {
            return Ok(defaults);
        };
        let section: OutboxSection = serde_json::from_value(section.clone())?;
        Ok(Self {
            max_attempts: section.max_attempts.unwrap_or(defaults.max_attempts),
            purge_completed_after_drain: section
                .purge_completed_after_drain
                .unwrap_or(defaults.purge_completed_after_drain),
        })
    }
}

impl PullConfig {
    fn from_json(value: &Value) -> Result<Self, SyncError> {
        let defaults = Self::default();
        let Some(section) = value.get("pull") else {
            return Ok(defaults);
        };
        let section: PullSection = serde_json::from_value(section.clone())?;
        Ok(Self {
            order_window_days: section
                .order_window_days
                .unwrap_or(defaults.order_window_days),
            batch_size: section.batch_size.unwrap_or(defaults.batch_size),
            mirrored_tables: section.mirrored_tables.unwrap_or(defaults.mirrored_tables),
        })
    }
}
