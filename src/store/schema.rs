use chrono::Utc;
use rusqlite::{Connection, params};

use crate::error::SyncError;
use crate::model::{Table, ts_to_sql};

pub const SCHEMA_VERSION: i32 = 2;

/// Stepwise upgrades applied by `run_migrations`, keyed by the version they produce.
const MIGRATIONS: &[(i32, &str)] = &[(
    2,
    "CREATE INDEX IF NOT EXISTS idx_outbox_scope_status
ON outbox_actions(business_id, status, action_id);",
)];

/// Create the version log, outbox, bookkeeping and mirrored tables, then
/// migrate to [`SCHEMA_VERSION`]. Idempotent.
pub fn init_schema(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA busy_timeout=5000;

CREATE TABLE IF NOT EXISTS schema_version (
version INTEGER PRIMARY KEY,
applied_at TEXT NOT NULL
);
INSERT OR IGNORE INTO schema_version(version, applied_at)
VALUES (1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));

CREATE TABLE IF NOT EXISTS outbox_actions (
action_id INTEGER PRIMARY KEY AUTOINCREMENT,
idempotency_key TEXT NOT NULL UNIQUE,
business_id TEXT NOT NULL,
action_type TEXT NOT NULL,
order_ref TEXT,
payload TEXT NOT NULL, -- JSON ActionPayload
status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','in_flight','completed','failed')),
attempts INTEGER NOT NULL DEFAULT 0,
last_error TEXT,
created_at TEXT NOT NULL,
updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_status
ON outbox_actions(status, action_id);

CREATE INDEX IF NOT EXISTS idx_outbox_order_ref
ON outbox_actions(business_id, order_ref);

CREATE TABLE IF NOT EXISTS sync_status (
table_name TEXT NOT NULL,
business_id TEXT NOT NULL,
record_count INTEGER NOT NULL,
last_synced_at TEXT NOT NULL,
PRIMARY KEY(table_name, business_id)
);
"#,
    )?;
    for table in Table::ALL {
        conn.execute_batch(&mirrored_table_sql(table))?;
    }
    run_migrations(conn, SCHEMA_VERSION)
}

fn mirrored_table_sql(table: Table) -> String {
    let t = table.as_str();
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {t} (
id TEXT PRIMARY KEY,
key_kind TEXT NOT NULL CHECK(key_kind IN ('local','server')),
business_id TEXT NOT NULL,
server_id TEXT,
parent_id TEXT,
status TEXT,
pending_sync INTEGER NOT NULL DEFAULT 0,
is_offline INTEGER NOT NULL DEFAULT 0,
linked_action_id INTEGER,
confirmed_at TEXT,
created_at TEXT NOT NULL,
updated_at TEXT NOT NULL,
data TEXT NOT NULL -- JSON entity fields
);

CREATE INDEX IF NOT EXISTS idx_{t}_scope_created
ON {t}(business_id, created_at);

CREATE INDEX IF NOT EXISTS idx_{t}_parent
ON {t}(business_id, parent_id);

CREATE INDEX IF NOT EXISTS idx_{t}_server
ON {t}(server_id);
"#
    )
}

/// Highest version recorded in the version log.
pub fn schema_version(conn: &Connection) -> Result<i32, SyncError> {
    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))?;
    Ok(version.unwrap_or(1))
}

/// Apply every pending migration up to `target_version` in one transaction.
pub fn run_migrations(conn: &Connection, target_version: i32) -> Result<(), SyncError> {
    if !(1..=SCHEMA_VERSION).contains(&target_version) {
        return Err(SyncError::State("invalid target_version"));
    }
    let current = schema_version(conn)?;
    if current >= target_version {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for (version, sql) in MIGRATIONS {
        if *version > current && *version <= target_version {
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_version(version, applied_at) VALUES (?1, ?2)",
                params![version, ts_to_sql(&Utc::now())],
            )?;
            tracing::debug!(version, "applied schema migration");
        }
    }
    tx.commit()?;
    Ok(())
}
