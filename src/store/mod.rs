//! Durable mirror of backend tables, one SQLite table per entity.
//!
//! Every write goes through [`LocalStore::with_tx`] so a table change is
//! atomic and subscribers are notified only after the commit.

pub mod schema;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::model::{Entity, LocalRecord, RecordKey, Table, TimeWindow, ts_from_sql, ts_to_sql};
use crate::outbox::{self, OutboxAction};

const ROW_COLUMNS: &str = "id, key_kind, business_id, server_id, parent_id, status, pending_sync, \
is_offline, linked_action_id, confirmed_at, created_at, updated_at, data";

/// Row filter; every query is additionally bound to one business scope.
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    All,
    CreatedIn(TimeWindow),
    Parent(&'a str),
    Status(&'a str),
    PendingSync,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatusRecord {
    pub table: Table,
    pub business_id: String,
    pub record_count: u64,
    pub last_synced_at: DateTime<Utc>,
}

/// Everything the store holds, for backup and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub exported_at: DateTime<Utc>,
    pub schema_version: i32,
    pub persistent: bool,
    pub tables: BTreeMap<Table, Vec<LocalRecord>>,
    pub outbox: Vec<OutboxAction>,
    pub sync_status: Vec<SyncStatusRecord>,
}

pub struct LocalStore {
    conn: Connection,
    persistent: bool,
    watchers: BTreeMap<Table, watch::Sender<u64>>,
}

impl LocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| SyncError::StorageUnavailable(format!("{}: {e}", path.display())))?;
        Self::from_connection(conn, true)
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        Self::from_connection(conn, false)
    }

    /// Open the durable store, or degrade to a session-only in-memory store.
    pub fn open_with_fallback(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        match Self::open(path.as_ref()) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "durable store unavailable, falling back to in-memory store"
                );
                Self::open_in_memory()
            }
        }
    }

    fn from_connection(conn: Connection, persistent: bool) -> Result<Self, SyncError> {
        schema::init_schema(&conn).map_err(|e| match e {
            SyncError::Sqlite(inner) => SyncError::StorageUnavailable(inner.to_string()),
            other => other,
        })?;
        let watchers = Table::ALL
            .into_iter()
            .map(|t| (t, watch::channel(0u64).0))
            .collect();
        Ok(Self {
            conn,
            persistent,
            watchers,
        })
    }

    /// False when running on the in-memory fallback.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Change counter for `table`, bumped after every committed write to it.
    pub fn subscribe(&self, table: Table) -> watch::Receiver<u64> {
        self.watchers[&table].subscribe()
    }

    pub fn schema_version(&self) -> Result<i32, SyncError> {
        schema::schema_version(&self.conn)
    }

    pub fn run_migrations(&self, target_version: i32) -> Result<(), SyncError> {
        schema::run_migrations(&self.conn, target_version)
    }

    /// Run `f` in one transaction. Subscribers of the tables it touched are
    /// notified after commit; an error rolls everything back.
    pub fn with_tx<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&StoreTx<'_>) -> Result<R, SyncError>,
    {
        let tx = StoreTx {
            tx: self.conn.unchecked_transaction()?,
            touched: RefCell::new(BTreeSet::new()),
        };
        let result = f(&tx)?;
        let touched = tx.touched.take();
        tx.tx.commit()?;
        for table in touched {
            self.watchers[&table].send_modify(|v| *v += 1);
        }
        Ok(result)
    }

    pub fn put(&self, table: Table, record: &LocalRecord) -> Result<(), SyncError> {
        self.with_tx(|tx| tx.put(table, record))
    }

    pub fn bulk_put(&self, table: Table, records: &[LocalRecord]) -> Result<usize, SyncError> {
        self.with_tx(|tx| {
            for record in records {
                tx.put(table, record)?;
            }
            Ok(records.len())
        })
    }

    pub fn put_record<T: Entity>(&self, record: &LocalRecord<T>) -> Result<(), SyncError> {
        let untyped = record.clone().into_untyped()?;
        self.put(T::TABLE, &untyped)
    }

    pub fn get(&self, table: Table, scope: &str, id: &str) -> Result<Option<LocalRecord>, SyncError> {
        get_row(&self.conn, table, scope, id)
    }

    pub fn get_record<T: Entity>(
        &self,
        scope: &str,
        id: &str,
    ) -> Result<Option<LocalRecord<T>>, SyncError> {
        self.get(T::TABLE, scope, id)?
            .map(LocalRecord::decode)
            .transpose()
    }

    pub fn query(
        &self,
        table: Table,
        scope: &str,
        query: Query<'_>,
    ) -> Result<Vec<LocalRecord>, SyncError> {
        query_rows(&self.conn, table, scope, query)
    }

    pub fn delete(&self, table: Table, scope: &str, id: &str) -> Result<bool, SyncError> {
        self.with_tx(|tx| tx.delete(table, scope, id))
    }

    /// Wipe every mirrored table, the outbox and bookkeeping. Used before a
    /// forced resync; callers gate it behind explicit confirmation.
    pub fn clear_all(&self) -> Result<(), SyncError> {
        self.with_tx(|tx| {
            for table in Table::ALL {
                tx.tx.execute(&format!("DELETE FROM {}", table.as_str()), [])?;
                tx.touch(table);
            }
            tx.tx.execute("DELETE FROM outbox_actions", [])?;
            tx.tx.execute("DELETE FROM sync_status", [])?;
            Ok(())
        })?;
        debug!("cleared all local data");
        Ok(())
    }

    pub fn sync_status(&self, scope: &str) -> Result<Vec<SyncStatusRecord>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name, business_id, record_count, last_synced_at
FROM sync_status
WHERE business_id=?1
ORDER BY table_name",
        )?;
        let rows = stmt.query_map(params![scope], read_sync_status)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn export_snapshot(&self) -> Result<Snapshot, SyncError> {
        let mut tables = BTreeMap::new();
        for table in Table::ALL {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM {} ORDER BY business_id, created_at, id",
                table.as_str()
            ))?;
            let rows = stmt.query_map([], read_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            tables.insert(table, out);
        }

        let mut stmt = self.conn.prepare(
            "SELECT table_name, business_id, record_count, last_synced_at
FROM sync_status ORDER BY business_id, table_name",
        )?;
        let mut sync_status = Vec::new();
        for row in stmt.query_map([], read_sync_status)? {
            sync_status.push(row??);
        }

        Ok(Snapshot {
            exported_at: Utc::now(),
            schema_version: self.schema_version()?,
            persistent: self.persistent,
            tables,
            outbox: outbox::load_all(&self.conn)?,
            sync_status,
        })
    }
}

/// Open write transaction; records which tables it touched.
pub struct StoreTx<'c> {
    tx: Transaction<'c>,
    touched: RefCell<BTreeSet<Table>>,
}

impl StoreTx<'_> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn touch(&self, table: Table) {
        self.touched.borrow_mut().insert(table);
    }

    /// Idempotent upsert by primary key. A key owned by another scope is refused.
    pub fn put(&self, table: Table, record: &LocalRecord) -> Result<(), SyncError> {
        let changed = self.tx.execute(
            &format!(
                "INSERT INTO {t} ({ROW_COLUMNS})
VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
ON CONFLICT(id) DO UPDATE SET
key_kind=excluded.key_kind,
server_id=excluded.server_id,
parent_id=excluded.parent_id,
status=excluded.status,
pending_sync=excluded.pending_sync,
is_offline=excluded.is_offline,
linked_action_id=excluded.linked_action_id,
confirmed_at=excluded.confirmed_at,
created_at=excluded.created_at,
updated_at=excluded.updated_at,
data=excluded.data
WHERE {t}.business_id=excluded.business_id",
                t = table.as_str()
            ),
            params![
                record.key.id(),
                record.key.kind_str(),
                record.business_id,
                record.server_id,
                record.parent_id,
                record.status,
                record.pending_sync,
                record.is_offline,
                record.linked_action_id,
                record.confirmed_at.as_ref().map(ts_to_sql),
                ts_to_sql(&record.created_at),
                ts_to_sql(&record.updated_at),
                record.fields.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::State("row key belongs to another business scope"));
        }
        self.touch(table);
        Ok(())
    }

    pub fn get(&self, table: Table, scope: &str, id: &str) -> Result<Option<LocalRecord>, SyncError> {
        get_row(&self.tx, table, scope, id)
    }

    pub fn query(
        &self,
        table: Table,
        scope: &str,
        query: Query<'_>,
    ) -> Result<Vec<LocalRecord>, SyncError> {
        query_rows(&self.tx, table, scope, query)
    }

    pub fn delete(&self, table: Table, scope: &str, id: &str) -> Result<bool, SyncError> {
        let n = self.tx.execute(
            &format!(
                "DELETE FROM {} WHERE business_id=?1 AND id=?2",
                table.as_str()
            ),
            params![scope, id],
        )?;
        if n > 0 {
            self.touch(table);
        }
        Ok(n > 0)
    }

    /// Delete a row and the rows of its child tables; returns `(row, children)` counts.
    pub fn delete_cascade(
        &self,
        table: Table,
        scope: &str,
        id: &str,
    ) -> Result<(usize, usize), SyncError> {
        let mut children = 0;
        for child in table.children() {
            let n = self.tx.execute(
                &format!(
                    "DELETE FROM {} WHERE business_id=?1 AND parent_id=?2",
                    child.as_str()
                ),
                params![scope, id],
            )?;
            if n > 0 {
                self.touch(*child);
            }
            children += n;
        }
        let deleted = usize::from(self.delete(table, scope, id)?);
        Ok((deleted, children))
    }

    /// Clear offline flags without touching the payload.
    pub fn clear_flags(&self, table: Table, scope: &str, id: &str) -> Result<bool, SyncError> {
        let n = self.tx.execute(
            &format!(
                "UPDATE {} SET pending_sync=0, is_offline=0
WHERE business_id=?1 AND id=?2 AND (pending_sync=1 OR is_offline=1)",
                table.as_str()
            ),
            params![scope, id],
        )?;
        if n > 0 {
            self.touch(table);
        }
        Ok(n > 0)
    }

    /// Refresh the bookkeeping row for `(table, scope)`.
    pub fn record_sync(&self, table: Table, scope: &str) -> Result<SyncStatusRecord, SyncError> {
        let count: i64 = self.tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE business_id=?1",
                table.as_str()
            ),
            params![scope],
            |r| r.get(0),
        )?;
        let now = Utc::now();
        self.tx.execute(
            "INSERT INTO sync_status(table_name, business_id, record_count, last_synced_at)
VALUES (?1,?2,?3,?4)
ON CONFLICT(table_name, business_id) DO UPDATE SET
record_count=excluded.record_count, last_synced_at=excluded.last_synced_at",
            params![table.as_str(), scope, count, ts_to_sql(&now)],
        )?;
        Ok(SyncStatusRecord {
            table,
            business_id: scope.to_string(),
            record_count: u64::try_from(count).unwrap_or(0),
            last_synced_at: now,
        })
    }
}

fn get_row(
    conn: &Connection,
    table: Table,
    scope: &str,
    id: &str,
) -> Result<Option<LocalRecord>, SyncError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {ROW_COLUMNS} FROM {} WHERE business_id=?1 AND id=?2",
                table.as_str()
            ),
            params![scope, id],
            read_record,
        )
        .optional()?;
    Ok(row)
}

fn query_rows(
    conn: &Connection,
    table: Table,
    scope: &str,
    query: Query<'_>,
) -> Result<Vec<LocalRecord>, SyncError> {
    let t = table.as_str();
    let base = format!("SELECT {ROW_COLUMNS} FROM {t} WHERE business_id=?1");
    let order = "ORDER BY created_at ASC, id ASC";
    let mut out = Vec::new();
    match query {
        Query::All => {
            let mut stmt = conn.prepare(&format!("{base} {order}"))?;
            for row in stmt.query_map(params![scope], read_record)? {
                out.push(row?);
            }
        }
        Query::CreatedIn(window) => {
            let mut stmt =
                conn.prepare(&format!("{base} AND created_at>=?2 AND created_at<?3 {order}"))?;
            let rows = stmt.query_map(
                params![scope, ts_to_sql(&window.from), ts_to_sql(&window.to)],
                read_record,
            )?;
            for row in rows {
                out.push(row?);
            }
        }
        Query::Parent(parent) => {
            let mut stmt = conn.prepare(&format!("{base} AND parent_id=?2 {order}"))?;
            for row in stmt.query_map(params![scope, parent], read_record)? {
                out.push(row?);
            }
        }
        Query::Status(status) => {
            let mut stmt = conn.prepare(&format!("{base} AND status=?2 {order}"))?;
            for row in stmt.query_map(params![scope, status], read_record)? {
                out.push(row?);
            }
        }
        Query::PendingSync => {
            let mut stmt =
                conn.prepare(&format!("{base} AND (pending_sync=1 OR is_offline=1) {order}"))?;
            for row in stmt.query_map(params![scope], read_record)? {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

fn read_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<LocalRecord> {
    let id: String = r.get(0)?;
    let kind: String = r.get(1)?;
    let key = RecordKey::from_parts(&kind, id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let confirmed_at: Option<String> = r.get(9)?;
    let created_at: String = r.get(10)?;
    let updated_at: String = r.get(11)?;
    let data: String = r.get(12)?;
    Ok(LocalRecord {
        key,
        business_id: r.get(2)?,
        server_id: r.get(3)?,
        parent_id: r.get(4)?,
        status: r.get(5)?,
        pending_sync: r.get(6)?,
        is_offline: r.get(7)?,
        linked_action_id: r.get(8)?,
        confirmed_at: confirmed_at
            .map(|s| ts_from_sql(9, &s))
            .transpose()?,
        created_at: ts_from_sql(10, &created_at)?,
        updated_at: ts_from_sql(11, &updated_at)?,
        fields: serde_json::from_str(&data).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

fn read_sync_status(
    r: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<SyncStatusRecord, SyncError>> {
    let table: String = r.get(0)?;
    let business_id: String = r.get(1)?;
    let count: i64 = r.get(2)?;
    let last: String = r.get(3)?;
    let last_synced_at = ts_from_sql(3, &last)?;
    Ok(Table::parse(&table).map(|table| SyncStatusRecord {
        table,
        business_id,
        record_count: u64::try_from(count).unwrap_or(0),
        last_synced_at,
    }))
}
