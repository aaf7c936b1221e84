//! `SQLite` reconciliation action queue.

use super::connection::{acquire_lock, open_connection, open_in_memory, with_transaction};
use super::{from_millis, to_millis};
use crate::models::{ActionType, CustomerId, SuspicionAction};
use crate::storage::traits::ActionQueue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use std::path::Path;
use std::sync::Mutex;

/// `SQLite`-backed [`ActionQueue`].
pub struct SqliteActionQueue {
    conn: Mutex<Connection>,
}

impl SqliteActionQueue {
    /// Opens (or creates) the queue at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(open_connection(path.as_ref())?)
    }

    /// Creates an in-memory queue (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS suspicion_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                customer_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                date INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_suspicion_actions_date
                ON suspicion_actions(date, id);
            ",
        )
        .map_err(|e| Error::operation("initialize_action_schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_action(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl ActionQueue for SqliteActionQueue {
    fn enqueue(
        &self,
        customer_id: &CustomerId,
        action_type: ActionType,
        date: DateTime<Utc>,
    ) -> Result<SuspicionAction> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT INTO suspicion_actions (customer_id, action_type, date) VALUES (?1, ?2, ?3)",
            params![customer_id.as_str(), action_type.as_str(), to_millis(date)],
        )
        .map_err(|e| Error::operation("enqueue_action", e))?;
        Ok(SuspicionAction {
            id: conn.last_insert_rowid(),
            customer_id: customer_id.clone(),
            action_type,
            date,
        })
    }

    fn fetch_batch(&self, limit: usize) -> Result<Vec<SuspicionAction>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT id, customer_id, action_type, date FROM suspicion_actions \
                 ORDER BY date, id LIMIT ?1",
            )
            .map_err(|e| Error::operation("fetch_actions", e))?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], read_action)
            .map_err(|e| Error::operation("fetch_actions", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::operation("fetch_actions", e))?;

        let mut actions = Vec::with_capacity(rows.len());
        for (id, customer_id, action_type, date) in rows {
            match ActionType::parse(&action_type) {
                Ok(action_type) => actions.push(SuspicionAction {
                    id,
                    customer_id: CustomerId::new(customer_id),
                    action_type,
                    date: from_millis(date),
                }),
                Err(e) => {
                    tracing::warn!(action_id = id, error = %e, "Skipping unreadable action");
                },
            }
        }
        Ok(actions)
    }

    fn delete_batch(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = acquire_lock(&self.conn);
        with_transaction(&conn, "delete_actions", |conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM suspicion_actions WHERE id = ?1")
                .map_err(|e| Error::operation("delete_actions", e))?;
            let mut deleted = 0;
            for id in ids {
                deleted += stmt
                    .execute(params![id])
                    .map_err(|e| Error::operation("delete_actions", e))?;
            }
            Ok(deleted)
        })
    }

    fn count(&self) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM suspicion_actions", [], |row| row.get(0))
            .map_err(|e| Error::operation("count_actions", e))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
