//! Shared connection handling for `SQLite` backends.

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Acquires a mutex, recovering the inner value if a previous holder panicked.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("dedup_sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Applies WAL journaling, NORMAL synchronous mode, a 5 second busy timeout
/// and foreign key enforcement.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if foreign keys cannot be enabled.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, so failures here are tolerated
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| Error::operation("enable_foreign_keys", e))
}

/// Opens and configures a database file, creating parent directories.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the file cannot be opened.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::operation("create_db_dir", e))?;
    }
    let conn = Connection::open(path).map_err(|e| Error::operation("open_sqlite", e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Opens and configures an in-memory database.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the database cannot be created.
pub fn open_in_memory() -> Result<Connection> {
    let conn =
        Connection::open_in_memory().map_err(|e| Error::operation("open_sqlite_memory", e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Runs `f` inside an immediate transaction.
///
/// The transaction is committed when `f` succeeds and rolled back otherwise,
/// so a failing mutation leaves no partial state behind.
///
/// # Errors
///
/// Returns the error produced by `f`, or [`Error::OperationFailed`] if the
/// transaction cannot be started or committed.
pub fn with_transaction<T>(
    conn: &Connection,
    operation: &'static str,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute("BEGIN IMMEDIATE", [])
        .map_err(|e| Error::operation(operation, format!("begin: {e}")))?;

    match f(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", []) {
                let _ = conn.execute("ROLLBACK", []);
                return Err(Error::operation(operation, format!("commit: {e}")));
            }
            Ok(value)
        },
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        },
    }
}

/// Returns true if the error is a `UNIQUE` or primary key violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_lock_concurrent() {
        let mutex = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    *acquire_lock(&mutex) += 1;
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        assert_eq!(*acquire_lock(&mutex), 10);
    }

    #[test]
    fn test_acquire_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().expect("lock");
            panic!("poison the mutex");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*acquire_lock(&mutex), 1);
    }

    #[test]
    fn test_configure_connection_pragmas() {
        let conn = open_in_memory().expect("open");

        let synchronous: i32 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .expect("synchronous");
        assert_eq!(synchronous, 1);

        let busy_timeout: i32 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(busy_timeout, 5000);

        let foreign_keys: i32 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("foreign_keys");
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let conn = open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (v INTEGER)").expect("schema");

        let result: Result<()> = with_transaction(&conn, "test", |c| {
            c.execute("INSERT INTO t (v) VALUES (1)", [])
                .map_err(|e| Error::operation("insert", e))?;
            Err(Error::Conflict("abort".to_string()))
        });
        assert!(matches!(result, Err(Error::Conflict(_))));

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE t (v INTEGER UNIQUE)")
            .expect("schema");
        conn.execute("INSERT INTO t (v) VALUES (1)", []).expect("first");
        let err = conn
            .execute("INSERT INTO t (v) VALUES (1)", [])
            .expect_err("duplicate");
        assert!(is_unique_violation(&err));
    }
}
