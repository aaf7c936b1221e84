//! `SQLite` suspicion store.
//!
//! Suspicions live in `suspicions`, with their member sets in
//! `suspicion_members` so that "every suspicion referencing X" is an indexed
//! lookup. Exclusions are stored as ordered pairs in `exclusions`.

use super::connection::{
    acquire_lock, is_unique_violation, open_connection, open_in_memory, with_transaction,
};
use super::metrics::observe;
use super::{from_millis, to_millis};
use crate::models::{
    AuthorType, CustomerId, Exclusion, RequestAuthor, SuspicionId, SuspicionLock,
    SuspiciousIdentity,
};
use crate::storage::traits::SuspicionBackend;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;

const STORE: &str = "suspicions";

const SELECT_COLUMNS: &str = "SELECT id, customer_id, duplicate_customer_id, rule_code, \
     creation_date, last_update_date, metadata, locked, lock_end_date, lock_author_name, \
     lock_author_type FROM suspicions";

/// `SQLite`-backed [`SuspicionBackend`].
pub struct SqliteSuspicionBackend {
    conn: Mutex<Connection>,
}

impl SqliteSuspicionBackend {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(open_connection(path.as_ref())?)
    }

    /// Creates an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS suspicions (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            duplicate_customer_id TEXT NOT NULL DEFAULT '',
            rule_code TEXT NOT NULL,
            creation_date INTEGER NOT NULL,
            last_update_date INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            locked INTEGER NOT NULL DEFAULT 0,
            lock_end_date INTEGER,
            lock_author_name TEXT,
            lock_author_type TEXT,
            UNIQUE(customer_id, duplicate_customer_id, rule_code)
        );

        CREATE INDEX IF NOT EXISTS idx_suspicions_rule
            ON suspicions(rule_code, creation_date);

        CREATE TABLE IF NOT EXISTS suspicion_members (
            suspicion_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            PRIMARY KEY (suspicion_id, customer_id),
            FOREIGN KEY (suspicion_id) REFERENCES suspicions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_suspicion_members_customer
            ON suspicion_members(customer_id);

        CREATE TABLE IF NOT EXISTS exclusions (
            first_customer_id TEXT NOT NULL,
            second_customer_id TEXT NOT NULL,
            author_name TEXT NOT NULL,
            author_type TEXT NOT NULL,
            date INTEGER NOT NULL,
            PRIMARY KEY (first_customer_id, second_customer_id)
        );

        CREATE INDEX IF NOT EXISTS idx_exclusions_second
            ON exclusions(second_customer_id);
        ",
    )
    .map_err(|e| Error::operation("initialize_suspicion_schema", e))
}

fn sql_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |e| Error::operation(operation, e)
}

/// Maps a row to a suspicion without its members.
fn read_row(row: &Row<'_>) -> rusqlite::Result<SuspiciousIdentity> {
    let duplicate: String = row.get(2)?;
    let metadata: String = row.get(6)?;
    let author_type: Option<String> = row.get(10)?;
    let lock_end: Option<i64> = row.get(8)?;

    Ok(SuspiciousIdentity {
        id: SuspicionId::new(row.get::<_, String>(0)?),
        customer_id: CustomerId::new(row.get::<_, String>(1)?),
        duplicate_customer_id: (!duplicate.is_empty()).then(|| CustomerId::new(duplicate)),
        members: BTreeSet::new(),
        rule_code: row.get(3)?,
        creation_date: from_millis(row.get(4)?),
        last_update_date: from_millis(row.get(5)?),
        metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata).unwrap_or_default(),
        lock: SuspicionLock {
            locked: row.get::<_, i64>(7)? != 0,
            lock_end_date: lock_end.map(from_millis),
            author_name: row.get(9)?,
            author_type: author_type.as_deref().and_then(AuthorType::parse),
        },
    })
}

fn load_members(conn: &Connection, suspicion: &mut SuspiciousIdentity) -> Result<()> {
    let mut stmt = conn
        .prepare_cached("SELECT customer_id FROM suspicion_members WHERE suspicion_id = ?1")
        .map_err(sql_error("load_members"))?;
    let rows = stmt
        .query_map(params![suspicion.id.as_str()], |row| row.get::<_, String>(0))
        .map_err(sql_error("load_members"))?;
    for id in rows {
        suspicion
            .members
            .insert(CustomerId::new(id.map_err(sql_error("load_members"))?));
    }
    Ok(())
}

fn query_suspicions(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<SuspiciousIdentity>> {
    let mut stmt = conn.prepare(sql).map_err(sql_error(operation))?;
    let mut suspicions = stmt
        .query_map(params, read_row)
        .map_err(sql_error(operation))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error(operation))?;
    for suspicion in &mut suspicions {
        load_members(conn, suspicion)?;
    }
    Ok(suspicions)
}

fn get_inner(conn: &Connection, id: &SuspicionId) -> Result<Option<SuspiciousIdentity>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let found = conn
        .query_row(&sql, params![id.as_str()], read_row)
        .optional()
        .map_err(sql_error("get_suspicion"))?;
    match found {
        Some(mut suspicion) => {
            load_members(conn, &mut suspicion)?;
            Ok(Some(suspicion))
        },
        None => Ok(None),
    }
}

fn insert_inner(conn: &Connection, suspicion: &SuspiciousIdentity) -> Result<()> {
    let metadata = serde_json::to_string(&suspicion.metadata)
        .map_err(|e| Error::operation("serialize_metadata", e))?;
    let duplicate = suspicion
        .duplicate_customer_id
        .as_ref()
        .map_or("", CustomerId::as_str);

    with_transaction(conn, "insert_suspicion", |conn| {
        conn.execute(
            "INSERT INTO suspicions (id, customer_id, duplicate_customer_id, rule_code, \
             creation_date, last_update_date, metadata, locked, lock_end_date, \
             lock_author_name, lock_author_type) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                suspicion.id.as_str(),
                suspicion.customer_id.as_str(),
                duplicate,
                suspicion.rule_code,
                to_millis(suspicion.creation_date),
                to_millis(suspicion.last_update_date),
                metadata,
                i64::from(suspicion.lock.locked),
                suspicion.lock.lock_end_date.map(to_millis),
                suspicion.lock.author_name,
                suspicion.lock.author_type.map(AuthorType::as_str),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!(
                    "suspicion ({}, {duplicate}, {}) already exists",
                    suspicion.customer_id, suspicion.rule_code
                ))
            } else {
                Error::operation("insert_suspicion", e)
            }
        })?;

        let mut stmt = conn
            .prepare_cached(
                "INSERT OR IGNORE INTO suspicion_members (suspicion_id, customer_id) \
                 VALUES (?1, ?2)",
            )
            .map_err(sql_error("insert_members"))?;
        stmt.execute(params![suspicion.id.as_str(), suspicion.customer_id.as_str()])
            .map_err(sql_error("insert_members"))?;
        for member in &suspicion.members {
            stmt.execute(params![suspicion.id.as_str(), member.as_str()])
                .map_err(sql_error("insert_members"))?;
        }
        Ok(())
    })
}

/// Condition under which `author` may take or release a lock.
const LOCK_AVAILABLE: &str = "(locked = 0 \
     OR (lock_end_date IS NOT NULL AND lock_end_date <= ?2) \
     OR (lock_author_name = ?3 AND lock_author_type = ?4))";

fn change_lock(
    conn: &Connection,
    operation: &'static str,
    id: &SuspicionId,
    author: &RequestAuthor,
    lock_end_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    with_transaction(conn, operation, |conn| {
        let changed = if let Some(end) = lock_end_date {
            conn.execute(
                &format!(
                    "UPDATE suspicions SET locked = 1, lock_end_date = ?5, \
                     lock_author_name = ?3, lock_author_type = ?4, last_update_date = ?2 \
                     WHERE id = ?1 AND {LOCK_AVAILABLE}"
                ),
                params![
                    id.as_str(),
                    to_millis(now),
                    author.name,
                    author.author_type.as_str(),
                    to_millis(end),
                ],
            )
        } else {
            conn.execute(
                &format!(
                    "UPDATE suspicions SET locked = 0, lock_end_date = NULL, \
                     lock_author_name = NULL, lock_author_type = NULL, last_update_date = ?2 \
                     WHERE id = ?1 AND {LOCK_AVAILABLE}"
                ),
                params![
                    id.as_str(),
                    to_millis(now),
                    author.name,
                    author.author_type.as_str(),
                ],
            )
        }
        .map_err(sql_error(operation))?;

        if changed > 0 {
            return Ok(true);
        }

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM suspicions WHERE id = ?1)",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(sql_error(operation))?;
        if exists {
            Ok(false)
        } else {
            Err(Error::not_found("suspicion", id.as_str()))
        }
    })
}

fn read_exclusion(row: &Row<'_>) -> rusqlite::Result<Exclusion> {
    let author_type: String = row.get(3)?;
    Ok(Exclusion {
        first: CustomerId::new(row.get::<_, String>(0)?),
        second: CustomerId::new(row.get::<_, String>(1)?),
        author: RequestAuthor::new(
            row.get::<_, String>(2)?,
            AuthorType::parse(&author_type).unwrap_or(AuthorType::Application),
        ),
        date: from_millis(row.get(4)?),
    })
}

fn to_sql_limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl SuspicionBackend for SqliteSuspicionBackend {
    #[instrument(
        name = "identity_dedup.storage.suspicion.insert",
        skip(self, suspicion),
        fields(suspicion_id = %suspicion.id, rule_code = %suspicion.rule_code)
    )]
    fn insert(&self, suspicion: &SuspiciousIdentity) -> Result<()> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        observe(STORE, "insert", start, insert_inner(&conn, suspicion))
    }

    fn get(&self, id: &SuspicionId) -> Result<Option<SuspiciousIdentity>> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        observe(STORE, "get", start, get_inner(&conn, id))
    }

    fn exists(
        &self,
        customer_id: &CustomerId,
        duplicate_customer_id: Option<&CustomerId>,
        rule_code: &str,
    ) -> Result<bool> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM suspicions WHERE customer_id = ?1 \
             AND duplicate_customer_id = ?2 AND rule_code = ?3)",
            params![
                customer_id.as_str(),
                duplicate_customer_id.map_or("", CustomerId::as_str),
                rule_code
            ],
            |row| row.get(0),
        )
        .map_err(sql_error("suspicion_exists"))
    }

    fn find_by_members(
        &self,
        rule_code: &str,
        members: &BTreeSet<CustomerId>,
    ) -> Result<Option<SuspiciousIdentity>> {
        let Some(first) = members.first() else {
            return Ok(None);
        };
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let sql = format!(
            "{SELECT_COLUMNS} WHERE rule_code = ?1 \
             AND id IN (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?2) \
             AND (SELECT COUNT(*) FROM suspicion_members m WHERE m.suspicion_id = suspicions.id) = ?3"
        );
        let result = query_suspicions(
            &conn,
            "find_by_members",
            &sql,
            params![rule_code, first.as_str(), to_sql_limit(members.len())],
        )
        .map(|found| found.into_iter().find(|s| s.members == *members));
        observe(STORE, "find_by_members", start, result)
    }

    fn find_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<SuspiciousIdentity>> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let sql = format!(
            "{SELECT_COLUMNS} WHERE id IN \
             (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?1) \
             ORDER BY creation_date, id"
        );
        let result = query_suspicions(
            &conn,
            "find_by_customer",
            &sql,
            params![customer_id.as_str()],
        );
        observe(STORE, "find_by_customer", start, result)
    }

    fn find_by_rule(
        &self,
        rule_code: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SuspiciousIdentity>> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let sql = format!(
            "{SELECT_COLUMNS} WHERE rule_code = ?1 ORDER BY creation_date, id LIMIT ?2 OFFSET ?3"
        );
        let result = query_suspicions(
            &conn,
            "find_by_rule",
            &sql,
            params![rule_code, to_sql_limit(limit), to_sql_limit(offset)],
        );
        observe(STORE, "find_by_rule", start, result)
    }

    fn list(&self, offset: usize, limit: usize) -> Result<Vec<SuspiciousIdentity>> {
        let conn = acquire_lock(&self.conn);
        let sql = format!("{SELECT_COLUMNS} ORDER BY creation_date, id LIMIT ?1 OFFSET ?2");
        query_suspicions(
            &conn,
            "list_suspicions",
            &sql,
            params![to_sql_limit(limit), to_sql_limit(offset)],
        )
    }

    fn count_by_rule(&self, rule_code: &str) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM suspicions WHERE rule_code = ?1",
                params![rule_code],
                |row| row.get(0),
            )
            .map_err(sql_error("count_by_rule"))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn suspicious_customer_ids(&self, rule_code: &str) -> Result<HashSet<CustomerId>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT m.customer_id FROM suspicion_members m \
                 JOIN suspicions s ON s.id = m.suspicion_id WHERE s.rule_code = ?1",
            )
            .map_err(sql_error("suspicious_customer_ids"))?;
        let ids = stmt
            .query_map(params![rule_code], |row| row.get::<_, String>(0))
            .map_err(sql_error("suspicious_customer_ids"))?
            .map(|id| id.map(CustomerId::new))
            .collect::<rusqlite::Result<HashSet<_>>>()
            .map_err(sql_error("suspicious_customer_ids"))?;
        Ok(ids)
    }

    #[instrument(
        name = "identity_dedup.storage.suspicion.delete",
        skip(self),
        fields(suspicion_id = %id)
    )]
    fn delete(&self, id: &SuspicionId) -> Result<bool> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = conn
            .execute("DELETE FROM suspicions WHERE id = ?1", params![id.as_str()])
            .map(|n| n > 0)
            .map_err(sql_error("delete_suspicion"));
        observe(STORE, "delete", start, result)
    }

    #[instrument(
        name = "identity_dedup.storage.suspicion.delete_by_customer",
        skip(self),
        fields(customer_id = %customer_id)
    )]
    fn delete_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<SuspiciousIdentity>> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = with_transaction(&conn, "delete_by_customer", |conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE id IN \
                 (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?1)"
            );
            let removed =
                query_suspicions(conn, "delete_by_customer", &sql, params![customer_id.as_str()])?;
            conn.execute(
                "DELETE FROM suspicions WHERE id IN \
                 (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?1)",
                params![customer_id.as_str()],
            )
            .map_err(sql_error("delete_by_customer"))?;
            Ok(removed)
        });
        observe(STORE, "delete_by_customer", start, result)
    }

    fn delete_linking(&self, first: &CustomerId, second: &CustomerId) -> Result<usize> {
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "DELETE FROM suspicions \
             WHERE id IN (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?1) \
             AND id IN (SELECT suspicion_id FROM suspicion_members WHERE customer_id = ?2)",
            params![first.as_str(), second.as_str()],
        )
        .map_err(sql_error("delete_linking"))
    }

    fn try_lock(
        &self,
        id: &SuspicionId,
        author: &RequestAuthor,
        lock_end_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = change_lock(&conn, "lock_suspicion", id, author, Some(lock_end_date), now);
        observe(STORE, "lock", start, result)
    }

    fn unlock(
        &self,
        id: &SuspicionId,
        author: &RequestAuthor,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let start = Instant::now();
        let conn = acquire_lock(&self.conn);
        let result = change_lock(&conn, "unlock_suspicion", id, author, None, now);
        observe(STORE, "unlock", start, result)
    }

    fn insert_exclusion(&self, exclusion: &Exclusion) -> Result<bool> {
        let (first, second) = Exclusion::ordered(&exclusion.first, &exclusion.second);
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "INSERT OR IGNORE INTO exclusions \
             (first_customer_id, second_customer_id, author_name, author_type, date) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                first.as_str(),
                second.as_str(),
                exclusion.author.name,
                exclusion.author.author_type.as_str(),
                to_millis(exclusion.date),
            ],
        )
        .map(|n| n > 0)
        .map_err(sql_error("insert_exclusion"))
    }

    fn delete_exclusion(&self, first: &CustomerId, second: &CustomerId) -> Result<bool> {
        let (first, second) = Exclusion::ordered(first, second);
        let conn = acquire_lock(&self.conn);
        conn.execute(
            "DELETE FROM exclusions WHERE first_customer_id = ?1 AND second_customer_id = ?2",
            params![first.as_str(), second.as_str()],
        )
        .map(|n| n > 0)
        .map_err(sql_error("delete_exclusion"))
    }

    fn is_excluded(&self, first: &CustomerId, second: &CustomerId) -> Result<bool> {
        let (first, second) = Exclusion::ordered(first, second);
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM exclusions \
             WHERE first_customer_id = ?1 AND second_customer_id = ?2)",
            params![first.as_str(), second.as_str()],
            |row| row.get(0),
        )
        .map_err(sql_error("is_excluded"))
    }

    fn exclusions_for(&self, customer_id: &CustomerId) -> Result<Vec<Exclusion>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT first_customer_id, second_customer_id, author_name, author_type, date \
                 FROM exclusions WHERE first_customer_id = ?1 OR second_customer_id = ?1 \
                 ORDER BY date",
            )
            .map_err(sql_error("exclusions_for"))?;
        let exclusions = stmt
            .query_map(params![customer_id.as_str()], read_exclusion)
            .map_err(sql_error("exclusions_for"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_error("exclusions_for"))?;
        Ok(exclusions)
    }
}
