//! `SQLite` rule catalog.

use super::connection::{acquire_lock, open_connection, open_in_memory};
use super::{from_millis, to_millis};
use crate::models::{DuplicateRule, LimitationMode};
use crate::storage::traits::RuleCatalog;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Mutex;

const SELECT_COLUMNS: &str = "SELECT code, name, priority, checked_attributes, detection_limit, \
     limitation_mode, daemon, active, last_execution_date FROM rules";

/// `SQLite`-backed [`RuleCatalog`].
pub struct SqliteRuleCatalog {
    conn: Mutex<Connection>,
}

impl SqliteRuleCatalog {
    /// Opens (or creates) the catalog at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(open_connection(path.as_ref())?)
    }

    /// Creates an in-memory catalog (for testing).
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
            CREATE TABLE IF NOT EXISTS rules (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                checked_attributes TEXT NOT NULL DEFAULT '[]',
                detection_limit INTEGER NOT NULL DEFAULT 0,
                limitation_mode TEXT NOT NULL DEFAULT 'GLOBAL',
                daemon INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                last_execution_date INTEGER
            );
            ",
        )
        .map_err(|e| Error::operation("initialize_rule_schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_rule(row: &Row<'_>) -> rusqlite::Result<DuplicateRule> {
    let attributes: String = row.get(3)?;
    let mode: String = row.get(5)?;
    let last: Option<i64> = row.get(8)?;
    Ok(DuplicateRule {
        code: row.get(0)?,
        name: row.get(1)?,
        priority: row.get(2)?,
        checked_attributes: serde_json::from_str(&attributes).unwrap_or_default(),
        detection_limit: row.get(4)?,
        limitation_mode: LimitationMode::parse(&mode).unwrap_or_default(),
        daemon: row.get::<_, i64>(6)? != 0,
        active: row.get::<_, i64>(7)? != 0,
        last_execution_date: last.map(from_millis),
    })
}

fn write_rule(conn: &Connection, sql: &str, rule: &DuplicateRule) -> Result<usize> {
    let attributes = serde_json::to_string(&rule.checked_attributes)
        .map_err(|e| Error::operation("serialize_rule", e))?;
    conn.execute(
        sql,
        params![
            rule.code,
            rule.name,
            rule.priority,
            attributes,
            rule.detection_limit,
            rule.limitation_mode.as_str(),
            i64::from(rule.daemon),
            i64::from(rule.active),
            rule.last_execution_date.map(to_millis),
        ],
    )
    .map_err(|e| Error::operation("write_rule", e))
}

impl RuleCatalog for SqliteRuleCatalog {
    fn list_rules(&self) -> Result<Vec<DuplicateRule>> {
        let conn = acquire_lock(&self.conn);
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY priority, code"))
            .map_err(|e| Error::operation("list_rules", e))?;
        let rules = stmt
            .query_map([], read_rule)
            .map_err(|e| Error::operation("list_rules", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::operation("list_rules", e))?;
        Ok(rules)
    }

    fn get(&self, code: &str) -> Result<DuplicateRule> {
        let conn = acquire_lock(&self.conn);
        conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE code = ?1"),
            params![code],
            read_rule,
        )
        .optional()
        .map_err(|e| Error::operation("get_rule", e))?
        .ok_or_else(|| Error::not_found("rule", code))
    }

    fn update(&self, rule: &DuplicateRule) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        let changed = write_rule(
            &conn,
            "UPDATE rules SET name = ?2, priority = ?3, checked_attributes = ?4, \
             detection_limit = ?5, limitation_mode = ?6, daemon = ?7, active = ?8, \
             last_execution_date = ?9 WHERE code = ?1",
            rule,
        )?;
        if changed == 0 {
            return Err(Error::not_found("rule", rule.code.as_str()));
        }
        Ok(())
    }

    fn upsert(&self, rule: &DuplicateRule) -> Result<()> {
        let conn = acquire_lock(&self.conn);
        write_rule(
            &conn,
            "INSERT INTO rules (code, name, priority, checked_attributes, detection_limit, \
             limitation_mode, daemon, active, last_execution_date) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(code) DO UPDATE SET name = excluded.name, \
             priority = excluded.priority, checked_attributes = excluded.checked_attributes, \
             detection_limit = excluded.detection_limit, \
             limitation_mode = excluded.limitation_mode, daemon = excluded.daemon, \
             active = excluded.active, \
             last_execution_date = COALESCE(excluded.last_execution_date, rules.last_execution_date)",
            rule,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_list_rules_by_priority() {
        let catalog = SqliteRuleCatalog::in_memory().expect("catalog");
        catalog
            .upsert(&DuplicateRule::new("LOW", 20, &["email"]))
            .expect("low");
        catalog
            .upsert(&DuplicateRule::new("HIGH", 1, &["birth_name", "birth_date"]))
            .expect("high");

        let rules = catalog.list_rules().expect("list");
        let codes: Vec<_> = rules.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, ["HIGH", "LOW"]);
        assert_eq!(rules[0].checked_attributes, ["birth_name", "birth_date"]);
    }

    #[test]
    fn test_get_unknown_rule_is_not_found() {
        let catalog = SqliteRuleCatalog::in_memory().expect("catalog");
        assert!(matches!(
            catalog.get("NOPE"),
            Err(Error::NotFound { kind: "rule", .. })
        ));
        assert!(matches!(
            catalog.update(&DuplicateRule::new("NOPE", 1, &[])),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_upsert_keeps_last_execution_date() {
        let catalog = SqliteRuleCatalog::in_memory().expect("catalog");
        let rule = DuplicateRule::new("R1", 1, &["email"])
            .with_daemon(true)
            .with_limit(10, LimitationMode::Incremental);
        catalog.upsert(&rule).expect("insert");

        let mut stamped = catalog.get("R1").expect("get");
        assert_eq!(stamped.limitation_mode, LimitationMode::Incremental);
        stamped.last_execution_date = Some(Utc::now());
        catalog.update(&stamped).expect("stamp");

        // Re-seeding from configuration must not erase the stamp.
        catalog.upsert(&rule).expect("reseed");
        assert!(catalog.get("R1").expect("get").last_execution_date.is_some());
    }

    #[test]
    fn test_scannable_rules_filters_inactive_and_manual() {
        let catalog = SqliteRuleCatalog::in_memory().expect("catalog");
        catalog
            .upsert(&DuplicateRule::new("AUTO", 1, &["email"]).with_daemon(true))
            .expect("auto");
        catalog
            .upsert(&DuplicateRule::new("MANUAL", 2, &["email"]))
            .expect("manual");
        catalog
            .upsert(
                &DuplicateRule::new("OFF", 3, &["email"])
                    .with_daemon(true)
                    .with_active(false),
            )
            .expect("off");

        let codes: Vec<_> = catalog
            .scannable_rules()
            .expect("scannable")
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, ["AUTO"]);
    }
}
