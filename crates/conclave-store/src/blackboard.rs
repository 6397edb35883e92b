use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use conclave_core::error::Result;
use conclave_core::types::BlackboardEntry;

use crate::db::{db_err, fmt_ts, json_col, ts_col, Database};

const COLUMNS: &str = "key, team_id, value, updated_by, updated_at, version";

/// Versioned key/value store scoped by team. Last writer wins; every write
/// bumps the version so writers can see what they overwrote.
#[derive(Clone)]
pub struct Blackboard {
    db: Arc<Database>,
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<BlackboardEntry> {
    Ok(BlackboardEntry {
        key: row.get(0)?,
        team_id: row.get(1)?,
        value: json_col(row, 2)?,
        updated_by: row.get(3)?,
        updated_at: ts_col(row, 4)?,
        version: row.get(5)?,
    })
}

impl Blackboard {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert a value, returning the stored entry with its new version.
    pub fn write(
        &self,
        key: &str,
        value: &serde_json::Value,
        updated_by: &str,
        team_id: &str,
    ) -> Result<BlackboardEntry> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "INSERT INTO blackboard (key, team_id, value, updated_by, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(key, team_id) DO UPDATE SET
                     value = excluded.value,
                     updated_by = excluded.updated_by,
                     updated_at = excluded.updated_at,
                     version = blackboard.version + 1
                 RETURNING {COLUMNS}"
            ),
            params![
                key,
                team_id,
                serde_json::to_string(value)?,
                updated_by,
                fmt_ts(&Utc::now()),
            ],
            row_to_entry,
        )
        .map_err(db_err)
    }

    pub fn read(&self, key: &str, team_id: &str) -> Result<Option<BlackboardEntry>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM blackboard WHERE key = ?1 AND team_id = ?2"),
            params![key, team_id],
            row_to_entry,
        )
        .optional()
        .map_err(db_err)
    }

    /// All entries of a team, most recently updated first.
    pub fn read_all(&self, team_id: &str) -> Result<Vec<BlackboardEntry>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM blackboard WHERE team_id = ?1
                 ORDER BY updated_at DESC, version DESC, key"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![team_id], row_to_entry).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn delete(&self, key: &str, team_id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "DELETE FROM blackboard WHERE key = ?1 AND team_id = ?2",
                params![key, team_id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Remove every entry of a team. Returns how many were removed.
    pub fn clear(&self, team_id: &str) -> Result<usize> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM blackboard WHERE team_id = ?1", params![team_id])
            .map_err(db_err)
    }
}
