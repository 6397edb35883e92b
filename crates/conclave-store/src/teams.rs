use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{Team, TeamStatus};

use crate::db::{db_err, enum_col, fmt_ts, json_col, ts_col, Database};

const COLUMNS: &str = "id, name, description, supervisor_id, members, status, created_at";

#[derive(Clone)]
pub struct TeamStore {
    db: Arc<Database>,
}

fn row_to_team(row: &Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        supervisor_id: row.get(3)?,
        members: json_col(row, 4)?,
        status: enum_col(row, 5)?,
        created_at: ts_col(row, 6)?,
    })
}

impl TeamStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a team definition.
    pub fn save(&self, team: &Team) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO teams ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                team.id,
                team.name,
                team.description,
                team.supervisor_id,
                serde_json::to_string(&team.members)?,
                team.status.as_str(),
                fmt_ts(&team.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Team> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM teams WHERE id = ?1"),
            params![id],
            row_to_team,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::TeamNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Team>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM teams ORDER BY created_at, id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_team).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn set_status(&self, id: &str, status: TeamStatus) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE teams SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ConclaveError::TeamNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute("DELETE FROM teams WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Teams the agent belongs to, as member or supervisor.
    pub fn teams_of(&self, agent_id: &str) -> Result<Vec<Team>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| t.includes(agent_id))
            .collect())
    }
}
