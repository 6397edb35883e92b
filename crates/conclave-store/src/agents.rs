use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::warn;

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{AgentConfig, AgentInstance, AgentStatus};

use crate::db::{db_err, enum_col, fmt_ts, json_col, opt_ts_col, ts_col, Database};

/// Error recorded on instances that were live when the process went away.
pub const PROCESS_LOST: &str = "process lost";

const COLUMNS: &str =
    "id, name, config, status, session_id, started_at, last_activity, error, created_at";

/// Durable catalog of agent instances.
#[derive(Clone)]
pub struct AgentStore {
    db: Arc<Database>,
}

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<AgentInstance> {
    Ok(AgentInstance {
        id: row.get(0)?,
        name: row.get(1)?,
        config: json_col(row, 2)?,
        status: enum_col(row, 3)?,
        session_id: row.get(4)?,
        started_at: opt_ts_col(row, 5)?,
        last_activity: opt_ts_col(row, 6)?,
        error: row.get(7)?,
        created_at: ts_col(row, 8)?,
    })
}

impl AgentStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn insert(&self, agent: &AgentInstance) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!("INSERT INTO agents ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                agent.id,
                agent.name,
                serde_json::to_string(&agent.config)?,
                agent.status.as_str(),
                agent.session_id,
                agent.started_at.as_ref().map(fmt_ts),
                agent.last_activity.as_ref().map(fmt_ts),
                agent.error,
                fmt_ts(&agent.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Option<AgentInstance>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM agents WHERE id = ?1"),
            params![id],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn get(&self, id: &str) -> Result<AgentInstance> {
        self.find(id)?
            .ok_or_else(|| ConclaveError::AgentNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<AgentInstance>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM agents ORDER BY created_at, id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_agent).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn update_config(&self, id: &str, name: &str, config: &AgentConfig) -> Result<AgentInstance> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("UPDATE agents SET name = ?2, config = ?3 WHERE id = ?1 RETURNING {COLUMNS}"),
            params![id, name, serde_json::to_string(config)?],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::AgentNotFound(id.to_string()))
    }

    /// Stamp a new status and activity time in one statement.
    ///
    /// Entering `running` also stamps `started_at` and clears any previous
    /// error. `error` replaces the stored error when given.
    pub fn update_status(
        &self,
        id: &str,
        status: AgentStatus,
        error: Option<&str>,
    ) -> Result<AgentInstance> {
        self.write_status(id, None, status, error)?
            .ok_or_else(|| ConclaveError::AgentNotFound(id.to_string()))
    }

    /// Like `update_status`, but only while the instance is in `expected`.
    /// Returns `None` when the instance had already moved on.
    pub fn update_status_if(
        &self,
        id: &str,
        expected: AgentStatus,
        status: AgentStatus,
        error: Option<&str>,
    ) -> Result<Option<AgentInstance>> {
        self.write_status(id, Some(expected), status, error)
    }

    fn write_status(
        &self,
        id: &str,
        expected: Option<AgentStatus>,
        status: AgentStatus,
        error: Option<&str>,
    ) -> Result<Option<AgentInstance>> {
        let now = fmt_ts(&Utc::now());
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "UPDATE agents SET
                    status = ?2,
                    last_activity = ?3,
                    started_at = CASE WHEN ?2 = 'running' THEN ?3 ELSE started_at END,
                    error = CASE
                        WHEN ?4 IS NOT NULL THEN ?4
                        WHEN ?2 = 'running' THEN NULL
                        ELSE error
                    END
                 WHERE id = ?1 AND (?5 IS NULL OR status = ?5)
                 RETURNING {COLUMNS}"
            ),
            params![id, status.as_str(), now, error, expected.map(|s| s.as_str())],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn set_session(&self, id: &str, session_id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE agents SET session_id = ?2, last_activity = ?3 WHERE id = ?1",
                params![id, session_id, fmt_ts(&Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ConclaveError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE agents SET last_activity = ?2 WHERE id = ?1",
            params![id, fmt_ts(&Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute("DELETE FROM agents WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Startup migration: no backend process survives a restart, so every
    /// instance still marked running or paused becomes terminated.
    pub fn recover_stale_instances(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE agents SET status = 'terminated', error = ?1, last_activity = ?2
                 WHERE status IN ('running', 'paused')",
                params![PROCESS_LOST, fmt_ts(&Utc::now())],
            )
            .map_err(db_err)?;
        if changed > 0 {
            warn!(count = changed, "Marked stale agent instances as terminated");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AgentStore {
        AgentStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn agent(id: &str) -> AgentInstance {
        AgentInstance {
            id: id.into(),
            name: id.into(),
            config: AgentConfig::default(),
            status: AgentStatus::Idle,
            session_id: None,
            started_at: None,
            last_activity: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = store();
        store.insert(&agent("a1")).unwrap();
        let got = store.get("a1").unwrap();
        assert_eq!(got.status, AgentStatus::Idle);
        assert!(matches!(
            store.get("nope").unwrap_err(),
            ConclaveError::AgentNotFound(_)
        ));
    }

    #[test]
    fn test_update_status_stamps_times() {
        let store = store();
        store.insert(&agent("a1")).unwrap();

        let running = store.update_status("a1", AgentStatus::Running, None).unwrap();
        assert_eq!(running.status, AgentStatus::Running);
        assert!(running.started_at.is_some());
        assert!(running.last_activity.is_some());

        let failed = store
            .update_status("a1", AgentStatus::Error, Some("boom"))
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let again = store.update_status("a1", AgentStatus::Running, None).unwrap();
        assert!(again.error.is_none());
    }

    #[test]
    fn test_conditional_update() {
        let store = store();
        store.insert(&agent("a1")).unwrap();
        store.update_status("a1", AgentStatus::Terminated, None).unwrap();

        let skipped = store
            .update_status_if("a1", AgentStatus::Running, AgentStatus::Idle, None)
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(store.get("a1").unwrap().status, AgentStatus::Terminated);

        store.update_status("a1", AgentStatus::Running, None).unwrap();
        let settled = store
            .update_status_if("a1", AgentStatus::Running, AgentStatus::Idle, None)
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, AgentStatus::Idle);
    }

    #[test]
    fn test_set_session_unknown_agent() {
        let store = store();
        assert!(store.set_session("ghost", "s1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_recover_stale_instances() {
        let store = store();
        for id in ["run", "pause", "idle"] {
            store.insert(&agent(id)).unwrap();
        }
        store.update_status("run", AgentStatus::Running, None).unwrap();
        store.update_status("pause", AgentStatus::Paused, None).unwrap();

        assert_eq!(store.recover_stale_instances().unwrap(), 2);
        for id in ["run", "pause"] {
            let a = store.get(id).unwrap();
            assert_eq!(a.status, AgentStatus::Terminated);
            assert_eq!(a.error.as_deref(), Some(PROCESS_LOST));
        }
        assert_eq!(store.get("idle").unwrap().status, AgentStatus::Idle);
        assert_eq!(store.recover_stale_instances().unwrap(), 0);
    }
}
