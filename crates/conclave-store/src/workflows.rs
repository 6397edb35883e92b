use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{RunStatus, Workflow, WorkflowRun};

use crate::db::{
    db_err, enum_col, fmt_ts, json_col, opt_enum_col, opt_ts_col, ts_col, Database,
};

const WORKFLOW_COLUMNS: &str = "id, name, description, trigger, steps, status, \
     last_run_status, last_run_at, created_at, updated_at";

const RUN_COLUMNS: &str =
    "id, workflow_id, status, started_at, completed_at, step_results, blackboard";

/// Workflow definitions and their run records.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Arc<Database>,
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        trigger: json_col(row, 3)?,
        steps: json_col(row, 4)?,
        status: enum_col(row, 5)?,
        last_run_status: opt_enum_col(row, 6)?,
        last_run_at: opt_ts_col(row, 7)?,
        created_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        status: enum_col(row, 2)?,
        started_at: ts_col(row, 3)?,
        completed_at: opt_ts_col(row, 4)?,
        step_results: json_col(row, 5)?,
        blackboard: json_col(row, 6)?,
    })
}

impl WorkflowStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a workflow definition.
    pub fn save(&self, wf: &Workflow) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO workflows ({WORKFLOW_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                wf.id,
                wf.name,
                wf.description,
                serde_json::to_string(&wf.trigger)?,
                serde_json::to_string(&wf.steps)?,
                wf.status.as_str(),
                wf.last_run_status.map(|s| s.as_str()),
                wf.last_run_at.as_ref().map(fmt_ts),
                fmt_ts(&wf.created_at),
                fmt_ts(&wf.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Workflow> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
            params![id],
            row_to_workflow,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::WorkflowNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Workflow>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at, id"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_workflow).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Delete a workflow and its run history.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM workflow_runs WHERE workflow_id = ?1", params![id])
            .map_err(db_err)?;
        let changed = conn
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn record_last_run(&self, workflow_id: &str, run: &WorkflowRun) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE workflows SET last_run_status = ?2, last_run_at = ?3 WHERE id = ?1",
            params![
                workflow_id,
                run.status.as_str(),
                fmt_ts(&run.started_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Insert or overwrite the full run record.
    pub fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO workflow_runs ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                run.id,
                run.workflow_id,
                run.status.as_str(),
                fmt_ts(&run.started_at),
                run.completed_at.as_ref().map(fmt_ts),
                serde_json::to_string(&run.step_results)?,
                serde_json::to_string(&run.blackboard)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<WorkflowRun> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::RunNotFound(id.to_string()))
    }

    /// Runs of a workflow, newest first.
    pub fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<WorkflowRun>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ?1
                 ORDER BY started_at DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![workflow_id, limit as i64], row_to_run)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Runs left `running` by a previous process. They will not resume.
    pub fn interrupted_runs(&self) -> Result<Vec<WorkflowRun>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![RunStatus::Running.as_str()], row_to_run)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
