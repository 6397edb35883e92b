use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{new_id, Span, Trace, TraceStatus, Usage};

use crate::db::{db_err, enum_col, fmt_ts, json_col, now, opt_ts_col, ts_col, Database};

const TRACE_COLUMNS: &str = "id, agent_id, run_id, step_id, status, prompt_preview, \
     started_at, ended_at, input_tokens, output_tokens, cost_usd, error";

const SPAN_COLUMNS: &str = "id, trace_id, name, started_at, ended_at, metadata";

const PREVIEW_CHARS: usize = 200;

/// Where a trace came from.
#[derive(Debug, Clone, Default)]
pub struct TraceOrigin {
    pub run_id: Option<String>,
    pub step_id: Option<String>,
}

/// Per-invocation observability records.
#[derive(Clone)]
pub struct TraceStore {
    db: Arc<Database>,
}

fn row_to_trace(row: &Row<'_>) -> rusqlite::Result<Trace> {
    Ok(Trace {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        run_id: row.get(2)?,
        step_id: row.get(3)?,
        status: enum_col(row, 4)?,
        prompt_preview: row.get(5)?,
        started_at: ts_col(row, 6)?,
        ended_at: opt_ts_col(row, 7)?,
        input_tokens: row.get::<_, i64>(8)? as u64,
        output_tokens: row.get::<_, i64>(9)? as u64,
        cost_usd: row.get(10)?,
        error: row.get(11)?,
    })
}

fn row_to_span(row: &Row<'_>) -> rusqlite::Result<Span> {
    Ok(Span {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        name: row.get(2)?,
        started_at: ts_col(row, 3)?,
        ended_at: opt_ts_col(row, 4)?,
        metadata: json_col(row, 5)?,
    })
}

impl TraceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn start_trace(&self, agent_id: &str, origin: &TraceOrigin, prompt: &str) -> Result<Trace> {
        let trace = Trace {
            id: new_id(),
            agent_id: agent_id.to_string(),
            run_id: origin.run_id.clone(),
            step_id: origin.step_id.clone(),
            status: TraceStatus::Running,
            prompt_preview: prompt.chars().take(PREVIEW_CHARS).collect(),
            started_at: now(),
            ended_at: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: None,
            error: None,
        };
        let conn = self.db.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO traces ({TRACE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, 0, 0, NULL, NULL)"
            ),
            params![
                trace.id,
                trace.agent_id,
                trace.run_id,
                trace.step_id,
                trace.status.as_str(),
                trace.prompt_preview,
                fmt_ts(&trace.started_at),
            ],
        )
        .map_err(db_err)?;
        Ok(trace)
    }

    /// Close a trace with its final status and usage.
    pub fn finish_trace(
        &self,
        id: &str,
        status: TraceStatus,
        usage: Option<&Usage>,
        error: Option<&str>,
    ) -> Result<()> {
        let (input, output, cost) = match usage {
            Some(u) => (u.input_tokens as i64, u.output_tokens as i64, u.cost_usd),
            None => (0, 0, None),
        };
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE traces SET status = ?2, ended_at = ?3, input_tokens = ?4,
                 output_tokens = ?5, cost_usd = ?6, error = ?7
             WHERE id = ?1",
            params![id, status.as_str(), fmt_ts(&now()), input, output, cost, error],
        )
        .map_err(db_err)?;
        // Spans left open (tool call never answered) end with the trace
        conn.execute(
            "UPDATE spans SET ended_at = ?2 WHERE trace_id = ?1 AND ended_at IS NULL",
            params![id, fmt_ts(&now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_trace(&self, id: &str) -> Result<Trace> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE id = ?1"),
            params![id],
            row_to_trace,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::TraceNotFound(id.to_string()))
    }

    /// Traces newest first, optionally for one agent.
    pub fn list_traces(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<Trace>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRACE_COLUMNS} FROM traces
                 WHERE ?1 IS NULL OR agent_id = ?1
                 ORDER BY started_at DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![agent_id, limit as i64], row_to_trace)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn start_span(
        &self,
        trace_id: &str,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<Span> {
        let span = Span {
            id: new_id(),
            trace_id: trace_id.to_string(),
            name: name.to_string(),
            started_at: now(),
            ended_at: None,
            metadata,
        };
        let conn = self.db.conn()?;
        conn.execute(
            &format!("INSERT INTO spans ({SPAN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, NULL, ?5)"),
            params![
                span.id,
                span.trace_id,
                span.name,
                fmt_ts(&span.started_at),
                serde_json::to_string(&span.metadata)?,
            ],
        )
        .map_err(db_err)?;
        Ok(span)
    }

    /// End a span, merging `extra` into its metadata object.
    pub fn end_span(&self, id: &str, extra: serde_json::Value) -> Result<()> {
        let conn = self.db.conn()?;
        let current: Option<String> = conn
            .query_row("SELECT metadata FROM spans WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        let Some(current) = current else {
            return Ok(());
        };
        let mut metadata: serde_json::Value = serde_json::from_str(&current)?;
        if let (Some(target), serde_json::Value::Object(extra)) = (metadata.as_object_mut(), extra)
        {
            target.extend(extra);
        }
        conn.execute(
            "UPDATE spans SET ended_at = ?2, metadata = ?3 WHERE id = ?1",
            params![id, fmt_ts(&now()), serde_json::to_string(&metadata)?],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn spans_for(&self, trace_id: &str) -> Result<Vec<Span>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ?1 ORDER BY started_at, id"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![trace_id], row_to_span).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
