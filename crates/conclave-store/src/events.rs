use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tracing::debug;

use conclave_core::error::{ConclaveError, Result};
use conclave_core::types::{new_id, BusEvent, EventQuery};

use crate::db::{db_err, fmt_ts, json_col, now, ts_col, Database};

const COLUMNS: &str = "id, type, source, timestamp, payload, consumed";
const NEWEST_FIRST: &str = "ORDER BY timestamp DESC, seq DESC";

/// Durable, append-only event log. Consumers poll; nothing is ever deleted.
#[derive(Clone)]
pub struct EventBus {
    db: Arc<Database>,
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<BusEvent> {
    Ok(BusEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        source: row.get(2)?,
        timestamp: ts_col(row, 3)?,
        payload: json_col(row, 4)?,
        consumed: row.get::<_, i64>(5)? != 0,
    })
}

/// Translate a `*`-glob into a LIKE pattern. Only a single leading or
/// trailing `*` is a wildcard; anything else matches literally.
fn glob_to_like(pattern: &str) -> String {
    let escape = |s: &str| {
        s.replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_")
    };
    if pattern == "*" {
        "%".to_string()
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        format!("{}%", escape(prefix))
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        format!("%{}", escape(suffix))
    } else {
        escape(pattern)
    }
}

impl EventBus {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an event. It is returned unconsumed.
    pub fn publish(
        &self,
        event_type: &str,
        source: &str,
        payload: serde_json::Value,
    ) -> Result<BusEvent> {
        let event = BusEvent {
            id: new_id(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            timestamp: now(),
            payload,
            consumed: false,
        };
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO events (id, type, source, timestamp, payload, consumed)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                event.id,
                event.event_type,
                event.source,
                fmt_ts(&event.timestamp),
                serde_json::to_string(&event.payload)?,
            ],
        )
        .map_err(db_err)?;
        debug!(event_type = %event.event_type, source = %event.source, "Event published");
        Ok(event)
    }

    pub fn get(&self, id: &str) -> Result<BusEvent> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM events WHERE id = ?1"),
            params![id],
            row_to_event,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| ConclaveError::EventNotFound(id.to_string()))
    }

    /// Events matching the filter, newest first.
    pub fn query(&self, query: &EventQuery) -> Result<Vec<BusEvent>> {
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(t) = &query.event_type {
            args.push(SqlValue::Text(t.clone()));
            clauses.push(format!("type = ?{}", args.len()));
        }
        if let Some(s) = &query.source {
            args.push(SqlValue::Text(s.clone()));
            clauses.push(format!("source = ?{}", args.len()));
        }
        if query.unconsumed_only {
            clauses.push("consumed = 0".to_string());
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(SqlValue::Integer(query.limit as i64));
        let sql = format!(
            "SELECT {COLUMNS} FROM events {filter} {NEWEST_FIRST} LIMIT ?{}",
            args.len()
        );

        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), row_to_event)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Unconsumed events whose type matches a glob with a single leading
    /// or trailing `*`, newest first.
    pub fn match_events(&self, pattern: &str, limit: usize) -> Result<Vec<BusEvent>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM events
                 WHERE consumed = 0 AND type LIKE ?1 ESCAPE '\\'
                 {NEWEST_FIRST} LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![glob_to_like(pattern), limit as i64], row_to_event)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Mark an event consumed. Idempotent; returns whether this call changed it.
    pub fn consume(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE events SET consumed = 1 WHERE id = ?1 AND consumed = 0",
                params![id],
            )
            .map_err(db_err)?;
        if changed > 0 {
            return Ok(true);
        }
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(ConclaveError::EventNotFound(id.to_string())),
        }
    }

    /// Atomically take the newest unconsumed event of a type.
    ///
    /// Selection and the consumed mark happen in one statement, so two
    /// concurrent claimers can never both receive the same event.
    pub fn claim_newest(&self, event_type: &str) -> Result<Option<BusEvent>> {
        let conn = self.db.conn()?;
        conn.query_row(
            &format!(
                "UPDATE events SET consumed = 1
                 WHERE seq = (
                     SELECT seq FROM events
                     WHERE type = ?1 AND consumed = 0
                     {NEWEST_FIRST} LIMIT 1
                 ) AND consumed = 0
                 RETURNING {COLUMNS}"
            ),
            params![event_type],
            row_to_event,
        )
        .optional()
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_publish_returns_unconsumed() {
        let bus = bus();
        let e = bus.publish("task.delegated", "boss", json!({"task": "x"})).unwrap();
        assert!(!e.consumed);
        assert_eq!(bus.get(&e.id).unwrap(), e);
    }

    #[test]
    fn test_query_newest_first_and_filters() {
        let bus = bus();
        let first = bus.publish("a.one", "s1", json!(1)).unwrap();
        let second = bus.publish("a.one", "s2", json!(2)).unwrap();
        bus.publish("b.two", "s1", json!(3)).unwrap();

        let got = bus.query(&EventQuery::of_type("a.one")).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, second.id);
        assert_eq!(got[1].id, first.id);

        let by_source = bus
            .query(&EventQuery {
                source: Some("s1".into()),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(by_source.len(), 2);

        let limited = bus.query(&EventQuery::default().with_limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_query_hides_consumed_by_default() {
        let bus = bus();
        let e = bus.publish("x", "s", json!(null)).unwrap();
        bus.consume(&e.id).unwrap();

        assert!(bus.query(&EventQuery::of_type("x")).unwrap().is_empty());
        let history = bus
            .query(&EventQuery::of_type("x").including_consumed())
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].consumed);
    }

    #[test]
    fn test_consume_is_idempotent() {
        let bus = bus();
        let e = bus.publish("x", "s", json!({})).unwrap();
        assert!(bus.consume(&e.id).unwrap());
        assert!(!bus.consume(&e.id).unwrap());
        assert!(bus.get(&e.id).unwrap().consumed);
        let all = bus.query(&EventQuery::default().including_consumed()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_consume_unknown() {
        assert!(matches!(
            bus().consume("missing").unwrap_err(),
            ConclaveError::EventNotFound(_)
        ));
    }

    #[test]
    fn test_match_events_globs() {
        let bus = bus();
        bus.publish("task.delegated", "s", json!({})).unwrap();
        bus.publish("task.completed", "s", json!({})).unwrap();
        bus.publish("build.completed", "s", json!({})).unwrap();
        bus.publish("task_x", "s", json!({})).unwrap();

        assert_eq!(bus.match_events("task.*", 10).unwrap().len(), 2);
        assert_eq!(bus.match_events("*.completed", 10).unwrap().len(), 2);
        assert_eq!(bus.match_events("task.delegated", 10).unwrap().len(), 1);
        assert_eq!(bus.match_events("*", 10).unwrap().len(), 4);
        // `_` is literal, not a single-character wildcard
        assert_eq!(bus.match_events("task_*", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_claim_newest_takes_once() {
        let bus = bus();
        bus.publish("task.delegated", "s", json!({"n": 1})).unwrap();
        let newer = bus.publish("task.delegated", "s", json!({"n": 2})).unwrap();

        let claimed = bus.claim_newest("task.delegated").unwrap().unwrap();
        assert_eq!(claimed.id, newer.id);
        assert!(claimed.consumed);

        let next = bus.claim_newest("task.delegated").unwrap().unwrap();
        assert_eq!(next.payload["n"], 1);
        assert!(bus.claim_newest("task.delegated").unwrap().is_none());
    }

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like("task.*"), "task.%");
        assert_eq!(glob_to_like("*.done"), "%.done");
        assert_eq!(glob_to_like("100%"), "100\\%");
    }
}
