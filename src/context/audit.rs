use serde_json::json;
use tokio::sync::mpsc;

use crate::context::types::{now_ts, AuditEntry, ContextError};
use crate::db::Store;

/// One event headed for the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: f64,
}

/// Filters for the admin-only audit query.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub start_ts: Option<f64>,
    pub end_ts: Option<f64>,
    pub limit: Option<i64>,
}

/// Append-only event stream. Writes go through an unbounded channel so the
/// originating operation pays one `send` and nothing else; the batch flusher
/// commits them in small transactions.
#[derive(Clone)]
pub struct AuditLog {
    store: Store,
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditLog {
    pub fn new(store: Store) -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { store, tx }, rx)
    }

    /// Enqueues an event. Never blocks, never fails the caller: if the
    /// flusher is gone we are shutting down and the event is dropped.
    pub fn record(
        &self,
        event_type: &str,
        agent_id: &str,
        session_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let event = AuditEvent {
            event_type: event_type.to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.map(str::to_string),
            metadata,
            timestamp: now_ts(),
        };
        if self.tx.send(event).is_err() {
            tracing::warn!("audit channel closed — dropping event");
        }
    }

    /// Admin query over the audit trail. Permission is enforced by the tool
    /// layer; this just builds the filtered SELECT.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, ContextError> {
        let mut sql = String::from(
            "SELECT id, event_type, agent_id, session_id, metadata, timestamp
             FROM audit_log WHERE 1=1",
        );
        let mut params: Vec<(&str, serde_json::Value)> = Vec::new();

        if let Some(agent_id) = &filter.agent_id {
            sql.push_str(" AND agent_id = :agent_id");
            params.push(("agent_id", json!(agent_id)));
        }
        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = :session_id");
            params.push(("session_id", json!(session_id)));
        }
        if let Some(event_type) = &filter.event_type {
            sql.push_str(" AND event_type = :event_type");
            params.push(("event_type", json!(event_type)));
        }
        if let Some(start) = filter.start_ts {
            sql.push_str(" AND timestamp >= :start_ts");
            params.push(("start_ts", json!(start)));
        }
        if let Some(end) = filter.end_ts {
            sql.push_str(" AND timestamp <= :end_ts");
            params.push(("end_ts", json!(end)));
        }

        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT :limit");
        params.push(("limit", json!(limit)));

        let rows = self.store.query(&sql, &params).await?;
        use sqlx::Row;
        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                event_type: row.get("event_type"),
                agent_id: row.get("agent_id"),
                session_id: row.get("session_id"),
                metadata: row
                    .get::<Option<String>, _>("metadata")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                timestamp: row.get("timestamp"),
            })
            .collect())
    }
}
