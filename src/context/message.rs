use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::context::audit::AuditLog;
use crate::context::auth_ctx::{self, AuthContext};
use crate::context::notify::{NotificationHub, NotificationPayload};
use crate::context::session::SessionRegistry;
use crate::context::types::{now_ts, ContextError, Message, Visibility};
use crate::context::validate;
use crate::db::Store;

/// Debounce window applied to `session://` change events.
pub const NOTIFY_DEBOUNCE: Duration = Duration::from_millis(100);

pub const MAX_PAGE_SIZE: i64 = 1000;

/// Builds the canonical four-way visibility disjunction for `caller`.
///
/// Returned clause references `:viewer_id` and `:viewer_type`; the caller
/// merges the returned params into its own. Filtering happens in SQL — rows
/// a caller may not see are never materialized, so nothing downstream can
/// leak them.
pub(crate) fn visibility_clause(caller: &AuthContext) -> (String, Vec<(&'static str, serde_json::Value)>) {
    let mut clause = String::from(
        "(visibility = 'public' \
         OR (visibility = 'private' AND sender = :viewer_id) \
         OR (visibility = 'agent_only' AND sender_type = :viewer_type)",
    );
    if caller.is_admin() {
        clause.push_str(" OR visibility = 'admin_only'");
    }
    clause.push(')');
    (
        clause,
        vec![
            ("viewer_id", json!(caller.agent_id)),
            ("viewer_type", json!(caller.agent_type)),
        ],
    )
}

/// Pagination and filter options for `get_messages`.
#[derive(Debug, Default, serde::Deserialize)]
pub struct MessageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub visibility_filter: Option<Visibility>,
}

/// Filter options for `get_messages_advanced`.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AdvancedQuery {
    pub visibility_filter: Option<Visibility>,
    pub agent_type_filter: Option<String>,
    #[serde(default)]
    pub include_admin_only: bool,
}

/// Append-only log of session messages.
#[derive(Clone)]
pub struct MessageLog {
    store: Store,
    sessions: SessionRegistry,
    audit: AuditLog,
    hub: Arc<NotificationHub>,
}

impl MessageLog {
    pub fn new(
        store: Store,
        sessions: SessionRegistry,
        audit: AuditLog,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            store,
            sessions,
            audit,
            hub,
        }
    }

    /// Appends a message as the calling agent. The row is committed before
    /// the id is returned; the change notification fires only after commit.
    pub async fn add_message(
        &self,
        session_id: &str,
        content: &str,
        visibility: Visibility,
        metadata: Option<&serde_json::Value>,
        parent_message_id: Option<i64>,
    ) -> Result<Message, ContextError> {
        let caller = auth_ctx::current();
        // Session must exist before anything is written.
        self.sessions.get_session(session_id).await?;

        let content = validate::sanitize_text(content);
        validate::validate_content(&content)?;
        let metadata = metadata.map(validate::sanitize_json);

        if let Some(parent_id) = parent_message_id {
            let parent = self.get_message(parent_id).await?;
            if parent.session_id != session_id {
                return Err(ContextError::Validation(
                    "Parent message belongs to a different session".to_string(),
                ));
            }
        }

        let timestamp = now_ts();
        let metadata_text = metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let done = self
            .store
            .execute(
                "INSERT INTO messages
                   (session_id, sender, sender_type, content, visibility, message_type, metadata, timestamp, parent_message_id)
                 VALUES (:session_id, :sender, :sender_type, :content, :visibility, 'agent_response', :metadata, :ts, :parent)",
                &[
                    ("session_id", json!(session_id)),
                    ("sender", json!(caller.agent_id)),
                    ("sender_type", json!(caller.agent_type)),
                    ("content", json!(content)),
                    ("visibility", json!(visibility.as_str())),
                    (
                        "metadata",
                        metadata_text.map(|m| json!(m)).unwrap_or(serde_json::Value::Null),
                    ),
                    ("ts", json!(timestamp)),
                    (
                        "parent",
                        parent_message_id.map(|p| json!(p)).unwrap_or(serde_json::Value::Null),
                    ),
                ],
            )
            .await?;

        self.sessions.touch(session_id).await?;

        let message = Message {
            id: done.last_insert_id,
            session_id: session_id.to_string(),
            sender: caller.agent_id.clone(),
            sender_type: caller.agent_type.clone(),
            content,
            visibility,
            message_type: "agent_response".to_string(),
            metadata,
            timestamp,
            parent_message_id,
        };

        self.hub.notify(
            &format!("session://{session_id}"),
            NotificationPayload::new(
                "new_message",
                json!({
                    "session_id": session_id,
                    "message_id": message.id,
                    "sender": message.sender,
                    "visibility": message.visibility,
                }),
            ),
            NOTIFY_DEBOUNCE,
        );
        self.audit.record(
            "message_added",
            &caller.agent_id,
            Some(session_id),
            Some(json!({ "message_id": message.id, "visibility": visibility.as_str() })),
        );

        Ok(message)
    }

    /// Fetches one message by id with no visibility filtering. Internal only;
    /// every public path applies the visibility clause.
    async fn get_message(&self, message_id: i64) -> Result<Message, ContextError> {
        let rows = self
            .store
            .query(
                "SELECT * FROM messages WHERE id = :id",
                &[("id", json!(message_id))],
            )
            .await?;
        rows.first()
            .map(Message::from_row)
            .ok_or(ContextError::MessageNotFound(message_id))
    }

    /// Messages of a session visible to the caller, oldest first.
    pub async fn get_messages(
        &self,
        session_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, ContextError> {
        validate::validate_session_id(session_id)?;
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let mut sql = format!(
            "SELECT * FROM messages WHERE session_id = :session_id AND {clause}"
        );
        params.push(("session_id", json!(session_id)));

        if let Some(vf) = query.visibility_filter {
            sql.push_str(" AND visibility = :visibility_filter");
            params.push(("visibility_filter", json!(vf.as_str())));
        }

        let limit = query.limit.unwrap_or(100).clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0).max(0);
        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT :limit OFFSET :offset");
        params.push(("limit", json!(limit)));
        params.push(("offset", json!(offset)));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }

    /// The most recent `limit` visible messages, returned oldest-first.
    pub async fn recent_messages(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<Message>, ContextError> {
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);
        let sql = format!(
            "SELECT * FROM messages WHERE session_id = :session_id AND {clause} \
             ORDER BY timestamp DESC, id DESC LIMIT :limit"
        );
        params.push(("session_id", json!(session_id)));
        params.push(("limit", json!(limit.clamp(1, MAX_PAGE_SIZE))));

        let rows = self.store.query(&sql, &params).await?;
        let mut messages: Vec<Message> = rows.iter().map(Message::from_row).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Visibility- and agent-type-filtered retrieval. `include_admin_only`
    /// is honored only for admin callers; for everyone else the visibility
    /// clause already excludes those rows.
    pub async fn get_messages_advanced(
        &self,
        session_id: &str,
        query: &AdvancedQuery,
    ) -> Result<Vec<Message>, ContextError> {
        validate::validate_session_id(session_id)?;
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let mut sql = format!(
            "SELECT * FROM messages WHERE session_id = :session_id AND {clause}"
        );
        params.push(("session_id", json!(session_id)));

        if let Some(vf) = query.visibility_filter {
            sql.push_str(" AND visibility = :visibility_filter");
            params.push(("visibility_filter", json!(vf.as_str())));
        }
        if let Some(type_filter) = &query.agent_type_filter {
            // sender_type is denormalized on the row, so this needs no join.
            sql.push_str(" AND sender_type = :agent_type_filter");
            params.push(("agent_type_filter", json!(type_filter)));
        }
        if !query.include_admin_only {
            sql.push_str(" AND visibility != 'admin_only'");
        }

        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT :limit");
        params.push(("limit", json!(MAX_PAGE_SIZE)));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }

    /// Changes a message's visibility. Allowed for the sender or an admin;
    /// raising to `admin_only` additionally requires the admin permission.
    pub async fn set_message_visibility(
        &self,
        message_id: i64,
        new_visibility: Visibility,
        reason: Option<&str>,
    ) -> Result<(), ContextError> {
        let caller = auth_ctx::current();
        let message = self.get_message(message_id).await?;

        if message.sender != caller.agent_id && !caller.is_admin() {
            return Err(ContextError::PermissionDenied(
                "Only the sender or an admin may change message visibility".to_string(),
            ));
        }
        if new_visibility == Visibility::AdminOnly && !caller.is_admin() {
            return Err(ContextError::PermissionDenied(
                "'admin' permission required to mark messages admin_only".to_string(),
            ));
        }

        self.store
            .execute(
                "UPDATE messages SET visibility = :visibility WHERE id = :id",
                &[
                    ("visibility", json!(new_visibility.as_str())),
                    ("id", json!(message_id)),
                ],
            )
            .await?;

        self.audit.record(
            "message_visibility_changed",
            &caller.agent_id,
            Some(&message.session_id),
            Some(json!({
                "message_id": message_id,
                "from": message.visibility.as_str(),
                "to": new_visibility.as_str(),
                "reason": reason,
            })),
        );
        self.hub.notify(
            &format!("session://{}", message.session_id),
            NotificationPayload::new(
                "session_update",
                json!({ "session_id": message.session_id, "message_id": message_id }),
            ),
            NOTIFY_DEBOUNCE,
        );
        Ok(())
    }

    /// Session statistics for the `session://{id}` resource.
    pub async fn session_statistics(
        &self,
        session_id: &str,
    ) -> Result<serde_json::Value, ContextError> {
        use sqlx::Row;
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let totals = self
            .store
            .query(
                "SELECT COUNT(*) AS total, COUNT(DISTINCT sender) AS unique_agents, MAX(timestamp) AS last_activity
                 FROM messages WHERE session_id = :session_id",
                &[("session_id", json!(session_id))],
            )
            .await?;
        let sql = format!(
            "SELECT COUNT(*) AS visible FROM messages WHERE session_id = :session_id AND {clause}"
        );
        params.push(("session_id", json!(session_id)));
        let visible = self.store.query(&sql, &params).await?;

        let totals_row = totals.first().ok_or_else(|| {
            ContextError::Internal("aggregate query returned no row".to_string())
        })?;
        let visible_row = visible.first().ok_or_else(|| {
            ContextError::Internal("aggregate query returned no row".to_string())
        })?;

        Ok(json!({
            "total": totals_row.get::<i64, _>("total"),
            "visible": visible_row.get::<i64, _>("visible"),
            "unique_agents": totals_row.get::<i64, _>("unique_agents"),
            "last_activity": totals_row.get::<Option<f64>, _>("last_activity"),
        }))
    }
}
