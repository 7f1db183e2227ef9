use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;

use crate::context::auth_ctx;
use crate::context::types::{now_ts, ContextError};
use crate::db::Store;

/// How long an agent stays "active" after its last presence signal.
const ACTIVE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub agent_id: String,
    pub agent_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: String,
    pub registered_at: f64,
    pub last_seen_at: f64,
    #[serde(skip)]
    last_seen: Instant,
}

/// Live registry of agents that announced themselves. Purely in-memory —
/// presence is a liveness signal, not durable state.
pub struct PresenceRegistry {
    agents: DashMap<String, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Upserts the calling agent's presence. Re-registering refreshes the
    /// liveness clock and replaces status/session.
    pub fn register(&self, session_id: Option<&str>, status: Option<&str>) -> PresenceEntry {
        let caller = auth_ctx::current();
        let now = now_ts();
        let entry = PresenceEntry {
            agent_id: caller.agent_id.clone(),
            agent_type: caller.agent_type.clone(),
            session_id: session_id.map(str::to_string),
            status: status.unwrap_or("active").to_string(),
            registered_at: self
                .agents
                .get(&caller.agent_id)
                .map(|e| e.registered_at)
                .unwrap_or(now),
            last_seen_at: now,
            last_seen: Instant::now(),
        };
        self.agents.insert(caller.agent_id.clone(), entry.clone());
        entry
    }

    /// Agents seen within the active window, optionally narrowed to one
    /// session.
    pub fn active_agents(&self, session_id: Option<&str>) -> Vec<PresenceEntry> {
        let mut active: Vec<PresenceEntry> = self
            .agents
            .iter()
            .filter(|e| e.value().last_seen.elapsed() <= ACTIVE_WINDOW)
            .filter(|e| match session_id {
                Some(sid) => e.value().session_id.as_deref() == Some(sid),
                None => true,
            })
            .map(|e| e.value().clone())
            .collect();
        active.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        active
    }

    pub fn active_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|e| e.value().last_seen.elapsed() <= ACTIVE_WINDOW)
            .count()
    }

    /// Activity summary for one agent: message/memory/audit footprint plus
    /// live presence. Non-admins may only ask about themselves.
    pub async fn activity_summary(
        &self,
        store: &Store,
        agent_id: Option<&str>,
    ) -> Result<serde_json::Value, ContextError> {
        use sqlx::Row;
        let caller = auth_ctx::current();
        let subject = agent_id.unwrap_or(&caller.agent_id);
        if subject != caller.agent_id && !caller.is_admin() {
            return Err(ContextError::PermissionDenied(
                "Only admins may inspect other agents' activity".to_string(),
            ));
        }

        let messages = store
            .query(
                "SELECT COUNT(*) AS count, COUNT(DISTINCT session_id) AS sessions, MAX(timestamp) AS last_message
                 FROM messages WHERE sender = :agent_id",
                &[("agent_id", json!(subject))],
            )
            .await?;
        let memory = store
            .query(
                "SELECT COUNT(*) AS count FROM agent_memory
                 WHERE agent_id = :agent_id AND (expires_at IS NULL OR expires_at >= :now)",
                &[("agent_id", json!(subject)), ("now", json!(now_ts()))],
            )
            .await?;
        let audit = store
            .query(
                "SELECT COUNT(*) AS count, MAX(timestamp) AS last_event
                 FROM audit_log WHERE agent_id = :agent_id",
                &[("agent_id", json!(subject))],
            )
            .await?;

        let message_row = messages.first();
        let presence = self.agents.get(subject).map(|e| e.value().clone());

        Ok(json!({
            "agent_id": subject,
            "messages": {
                "count": message_row.map(|r| r.get::<i64, _>("count")).unwrap_or(0),
                "sessions": message_row.map(|r| r.get::<i64, _>("sessions")).unwrap_or(0),
                "last_message": message_row.and_then(|r| r.get::<Option<f64>, _>("last_message")),
            },
            "memory_entries": memory.first().map(|r| r.get::<i64, _>("count")).unwrap_or(0),
            "audit_events": audit.first().map(|r| r.get::<i64, _>("count")).unwrap_or(0),
            "last_audit_event": audit.first().and_then(|r| r.get::<Option<f64>, _>("last_event")),
            "presence": presence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::auth_ctx::{with_auth, AuthContext};
    use crate::context::types::Permission;

    fn agent(agent_id: &str, perms: Vec<Permission>) -> AuthContext {
        AuthContext {
            agent_id: agent_id.to_string(),
            agent_type: "claude".to_string(),
            permissions: perms,
            authenticated: true,
            auth_method: Some("jwt".to_string()),
        }
    }

    #[tokio::test]
    async fn register_then_list() {
        let presence = PresenceRegistry::new();
        with_auth(agent("a1", vec![Permission::Write]), async {
            presence.register(Some("session_0123456789abcdef"), Some("working"));
        })
        .await;
        with_auth(agent("a2", vec![Permission::Write]), async {
            presence.register(None, None);
        })
        .await;

        let all = presence.active_agents(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].agent_id, "a1");
        assert_eq!(all[0].status, "working");

        let scoped = presence.active_agents(Some("session_0123456789abcdef"));
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].agent_id, "a1");
    }

    #[tokio::test]
    async fn reregistration_keeps_first_seen() {
        let presence = PresenceRegistry::new();
        let first = with_auth(agent("a1", vec![]), async { presence.register(None, None) }).await;
        let second =
            with_auth(agent("a1", vec![]), async { presence.register(None, Some("busy")) }).await;
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.status, "busy");
        assert_eq!(presence.active_count(), 1);
    }

    #[tokio::test]
    async fn summary_is_self_only_without_admin() {
        let store = Store::connect_memory().await.unwrap();
        let presence = PresenceRegistry::new();

        let err = with_auth(agent("a1", vec![Permission::Read]), async {
            presence.activity_summary(&store, Some("a2")).await
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let own = with_auth(agent("a1", vec![Permission::Read]), async {
            presence.activity_summary(&store, None).await
        })
        .await
        .unwrap();
        assert_eq!(own["agent_id"], "a1");
        assert_eq!(own["messages"]["count"], 0);
    }
}
