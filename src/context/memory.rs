use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::context::audit::AuditLog;
use crate::context::auth_ctx;
use crate::context::notify::{NotificationHub, NotificationPayload};
use crate::context::types::{now_ts, ContextError, MemoryEntry};
use crate::context::validate;
use crate::db::Store;

/// TTL bounds for `expires_in`, seconds: one second to one year.
const MIN_TTL_SECS: i64 = 1;
const MAX_TTL_SECS: i64 = 365 * 24 * 3600;

const MAX_LIST_LIMIT: i64 = 200;

/// Where a memory entry lives. Global entries are visible to the owning
/// agent in every session; the row stores global scope as an empty string so
/// the composite primary key stays total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryScope {
    Global,
    Session(String),
    /// `list_memory` only: enumerate global plus every session scope.
    All,
}

impl MemoryScope {
    pub fn from_option(session_id: Option<&str>) -> Result<Self, ContextError> {
        match session_id {
            None => Ok(MemoryScope::Global),
            Some("all") => Ok(MemoryScope::All),
            Some(id) => {
                validate::validate_session_id(id)?;
                Ok(MemoryScope::Session(id.to_string()))
            }
        }
    }

    fn column_value(&self) -> Option<String> {
        match self {
            MemoryScope::Global => Some(String::new()),
            MemoryScope::Session(id) => Some(id.clone()),
            MemoryScope::All => None,
        }
    }
}

#[derive(Debug)]
pub struct SetOptions {
    pub scope: Option<String>,
    pub expires_in: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub overwrite: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            scope: None,
            expires_in: None,
            metadata: None,
            overwrite: true,
        }
    }
}

/// One row of `list_memory` output: the key and its footprint, never the
/// value itself.
#[derive(Debug, serde::Serialize)]
pub struct MemoryKeyInfo {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub size_bytes: i64,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

/// Per-agent key/value store with TTL. Every operation is scoped to the
/// calling agent; there is no cross-agent read path at all.
#[derive(Clone)]
pub struct MemoryStore {
    store: Store,
    audit: AuditLog,
    hub: Arc<NotificationHub>,
}

impl MemoryStore {
    pub fn new(store: Store, audit: AuditLog, hub: Arc<NotificationHub>) -> Self {
        Self { store, audit, hub }
    }

    /// Deletes this agent's expired rows. Run inline before reads; the
    /// periodic sweeper handles everyone else's.
    async fn expire_inline(&self, agent_id: &str) -> Result<(), ContextError> {
        self.store
            .execute(
                "DELETE FROM agent_memory WHERE agent_id = :agent_id AND expires_at IS NOT NULL AND expires_at < :now",
                &[("agent_id", json!(agent_id)), ("now", json!(now_ts()))],
            )
            .await?;
        Ok(())
    }

    pub async fn set_memory(
        &self,
        key: &str,
        value: &serde_json::Value,
        opts: SetOptions,
    ) -> Result<(), ContextError> {
        let caller = auth_ctx::current();
        validate::validate_memory_key(key)?;
        let scope = MemoryScope::from_option(opts.scope.as_deref())?;
        let Some(scope_value) = scope.column_value() else {
            return Err(ContextError::Validation(
                "'all' is not a valid scope for set_memory".to_string(),
            ));
        };

        let serialized = serde_json::to_string(value)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        if serialized.len() > validate::MAX_MEMORY_VALUE_BYTES {
            return Err(ContextError::Validation(format!(
                "Memory value exceeds {} bytes",
                validate::MAX_MEMORY_VALUE_BYTES
            )));
        }

        let expires_at = match opts.expires_in {
            Some(ttl) => {
                if !(MIN_TTL_SECS..=MAX_TTL_SECS).contains(&ttl) {
                    return Err(ContextError::Validation(format!(
                        "expires_in must be between {MIN_TTL_SECS} and {MAX_TTL_SECS} seconds"
                    )));
                }
                Some(now_ts() + ttl as f64)
            }
            None => None,
        };

        self.expire_inline(&caller.agent_id).await?;

        const UPSERT: &str =
            "INSERT INTO agent_memory (agent_id, session_id, key, value, metadata, created_at, updated_at, expires_at)
             VALUES (:agent_id, :scope, :key, :value, :metadata, :now, :now, :expires_at)
             ON CONFLICT(agent_id, session_id, key) DO UPDATE SET
               value = excluded.value,
               metadata = excluded.metadata,
               updated_at = excluded.updated_at,
               expires_at = excluded.expires_at";
        const INSERT_IF_ABSENT: &str =
            "INSERT INTO agent_memory (agent_id, session_id, key, value, metadata, created_at, updated_at, expires_at)
             VALUES (:agent_id, :scope, :key, :value, :metadata, :now, :now, :expires_at)
             ON CONFLICT(agent_id, session_id, key) DO NOTHING";

        let metadata = opts.metadata.as_ref().map(validate::sanitize_json);
        let metadata_text = metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        let now = now_ts();
        let insert_params: Vec<(&str, serde_json::Value)> = vec![
            ("agent_id", json!(caller.agent_id)),
            ("scope", json!(scope_value)),
            ("key", json!(key)),
            ("value", json!(serialized)),
            (
                "metadata",
                metadata_text.map(|m| json!(m)).unwrap_or(serde_json::Value::Null),
            ),
            ("now", json!(now)),
            (
                "expires_at",
                expires_at.map(|e| json!(e)).unwrap_or(serde_json::Value::Null),
            ),
        ];

        if opts.overwrite {
            self.store.execute(UPSERT, &insert_params).await?;
        } else {
            // The existence check must be atomic with the write: a separate
            // SELECT would let two concurrent no-overwrite writers both pass
            // it and the second would clobber the first through DO UPDATE.
            let done = self.store.execute(INSERT_IF_ABSENT, &insert_params).await?;
            if done.rows_affected == 0 {
                use sqlx::Row;
                let rows = self
                    .store
                    .query(
                        "SELECT expires_at FROM agent_memory
                         WHERE agent_id = :agent_id AND session_id = :scope AND key = :key",
                        &[
                            ("agent_id", json!(caller.agent_id)),
                            ("scope", json!(scope_value)),
                            ("key", json!(key)),
                        ],
                    )
                    .await?;
                let still_live = rows
                    .first()
                    .map(|row| {
                        row.get::<Option<f64>, _>("expires_at")
                            .map_or(true, |exp| exp >= now_ts())
                    })
                    .unwrap_or(false);
                if still_live {
                    return Err(ContextError::KeyExists(key.to_string()));
                }
                // The conflicting row is expired, so the key is logically
                // absent: claim it with the full upsert.
                self.store.execute(UPSERT, &insert_params).await?;
            }
        }

        self.audit.record(
            "memory_set",
            &caller.agent_id,
            match &scope {
                MemoryScope::Session(id) => Some(id.as_str()),
                _ => None,
            },
            Some(json!({ "key": key, "ttl": opts.expires_in })),
        );
        self.hub.notify(
            &format!("agent://{}/memory", caller.agent_id),
            NotificationPayload::new(
                "agent_event",
                json!({ "agent_id": caller.agent_id, "key": key, "action": "set" }),
            ),
            Duration::from_millis(100),
        );
        Ok(())
    }

    pub async fn get_memory(
        &self,
        key: &str,
        session_id: Option<&str>,
    ) -> Result<MemoryEntry, ContextError> {
        use sqlx::Row;
        let caller = auth_ctx::current();
        validate::validate_memory_key(key)?;
        let scope = MemoryScope::from_option(session_id)?;
        let Some(scope_value) = scope.column_value() else {
            return Err(ContextError::Validation(
                "'all' is not a valid scope for get_memory".to_string(),
            ));
        };

        self.expire_inline(&caller.agent_id).await?;

        let rows = self
            .store
            .query(
                "SELECT * FROM agent_memory
                 WHERE agent_id = :agent_id AND session_id = :scope AND key = :key",
                &[
                    ("agent_id", json!(caller.agent_id)),
                    ("scope", json!(scope_value)),
                    ("key", json!(key)),
                ],
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| ContextError::MemoryNotFound(key.to_string()))?;

        let value: serde_json::Value = serde_json::from_str(&row.get::<String, _>("value"))
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        Ok(MemoryEntry {
            key: row.get("key"),
            value,
            metadata: row
                .get::<Option<String>, _>("metadata")
                .and_then(|s| serde_json::from_str(&s).ok()),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            expires_at: row.get("expires_at"),
        })
    }

    /// Lists this agent's keys with sizes, excluding expired entries.
    pub async fn list_memory(
        &self,
        session_id: Option<&str>,
        prefix: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<MemoryKeyInfo>, ContextError> {
        use sqlx::Row;
        let caller = auth_ctx::current();
        let scope = MemoryScope::from_option(session_id)?;

        self.expire_inline(&caller.agent_id).await?;

        let mut sql = String::from(
            "SELECT key, session_id, LENGTH(value) AS size_bytes, created_at, updated_at, expires_at
             FROM agent_memory WHERE agent_id = :agent_id",
        );
        let mut params: Vec<(&str, serde_json::Value)> =
            vec![("agent_id", json!(caller.agent_id))];

        if let Some(scope_value) = scope.column_value() {
            sql.push_str(" AND session_id = :scope");
            params.push(("scope", json!(scope_value)));
        }
        if let Some(prefix) = prefix {
            // LIKE is fine here: the pattern is escaped and anchored.
            let escaped = prefix.replace('%', "\\%").replace('_', "\\_");
            sql.push_str(" AND key LIKE :prefix ESCAPE '\\'");
            params.push(("prefix", json!(format!("{escaped}%"))));
        }

        let limit = limit.unwrap_or(50).clamp(1, MAX_LIST_LIMIT);
        sql.push_str(" ORDER BY session_id ASC, key ASC LIMIT :limit");
        params.push(("limit", json!(limit)));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let session: String = row.get("session_id");
                MemoryKeyInfo {
                    key: row.get("key"),
                    session_id: (!session.is_empty()).then_some(session),
                    size_bytes: row.get("size_bytes"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                    expires_at: row.get("expires_at"),
                }
            })
            .collect())
    }

    pub async fn delete_memory(
        &self,
        key: &str,
        session_id: Option<&str>,
    ) -> Result<(), ContextError> {
        let caller = auth_ctx::current();
        validate::validate_memory_key(key)?;
        let scope = MemoryScope::from_option(session_id)?;
        let Some(scope_value) = scope.column_value() else {
            return Err(ContextError::Validation(
                "'all' is not a valid scope for delete_memory".to_string(),
            ));
        };

        let done = self
            .store
            .execute(
                "DELETE FROM agent_memory
                 WHERE agent_id = :agent_id AND session_id = :scope AND key = :key",
                &[
                    ("agent_id", json!(caller.agent_id)),
                    ("scope", json!(scope_value)),
                    ("key", json!(key)),
                ],
            )
            .await?;
        if done.rows_affected == 0 {
            return Err(ContextError::MemoryNotFound(key.to_string()));
        }

        self.audit.record(
            "memory_deleted",
            &caller.agent_id,
            match &scope {
                MemoryScope::Session(id) => Some(id.as_str()),
                _ => None,
            },
            Some(json!({ "key": key })),
        );
        Ok(())
    }

    /// The full memory view for the `agent://{id}/memory` resource, grouped
    /// into global entries and per-session maps.
    pub async fn grouped_memory(&self) -> Result<serde_json::Value, ContextError> {
        use sqlx::Row;
        let caller = auth_ctx::current();
        self.expire_inline(&caller.agent_id).await?;

        let rows = self
            .store
            .query(
                "SELECT * FROM agent_memory WHERE agent_id = :agent_id ORDER BY session_id, key",
                &[("agent_id", json!(caller.agent_id))],
            )
            .await?;

        let mut global = serde_json::Map::new();
        let mut sessions = serde_json::Map::new();
        for row in &rows {
            let session: String = row.get("session_id");
            let key: String = row.get("key");
            let value: serde_json::Value =
                serde_json::from_str(&row.get::<String, _>("value")).unwrap_or(serde_json::Value::Null);
            let entry = json!({
                "value": value,
                "created_at": row.get::<f64, _>("created_at"),
                "updated_at": row.get::<f64, _>("updated_at"),
                "expires_at": row.get::<Option<f64>, _>("expires_at"),
            });
            if session.is_empty() {
                global.insert(key, entry);
            } else {
                sessions
                    .entry(session)
                    .or_insert_with(|| json!({}))
                    .as_object_mut()
                    .expect("session group is an object")
                    .insert(key, entry);
            }
        }

        Ok(json!({ "global": global, "sessions": sessions }))
    }

    /// Periodic sweep across all agents; bounds storage growth.
    pub async fn sweep_expired(&self) -> Result<u64, ContextError> {
        let done = self
            .store
            .execute(
                "DELETE FROM agent_memory WHERE expires_at IS NOT NULL AND expires_at < :now",
                &[("now", json!(now_ts()))],
            )
            .await?;
        Ok(done.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::auth_ctx::{with_auth, AuthContext};
    use crate::context::types::Permission;

    fn agent(agent_id: &str) -> AuthContext {
        AuthContext {
            agent_id: agent_id.to_string(),
            agent_type: "claude".to_string(),
            permissions: vec![Permission::Read, Permission::Write],
            authenticated: true,
            auth_method: Some("jwt".to_string()),
        }
    }

    async fn memory() -> MemoryStore {
        let store = Store::connect_memory().await.unwrap();
        let (audit, _rx) = AuditLog::new(store.clone());
        MemoryStore::new(store, audit, NotificationHub::new())
    }

    #[tokio::test]
    async fn set_then_get_round_trip() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory("k", &json!({"x": 1}), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            let entry = mem.get_memory("k", None).await.unwrap();
            assert_eq!(entry.value, json!({"x": 1}));
            assert!(entry.expires_at.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn memory_is_agent_scoped() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory("shared", &json!(1), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
        })
        .await;
        let err = with_auth(agent("a2"), mem.get_memory("shared", None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MEMORY_NOT_FOUND");
    }

    #[tokio::test]
    async fn expired_entries_are_logically_absent() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory(
                "ttl-key",
                &json!("v"),
                SetOptions { expires_in: Some(1), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();
            // Visible before expiry…
            assert!(mem.get_memory("ttl-key", None).await.is_ok());
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
            // …gone after.
            let err = mem.get_memory("ttl-key", None).await.unwrap_err();
            assert_eq!(err.code(), "MEMORY_NOT_FOUND");
        })
        .await;
    }

    #[tokio::test]
    async fn overwrite_false_reports_key_exists() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory("k", &json!(1), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            let err = mem
                .set_memory("k", &json!(2), SetOptions { overwrite: false, ..Default::default() })
                .await
                .unwrap_err();
            assert_eq!(err.code(), "KEY_EXISTS");
            // Original value untouched.
            assert_eq!(mem.get_memory("k", None).await.unwrap().value, json!(1));
        })
        .await;
    }

    #[tokio::test]
    async fn overwrite_false_claims_expired_key() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory(
                "k",
                &json!("old"),
                SetOptions { expires_in: Some(1), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

            // The key is logically absent once expired, so a no-overwrite
            // write must take it.
            mem.set_memory("k", &json!("new"), SetOptions { overwrite: false, ..Default::default() })
                .await
                .unwrap();
            assert_eq!(mem.get_memory("k", None).await.unwrap().value, json!("new"));
        })
        .await;
    }

    #[tokio::test]
    async fn session_scope_is_separate_from_global() {
        let mem = memory().await;
        let sid = "session_0123456789abcdef";
        with_auth(agent("a1"), async {
            mem.set_memory("k", &json!("global"), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            mem.set_memory(
                "k",
                &json!("scoped"),
                SetOptions { scope: Some(sid.to_string()), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();

            assert_eq!(mem.get_memory("k", None).await.unwrap().value, json!("global"));
            assert_eq!(mem.get_memory("k", Some(sid)).await.unwrap().value, json!("scoped"));
        })
        .await;
    }

    #[tokio::test]
    async fn list_all_spans_scopes_and_prefix_filters() {
        let mem = memory().await;
        let sid = "session_0123456789abcdef";
        with_auth(agent("a1"), async {
            mem.set_memory("plan.a", &json!(1), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            mem.set_memory(
                "plan.b",
                &json!(2),
                SetOptions { scope: Some(sid.to_string()), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();
            mem.set_memory("other", &json!(3), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();

            let all = mem.list_memory(Some("all"), None, None).await.unwrap();
            assert_eq!(all.len(), 3);

            let plans = mem.list_memory(Some("all"), Some("plan."), None).await.unwrap();
            assert_eq!(plans.len(), 2);

            let global_only = mem.list_memory(None, None, None).await.unwrap();
            assert_eq!(global_only.len(), 2);
        })
        .await;
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory("k", &json!(1), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            mem.delete_memory("k", None).await.unwrap();
            assert_eq!(
                mem.get_memory("k", None).await.unwrap_err().code(),
                "MEMORY_NOT_FOUND"
            );
            assert_eq!(
                mem.delete_memory("k", None).await.unwrap_err().code(),
                "MEMORY_NOT_FOUND"
            );
        })
        .await;
    }

    #[tokio::test]
    async fn grouped_memory_splits_global_and_sessions() {
        let mem = memory().await;
        let sid = "session_0123456789abcdef";
        with_auth(agent("a1"), async {
            mem.set_memory("g", &json!(1), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
            mem.set_memory(
                "s",
                &json!(2),
                SetOptions { scope: Some(sid.to_string()), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();

            let grouped = mem.grouped_memory().await.unwrap();
            assert!(grouped["global"]["g"]["value"] == json!(1));
            assert!(grouped["sessions"][sid]["s"]["value"] == json!(2));
        })
        .await;
    }

    #[tokio::test]
    async fn sweeper_removes_expired_rows() {
        let mem = memory().await;
        with_auth(agent("a1"), async {
            mem.set_memory(
                "gone",
                &json!(1),
                SetOptions { expires_in: Some(1), overwrite: true, ..Default::default() },
            )
            .await
            .unwrap();
            mem.set_memory("stays", &json!(2), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
        })
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let swept = mem.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
    }
}
