use rand::RngCore;
use serde_json::json;

use crate::context::audit::AuditLog;
use crate::context::auth_ctx;
use crate::context::types::{now_ts, ContextError, Session};
use crate::context::validate;
use crate::db::Store;

/// Creates and looks up sessions. Sessions are never deleted — deactivation
/// is a soft, one-way flag.
#[derive(Clone)]
pub struct SessionRegistry {
    store: Store,
    audit: AuditLog,
}

impl SessionRegistry {
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    fn new_session_id() -> String {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        format!("session_{}", hex::encode(bytes))
    }

    /// Persists a new session owned by the calling agent and returns it.
    pub async fn create_session(
        &self,
        purpose: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Session, ContextError> {
        let caller = auth_ctx::current();
        let purpose = validate::sanitize_text(purpose);
        if purpose.is_empty() {
            return Err(ContextError::Validation(
                "Session purpose must not be empty".to_string(),
            ));
        }
        let metadata = metadata.map(validate::sanitize_json);

        let session = Session {
            id: Self::new_session_id(),
            purpose,
            created_by: caller.agent_id.clone(),
            created_at: now_ts(),
            updated_at: now_ts(),
            is_active: true,
            metadata,
        };

        let metadata_text = session
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());
        self.store
            .execute(
                "INSERT INTO sessions (id, purpose, created_by, created_at, updated_at, is_active, metadata)
                 VALUES (:id, :purpose, :created_by, :created_at, :updated_at, 1, :metadata)",
                &[
                    ("id", json!(session.id)),
                    ("purpose", json!(session.purpose)),
                    ("created_by", json!(session.created_by)),
                    ("created_at", json!(session.created_at)),
                    ("updated_at", json!(session.updated_at)),
                    (
                        "metadata",
                        metadata_text.map(|m| json!(m)).unwrap_or(serde_json::Value::Null),
                    ),
                ],
            )
            .await?;

        self.audit.record(
            "session_created",
            &caller.agent_id,
            Some(&session.id),
            Some(json!({ "purpose": session.purpose })),
        );
        tracing::info!(session_id = %session.id, agent = %caller.agent_id, "🆕 [Session] created");

        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ContextError> {
        validate::validate_session_id(session_id)?;
        let rows = self
            .store
            .query(
                "SELECT * FROM sessions WHERE id = :id",
                &[("id", json!(session_id))],
            )
            .await?;
        rows.first()
            .map(Session::from_row)
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    /// Flips the active flag. Admin gate lives at the tool layer.
    pub async fn set_session_active(
        &self,
        session_id: &str,
        active: bool,
    ) -> Result<(), ContextError> {
        validate::validate_session_id(session_id)?;
        let caller = auth_ctx::current();
        let done = self
            .store
            .execute(
                "UPDATE sessions SET is_active = :active, updated_at = :now WHERE id = :id",
                &[
                    ("active", json!(active as i64)),
                    ("now", json!(now_ts())),
                    ("id", json!(session_id)),
                ],
            )
            .await?;
        if done.rows_affected == 0 {
            return Err(ContextError::SessionNotFound(session_id.to_string()));
        }
        self.audit.record(
            if active { "session_activated" } else { "session_deactivated" },
            &caller.agent_id,
            Some(session_id),
            None,
        );
        Ok(())
    }

    /// Bumps `updated_at`; called whenever a message lands in the session.
    pub async fn touch(&self, session_id: &str) -> Result<(), ContextError> {
        self.store
            .execute(
                "UPDATE sessions SET updated_at = :now WHERE id = :id",
                &[("now", json!(now_ts())), ("id", json!(session_id))],
            )
            .await?;
        Ok(())
    }
}
