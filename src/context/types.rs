use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// Per-message access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
    AgentOnly,
    AdminOnly,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::AgentOnly => "agent_only",
            Visibility::AdminOnly => "admin_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            "agent_only" => Some(Visibility::AgentOnly),
            "admin_only" => Some(Visibility::AdminOnly),
            _ => None,
        }
    }
}

/// Capability grants carried by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
    Debug,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
            Permission::Debug => "debug",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            "debug" => Some(Permission::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub purpose: String,
    pub created_by: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub is_active: bool,
    pub metadata: Option<serde_json::Value>,
}

impl Session {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            purpose: row.get("purpose"),
            created_by: row.get("created_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            is_active: row.get::<i64, _>("is_active") != 0,
            metadata: row
                .get::<Option<String>, _>("metadata")
                .and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub sender: String,
    pub sender_type: String,
    pub content: String,
    pub visibility: Visibility,
    pub message_type: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: f64,
    pub parent_message_id: Option<i64>,
}

impl Message {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            session_id: row.get("session_id"),
            sender: row.get("sender"),
            sender_type: row.get("sender_type"),
            content: row.get("content"),
            visibility: Visibility::parse(row.get::<String, _>("visibility").as_str())
                .unwrap_or(Visibility::Public),
            message_type: row.get("message_type"),
            metadata: row
                .get::<Option<String>, _>("metadata")
                .and_then(|s| serde_json::from_str(&s).ok()),
            timestamp: row.get("timestamp"),
            parent_message_id: row.get("parent_message_id"),
        }
    }
}

/// One agent-memory row as returned to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: f64,
}

/// Seconds since the Unix epoch, as stored in every timestamp column.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// ISO-8601 timestamp for response envelopes and notification payloads.
pub fn now_iso() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339()
}

/// The error currency of the whole engine. Every variant maps onto one of
/// the canonical envelope codes.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(i64),
    #[error("memory entry not found: {0}")]
    MemoryNotFound(String),
    #[error("memory key already exists: {0}")]
    KeyExists(String),
    #[error("value serialization failed: {0}")]
    Serialization(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Deliberately message-free: callers must not learn whether the agent,
    /// key, or token was wrong.
    #[error("authentication failed")]
    AuthFailed,
    #[error("session is locked by {0}")]
    SessionLocked(String),
    #[error("no lock held on session {0}")]
    NoLockHeld(String),
    #[error("{0}")]
    Validation(String),
    #[error("internal error")]
    Internal(String),
}

impl ContextError {
    pub fn code(&self) -> &'static str {
        match self {
            ContextError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ContextError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            ContextError::MemoryNotFound(_) => "MEMORY_NOT_FOUND",
            ContextError::KeyExists(_) => "KEY_EXISTS",
            ContextError::Serialization(_) => "SERIALIZATION_ERROR",
            ContextError::PermissionDenied(_) => "PERMISSION_DENIED",
            ContextError::AuthFailed => "AUTH_FAILED",
            ContextError::SessionLocked(_) => "SESSION_LOCKED",
            ContextError::NoLockHeld(_) => "NO_LOCK_HELD",
            ContextError::Validation(_) => "VALIDATION_ERROR",
            ContextError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn severity(&self) -> &'static str {
        match self {
            ContextError::Validation(_) => "warning",
            ContextError::SessionNotFound(_)
            | ContextError::MessageNotFound(_)
            | ContextError::MemoryNotFound(_)
            | ContextError::KeyExists(_)
            | ContextError::NoLockHeld(_) => "info",
            _ => "error",
        }
    }

    /// Human text safe to put on the wire. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ContextError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<crate::db::StoreError> for ContextError {
    fn from(err: crate::db::StoreError) -> Self {
        match &err {
            crate::db::StoreError::Programmer(detail) => {
                tracing::error!(error = %detail, "❌ [Store] programmer error");
            }
            other => {
                tracing::error!(error = %other, "❌ [Store] database failure");
            }
        }
        ContextError::Internal(err.to_string())
    }
}
