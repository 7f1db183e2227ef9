use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::context::audit::AuditFilter;
use crate::context::auth_ctx::{self, require_permission};
use crate::context::locks::LockType;
use crate::context::memory::SetOptions;
use crate::context::message::{AdvancedQuery, MessageQuery, NOTIFY_DEBOUNCE};
use crate::context::notify::NotificationPayload;
use crate::context::search::SearchOptions;
use crate::context::types::{ContextError, Permission, Visibility};
use crate::context::validate;
use crate::routes::error::ok;
use crate::state::AppState;

type ToolResult = Result<Json<Value>, ContextError>;

// ─────────────────────────────────────────────────────────
//  SESSION TOOLS
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionParams {
    pub purpose: String,
    pub metadata: Option<Value>,
}

/// POST /tools/create_session
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CreateSessionParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    let session = state
        .sessions
        .create_session(&params.purpose, params.metadata.as_ref())
        .await?;
    Ok(ok(json!({
        "session_id": session.id,
        "created_by": session.created_by,
        "created_at": session.created_at,
    })))
}

#[derive(Deserialize)]
pub struct GetSessionParams {
    pub session_id: String,
}

/// POST /tools/get_session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Json(params): Json<GetSessionParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let session = state.sessions.get_session(&params.session_id).await?;
    let recent = state.messages.recent_messages(&params.session_id, 50).await?;
    let message_count = recent.len();
    Ok(ok(json!({
        "session": session,
        "messages": recent,
        "message_count": message_count,
    })))
}

#[derive(Deserialize)]
pub struct SetSessionActiveParams {
    pub session_id: String,
    pub active: bool,
}

/// POST /tools/set_session_active — admin housekeeping for stale sessions.
pub async fn set_session_active(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SetSessionActiveParams>,
) -> ToolResult {
    require_permission(Permission::Admin)?;
    state
        .sessions
        .set_session_active(&params.session_id, params.active)
        .await?;
    Ok(ok(json!({ "session_id": params.session_id, "is_active": params.active })))
}

// ─────────────────────────────────────────────────────────
//  MESSAGE TOOLS
// ─────────────────────────────────────────────────────────

fn default_visibility() -> Visibility {
    Visibility::Public
}

#[derive(Deserialize)]
pub struct AddMessageParams {
    pub session_id: String,
    pub content: String,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    pub metadata: Option<Value>,
    pub parent_message_id: Option<i64>,
}

/// POST /tools/add_message
pub async fn add_message(
    State(state): State<Arc<AppState>>,
    Json(params): Json<AddMessageParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    let message = state
        .messages
        .add_message(
            &params.session_id,
            &params.content,
            params.visibility,
            params.metadata.as_ref(),
            params.parent_message_id,
        )
        .await?;
    Ok(ok(json!({
        "message_id": message.id,
        "timestamp": message.timestamp,
        "visibility": message.visibility,
    })))
}

#[derive(Deserialize)]
pub struct GetMessagesParams {
    pub session_id: String,
    #[serde(flatten)]
    pub query: MessageQuery,
}

/// POST /tools/get_messages
pub async fn get_messages(
    State(state): State<Arc<AppState>>,
    Json(params): Json<GetMessagesParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let messages = state
        .messages
        .get_messages(&params.session_id, &params.query)
        .await?;
    let count = messages.len();
    Ok(ok(json!({ "messages": messages, "count": count })))
}

#[derive(Deserialize)]
pub struct GetMessagesAdvancedParams {
    pub session_id: String,
    #[serde(flatten)]
    pub query: AdvancedQuery,
}

/// POST /tools/get_messages_advanced
pub async fn get_messages_advanced(
    State(state): State<Arc<AppState>>,
    Json(params): Json<GetMessagesAdvancedParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let messages = state
        .messages
        .get_messages_advanced(&params.session_id, &params.query)
        .await?;
    let count = messages.len();
    Ok(ok(json!({ "messages": messages, "count": count })))
}

#[derive(Deserialize)]
pub struct SetVisibilityParams {
    pub message_id: i64,
    pub visibility: Visibility,
    pub reason: Option<String>,
}

/// POST /tools/set_message_visibility
pub async fn set_message_visibility(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SetVisibilityParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    state
        .messages
        .set_message_visibility(params.message_id, params.visibility, params.reason.as_deref())
        .await?;
    Ok(ok(json!({ "message_id": params.message_id, "visibility": params.visibility })))
}

// ─────────────────────────────────────────────────────────
//  SEARCH TOOLS
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SearchContextParams {
    pub session_id: String,
    pub query: String,
    #[serde(flatten)]
    pub options: SearchOptions,
}

/// POST /tools/search_context
pub async fn search_context(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SearchContextParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let results = state
        .search
        .search_context(&params.session_id, &params.query, &params.options)
        .await?;
    let count = results.len();
    Ok(ok(json!({ "results": results, "count": count, "query": params.query })))
}

#[derive(Deserialize)]
pub struct SearchBySenderParams {
    pub session_id: String,
    pub sender: String,
    pub limit: Option<i64>,
}

/// POST /tools/search_by_sender
pub async fn search_by_sender(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SearchBySenderParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let messages = state
        .search
        .search_by_sender(&params.session_id, &params.sender, params.limit)
        .await?;
    let count = messages.len();
    Ok(ok(json!({ "messages": messages, "count": count, "sender": params.sender })))
}

#[derive(Deserialize)]
pub struct SearchByTimerangeParams {
    pub session_id: String,
    pub start_ts: f64,
    pub end_ts: f64,
    pub limit: Option<i64>,
}

/// POST /tools/search_by_timerange
pub async fn search_by_timerange(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SearchByTimerangeParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let messages = state
        .search
        .search_by_timerange(&params.session_id, params.start_ts, params.end_ts, params.limit)
        .await?;
    let count = messages.len();
    Ok(ok(json!({ "messages": messages, "count": count })))
}

// ─────────────────────────────────────────────────────────
//  MEMORY TOOLS
// ─────────────────────────────────────────────────────────

fn default_overwrite() -> bool {
    true
}

#[derive(Deserialize)]
pub struct SetMemoryParams {
    pub key: String,
    pub value: Value,
    pub session_id: Option<String>,
    pub expires_in: Option<i64>,
    pub metadata: Option<Value>,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

/// POST /tools/set_memory
pub async fn set_memory(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SetMemoryParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    state
        .memory
        .set_memory(
            &params.key,
            &params.value,
            SetOptions {
                scope: params.session_id.clone(),
                expires_in: params.expires_in,
                metadata: params.metadata,
                overwrite: params.overwrite,
            },
        )
        .await?;
    Ok(ok(json!({ "key": params.key, "session_id": params.session_id })))
}

#[derive(Deserialize)]
pub struct GetMemoryParams {
    pub key: String,
    pub session_id: Option<String>,
}

/// POST /tools/get_memory
pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Json(params): Json<GetMemoryParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let entry = state
        .memory
        .get_memory(&params.key, params.session_id.as_deref())
        .await?;
    Ok(ok(json!({
        "key": entry.key,
        "value": entry.value,
        "metadata": entry.metadata,
        "created_at": entry.created_at,
        "updated_at": entry.updated_at,
        "expires_at": entry.expires_at,
    })))
}

#[derive(Deserialize)]
pub struct ListMemoryParams {
    pub session_id: Option<String>,
    pub prefix: Option<String>,
    pub limit: Option<i64>,
}

/// POST /tools/list_memory
pub async fn list_memory(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ListMemoryParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let keys = state
        .memory
        .list_memory(
            params.session_id.as_deref(),
            params.prefix.as_deref(),
            params.limit,
        )
        .await?;
    let count = keys.len();
    Ok(ok(json!({ "keys": keys, "count": count })))
}

#[derive(Deserialize)]
pub struct DeleteMemoryParams {
    pub key: String,
    pub session_id: Option<String>,
}

/// POST /tools/delete_memory
pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Json(params): Json<DeleteMemoryParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    state
        .memory
        .delete_memory(&params.key, params.session_id.as_deref())
        .await?;
    Ok(ok(json!({ "key": params.key, "deleted": true })))
}

// ─────────────────────────────────────────────────────────
//  IDENTITY TOOLS (public — no permission gate)
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AuthenticateParams {
    pub agent_id: String,
    pub agent_type: String,
    pub api_key: String,
    #[serde(default)]
    pub requested_permissions: Vec<String>,
}

/// POST /tools/authenticate_agent
pub async fn authenticate_agent(
    State(state): State<Arc<AppState>>,
    Json(params): Json<AuthenticateParams>,
) -> ToolResult {
    validate::validate_agent_id(&params.agent_id)?;
    if params.agent_type.trim().is_empty() {
        return Err(ContextError::Validation(
            "agent_type must not be empty".to_string(),
        ));
    }

    let grant = match state
        .tokens
        .authenticate(
            &params.agent_id,
            &params.agent_type,
            &params.api_key,
            &params.requested_permissions,
        )
        .await
    {
        Ok(grant) => grant,
        Err(err) => {
            state.audit.record("auth_failed", &params.agent_id, None, None);
            return Err(err);
        }
    };

    state.audit.record(
        "agent_authenticated",
        &grant.agent_id,
        None,
        Some(json!({ "agent_type": grant.agent_type })),
    );
    Ok(ok(json!({
        "token": grant.token,
        "agent_id": grant.agent_id,
        "agent_type": grant.agent_type,
        "permissions": grant.permissions,
        "expires_at": grant.expires_at,
        "token_type": "Bearer",
    })))
}

#[derive(Deserialize)]
pub struct RefreshTokenParams {
    pub token: String,
}

/// POST /tools/refresh_token
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(params): Json<RefreshTokenParams>,
) -> ToolResult {
    let grant = state.tokens.refresh(&params.token).await?;
    state.audit.record("token_refreshed", &grant.agent_id, None, None);
    Ok(ok(json!({
        "token": grant.token,
        "agent_id": grant.agent_id,
        "permissions": grant.permissions,
        "expires_at": grant.expires_at,
        "token_type": "Bearer",
    })))
}

// ─────────────────────────────────────────────────────────
//  COORDINATION TOOLS
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PresenceParams {
    pub session_id: Option<String>,
    pub status: Option<String>,
}

/// POST /tools/register_agent_presence
pub async fn register_agent_presence(
    State(state): State<Arc<AppState>>,
    Json(params): Json<PresenceParams>,
) -> ToolResult {
    require_permission(Permission::Write)?;
    if let Some(sid) = params.session_id.as_deref() {
        validate::validate_session_id(sid)?;
    }
    let entry = state
        .presence
        .register(params.session_id.as_deref(), params.status.as_deref());
    Ok(ok(json!({ "agent": entry })))
}

#[derive(Deserialize)]
pub struct ActiveAgentsParams {
    pub session_id: Option<String>,
}

/// POST /tools/get_active_agents
pub async fn get_active_agents(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ActiveAgentsParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let agents = state.presence.active_agents(params.session_id.as_deref());
    let count = agents.len();
    Ok(ok(json!({ "agents": agents, "count": count })))
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationAction {
    Lock,
    Unlock,
    Notify,
    Status,
}

#[derive(Deserialize)]
pub struct CoordinateParams {
    pub session_id: String,
    pub action: CoordinationAction,
    pub lock_type: Option<LockType>,
    pub message: Option<String>,
}

/// POST /tools/coordinate_session_work — lock/unlock/notify/status over a
/// single session's in-memory coordination lock.
pub async fn coordinate_session_work(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CoordinateParams>,
) -> ToolResult {
    let caller = require_permission(Permission::Write)?;
    validate::validate_session_id(&params.session_id)?;
    // The lock table is independent of the store, but locking a session
    // nobody created is always a caller bug.
    state.sessions.get_session(&params.session_id).await?;

    match params.action {
        CoordinationAction::Lock => {
            let lock = state
                .locks
                .acquire(&params.session_id, params.lock_type.unwrap_or(LockType::Write))?;
            state.audit.record(
                "session_locked",
                &caller.agent_id,
                Some(&params.session_id),
                Some(json!({ "lock_type": lock.lock_type })),
            );
            Ok(ok(json!({ "lock": lock })))
        }
        CoordinationAction::Unlock => {
            state.locks.release(&params.session_id)?;
            state.audit.record(
                "session_unlocked",
                &caller.agent_id,
                Some(&params.session_id),
                None,
            );
            Ok(ok(json!({ "session_id": params.session_id, "unlocked": true })))
        }
        CoordinationAction::Notify => {
            let text = params.message.as_deref().unwrap_or("");
            state.hub.notify(
                &format!("session://{}", params.session_id),
                NotificationPayload::new(
                    "agent_event",
                    json!({
                        "event": "coordination_message",
                        "session_id": params.session_id,
                        "from": caller.agent_id,
                        "message": validate::sanitize_text(text),
                    }),
                ),
                NOTIFY_DEBOUNCE,
            );
            Ok(ok(json!({ "session_id": params.session_id, "notified": true })))
        }
        CoordinationAction::Status => {
            let lock = state.locks.status(&params.session_id);
            Ok(ok(json!({
                "session_id": params.session_id,
                "locked": lock.is_some(),
                "lock": lock,
            })))
        }
    }
}

// ─────────────────────────────────────────────────────────
//  ADMIN / OBSERVABILITY TOOLS
// ─────────────────────────────────────────────────────────

/// POST /tools/get_audit_log
pub async fn get_audit_log(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<AuditFilter>,
) -> ToolResult {
    require_permission(Permission::Admin)?;
    let entries = state.audit.query(&filter).await?;
    let count = entries.len();
    Ok(ok(json!({ "entries": entries, "count": count })))
}

#[derive(Deserialize)]
pub struct ActivitySummaryParams {
    pub agent_id: Option<String>,
}

/// POST /tools/get_agent_activity_summary
pub async fn get_agent_activity_summary(
    State(state): State<Arc<AppState>>,
    Json(params): Json<ActivitySummaryParams>,
) -> ToolResult {
    require_permission(Permission::Read)?;
    let summary = state
        .presence
        .activity_summary(&state.store, params.agent_id.as_deref())
        .await?;
    Ok(ok(json!({ "summary": summary })))
}

/// POST /tools/get_performance_metrics
pub async fn get_performance_metrics(State(state): State<Arc<AppState>>) -> ToolResult {
    require_permission(Permission::Admin)?;
    let health = state.store.health_check().await;
    let (pool_size, pool_idle) = state.store.pool_stats();
    let caller = auth_ctx::current();
    tracing::debug!(agent = %caller.agent_id, "[Metrics] performance snapshot requested");
    Ok(ok(json!({
        "uptime_s": state.started_at.elapsed().as_secs(),
        "database": { "ok": health.ok, "latency_ms": health.latency_ms },
        "pool": { "size": pool_size, "idle": pool_idle },
        "subscribers": state.hub.subscriber_count(),
        "subscriptions": state.hub.subscription_count(),
        "active_locks": state.locks.active_count(),
        "active_agents": state.presence.active_count(),
    })))
}
