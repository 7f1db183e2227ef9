use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::context::auth_ctx::{self, require_permission};
use crate::context::message::MessageQuery;
use crate::context::types::{ContextError, Permission};
use crate::routes::error::ok;
use crate::state::AppState;

/// GET /resources/session/:session_id — the `session://{id}` resource:
/// session record, caller-visible messages, and aggregate statistics.
pub async fn session_resource(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ContextError> {
    require_permission(Permission::Read)?;
    let session = state.sessions.get_session(&session_id).await?;
    let messages = state
        .messages
        .get_messages(&session_id, &MessageQuery { limit: Some(1000), ..Default::default() })
        .await?;
    let statistics = state.messages.session_statistics(&session_id).await?;

    Ok(ok(json!({
        "session": session,
        "messages": messages,
        "statistics": statistics,
        "resource_info": {
            "uri": format!("session://{session_id}"),
            "content_type": "application/json",
        },
    })))
}

/// GET /resources/agent/:agent_id/memory — the `agent://{id}/memory`
/// resource, grouped into global and per-session scopes.
///
/// A non-owner gets `MEMORY_NOT_FOUND`, never a permission error: the
/// resource must not double as an existence oracle for other agents' data.
pub async fn agent_memory_resource(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ContextError> {
    require_permission(Permission::Read)?;
    let caller = auth_ctx::current();
    if caller.agent_id != agent_id {
        return Err(ContextError::MemoryNotFound(format!("agent://{agent_id}/memory")));
    }

    let memory = state.memory.grouped_memory().await?;
    Ok(ok(json!({
        "agent_id": agent_id,
        "memory": memory,
        "resource_info": {
            "uri": format!("agent://{agent_id}/memory"),
            "content_type": "application/json",
        },
    })))
}
