use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::context::types::{now_iso, ContextError};

/// Builds the canonical success envelope. Handler data fields are inlined
/// at the top level next to `success`/`code`/`timestamp`.
pub fn ok(data: Value) -> Json<Value> {
    let mut body = json!({
        "success": true,
        "code": "SUCCESS",
        "timestamp": now_iso(),
    });
    if let (Some(body_map), Value::Object(data_map)) = (body.as_object_mut(), data) {
        for (k, v) in data_map {
            body_map.insert(k, v);
        }
    }
    Json(body)
}

/// Builds the canonical error envelope for `err`.
pub fn error_body(err: &ContextError) -> Value {
    json!({
        "success": false,
        "error": err.public_message(),
        "code": err.code(),
        "severity": err.severity(),
        "timestamp": now_iso(),
    })
}

fn status_for(err: &ContextError) -> StatusCode {
    match err {
        ContextError::Validation(_) | ContextError::Serialization(_) => StatusCode::BAD_REQUEST,
        ContextError::AuthFailed => StatusCode::UNAUTHORIZED,
        ContextError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ContextError::SessionNotFound(_)
        | ContextError::MessageNotFound(_)
        | ContextError::MemoryNotFound(_) => StatusCode::NOT_FOUND,
        ContextError::KeyExists(_)
        | ContextError::SessionLocked(_)
        | ContextError::NoLockHeld(_) => StatusCode::CONFLICT,
        ContextError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ContextError {
    fn into_response(self) -> Response {
        (status_for(&self), Json(error_body(&self))).into_response()
    }
}
