use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use std::sync::Arc;

use crate::context::auth_ctx::{self, AuthContext};
use crate::state::AppState;

/// Resolves the Bearer token (opaque `sct_…` id or bare JWT) into the
/// request's ambient identity and runs the rest of the request inside that
/// scope.
///
/// A missing or invalid token never rejects the request here — the caller
/// proceeds as the anonymous read-only identity and the permission gates in
/// the tool handlers do the enforcing.
pub async fn resolve_identity(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.strip_prefix("Bearer "))
        .map(str::to_string);

    let ctx = match bearer {
        Some(token) => match state.tokens.resolve(&token).await {
            Ok(claims) => AuthContext {
                agent_id: claims.sub.clone(),
                agent_type: claims.agent_type.clone(),
                permissions: claims.permissions(),
                authenticated: true,
                auth_method: Some(if token.starts_with("sct_") {
                    "opaque".to_string()
                } else {
                    "jwt".to_string()
                }),
            },
            Err(_) => {
                tracing::warn!("🚫 Invalid token presented — continuing as anonymous");
                state.audit.record("auth_failed", "unknown", None, None);
                AuthContext::anonymous()
            }
        },
        None => AuthContext::anonymous(),
    };

    auth_ctx::with_auth(ctx, next.run(req)).await
}
