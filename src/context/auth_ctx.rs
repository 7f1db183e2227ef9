use serde::Serialize;

use crate::context::types::{ContextError, Permission};

tokio::task_local! {
    static AUTH: AuthContext;
}

/// Per-request identity. Lives in a task-local so any depth of the call
/// graph can read it without threading it through signatures; two concurrent
/// requests can never observe each other's value.
#[derive(Debug, Clone, Serialize)]
pub struct AuthContext {
    pub agent_id: String,
    pub agent_type: String,
    pub permissions: Vec<Permission>,
    pub authenticated: bool,
    pub auth_method: Option<String>,
}

impl AuthContext {
    /// The identity a request gets when its token is missing or invalid.
    pub fn anonymous() -> Self {
        Self {
            agent_id: "unknown".to_string(),
            agent_type: "unknown".to_string(),
            permissions: vec![Permission::Read],
            authenticated: false,
            auth_method: None,
        }
    }

    pub fn has_permission(&self, perm: Permission) -> bool {
        self.permissions.contains(&perm)
    }

    pub fn is_admin(&self) -> bool {
        self.has_permission(Permission::Admin)
    }
}

/// Runs `fut` with `ctx` as the ambient identity.
pub async fn with_auth<F>(ctx: AuthContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    AUTH.scope(ctx, fut).await
}

/// The ambient identity of the running request. Outside a request scope
/// (background tasks, tests without a scope) this is the anonymous context.
pub fn current() -> AuthContext {
    AUTH.try_with(|ctx| ctx.clone())
        .unwrap_or_else(|_| AuthContext::anonymous())
}

/// Short-circuits with `PERMISSION_DENIED` unless the ambient identity
/// carries `perm`. Returns the context so handlers read it once.
pub fn require_permission(perm: Permission) -> Result<AuthContext, ContextError> {
    let ctx = current();
    if ctx.has_permission(perm) {
        Ok(ctx)
    } else {
        Err(ContextError::PermissionDenied(format!(
            "'{}' permission required",
            perm.as_str()
        )))
    }
}
