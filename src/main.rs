use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod context;
mod db;
mod middleware;
mod routes;
mod state;

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize Tracing (Structured Logging)
    // Environment filter allows for granular control over log levels via RUST_LOG env var.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "context_server_rs=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Load Environment Variables
    if dotenvy::dotenv().is_err() {
        tracing::warn!("No .env file found. Relying on system environment variables.");
    }
    let config = Config::from_env()?;

    // 3. Configure CORS
    // Reads from ALLOWED_ORIGINS env (comma-separated). Falls back to allow-all for local dev.
    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: ALLOWED_ORIGINS was set but no valid origins could be parsed — defaulting to permissive");
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            } else {
                tracing::info!("CORS: Restricting to {} origin(s)", allowed.len());
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
        _ => {
            tracing::warn!("CORS: No valid ALLOWED_ORIGINS set — defaulting to permissive (allow all) for dev mode");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    // 4. Initialize Global AppState
    // Wrapped in Arc for thread-safe sharing across all request handlers.
    let port = config.port;
    let flush_interval = Duration::from_secs(config.write_flush_interval_s.max(1));
    let (app_state, write_manager) = AppState::new(config).await?;

    // 4.1 Launch the buffered audit flusher and the periodic maintenance tasks.
    tokio::spawn(write_manager.run(flush_interval));
    context::tasks::spawn_all(app_state.clone());

    // 5. Build Axum Router
    // Every tool and resource route runs inside the identity-resolving
    // middleware; permission gates live in the handlers themselves.
    let tool_routes = Router::new()
        .route("/tools/create_session", post(routes::tools::create_session))
        .route("/tools/get_session", post(routes::tools::get_session))
        .route("/tools/set_session_active", post(routes::tools::set_session_active))
        .route("/tools/add_message", post(routes::tools::add_message))
        .route("/tools/get_messages", post(routes::tools::get_messages))
        .route("/tools/get_messages_advanced", post(routes::tools::get_messages_advanced))
        .route("/tools/set_message_visibility", post(routes::tools::set_message_visibility))
        .route("/tools/search_context", post(routes::tools::search_context))
        .route("/tools/search_by_sender", post(routes::tools::search_by_sender))
        .route("/tools/search_by_timerange", post(routes::tools::search_by_timerange))
        .route("/tools/set_memory", post(routes::tools::set_memory))
        .route("/tools/get_memory", post(routes::tools::get_memory))
        .route("/tools/list_memory", post(routes::tools::list_memory))
        .route("/tools/delete_memory", post(routes::tools::delete_memory))
        .route("/tools/authenticate_agent", post(routes::tools::authenticate_agent))
        .route("/tools/refresh_token", post(routes::tools::refresh_token))
        .route("/tools/register_agent_presence", post(routes::tools::register_agent_presence))
        .route("/tools/get_active_agents", post(routes::tools::get_active_agents))
        .route("/tools/coordinate_session_work", post(routes::tools::coordinate_session_work))
        .route("/tools/get_audit_log", post(routes::tools::get_audit_log))
        .route("/tools/get_agent_activity_summary", post(routes::tools::get_agent_activity_summary))
        .route("/tools/get_performance_metrics", post(routes::tools::get_performance_metrics))
        .route("/resources/session/:session_id", get(routes::resources::session_resource))
        .route("/resources/agent/:agent_id/memory", get(routes::resources::agent_memory_resource))
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth::resolve_identity,
        ));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ws", get(routes::ws::ws_handler))
        .merge(tool_routes)
        .with_state(app_state.clone())
        // CORS must be the *outermost* layer so it runs first, before Auth
        .layer(cors);

    // 6. Start the Server
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    tracing::info!("🚀 Shared Context Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
