use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

/// Cadence of the stale-subscription reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the lock heartbeat scan — a quarter of the heartbeat window,
/// so an abandoned lock is reclaimed promptly.
const LOCK_SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// Spawns every periodic maintenance task. Each loop owns its own timer,
/// logs failures, and keeps ticking — a bad pass must never take the
/// process down.
pub fn spawn_all(state: Arc<AppState>) {
    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            sweeper_state.config.memory_sweep_interval_s.max(1),
        ));
        ticker.tick().await; // immediate first tick is a no-op
        loop {
            ticker.tick().await;
            match sweeper_state.memory.sweep_expired().await {
                Ok(0) => {}
                Ok(swept) => tracing::info!(swept, "🧹 [Sweep] removed expired memory entries"),
                Err(e) => tracing::error!(error = %e, "❌ [Sweep] memory sweep failed"),
            }
            match sweeper_state.tokens.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "🧹 [Sweep] purged expired tokens"),
                Err(e) => tracing::error!(error = %e, "❌ [Sweep] token purge failed"),
            }
        }
    });

    let reaper_state = state.clone();
    tokio::spawn(async move {
        let idle = Duration::from_secs(reaper_state.config.ws_idle_timeout_s.max(1));
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reaper_state.hub.reap(idle);
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOCK_SCAN_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = state.locks.expire_stale();
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "[Locks] reclaimed stale session locks");
            }
        }
    });
}
