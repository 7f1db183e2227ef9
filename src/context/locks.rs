use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::auth_ctx;
use crate::context::notify::{NotificationHub, NotificationPayload};
use crate::context::types::{now_ts, ContextError};

/// Lock lifetime and heartbeat window, seconds.
pub const LOCK_TTL_SECS: f64 = 300.0;
pub const HEARTBEAT_SECS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    Read,
    Write,
    Exclusive,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionLock {
    pub session_id: String,
    pub holder_agent: String,
    pub lock_type: LockType,
    pub acquired_at: f64,
    pub heartbeat_expires_at: f64,
    pub expires_at: f64,
}

impl SessionLock {
    fn is_stale(&self, now: f64) -> bool {
        now > self.heartbeat_expires_at || now > self.expires_at
    }
}

/// In-memory session lock table. One holder per session; a holder that
/// stops heartbeating loses the lock to the next contender after the
/// heartbeat window lapses.
pub struct LockManager {
    locks: DashMap<String, SessionLock>,
    hub: Arc<NotificationHub>,
}

impl LockManager {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self {
            locks: DashMap::new(),
            hub,
        }
    }

    /// Acquires or renews the session lock for the calling agent. Renewal
    /// by the current holder refreshes the heartbeat deadline.
    pub fn acquire(&self, session_id: &str, lock_type: LockType) -> Result<SessionLock, ContextError> {
        let caller = auth_ctx::current();
        let now = now_ts();

        // The entry API keeps check-and-set atomic per session key.
        use dashmap::mapref::entry::Entry;
        match self.locks.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.holder_agent != caller.agent_id && !existing.is_stale(now) {
                    return Err(ContextError::SessionLocked(existing.holder_agent.clone()));
                }
                let lock = SessionLock {
                    session_id: session_id.to_string(),
                    holder_agent: caller.agent_id.clone(),
                    lock_type,
                    acquired_at: if existing.holder_agent == caller.agent_id {
                        existing.acquired_at
                    } else {
                        now
                    },
                    heartbeat_expires_at: now + HEARTBEAT_SECS,
                    expires_at: now + LOCK_TTL_SECS,
                };
                *occupied.get_mut() = lock.clone();
                Ok(lock)
            }
            Entry::Vacant(vacant) => {
                let lock = SessionLock {
                    session_id: session_id.to_string(),
                    holder_agent: caller.agent_id.clone(),
                    lock_type,
                    acquired_at: now,
                    heartbeat_expires_at: now + HEARTBEAT_SECS,
                    expires_at: now + LOCK_TTL_SECS,
                };
                vacant.insert(lock.clone());
                Ok(lock)
            }
        }
    }

    /// Releases the lock. The holder may always release; an admin may force
    /// it, which is announced to the session's subscribers.
    pub fn release(&self, session_id: &str) -> Result<(), ContextError> {
        let caller = auth_ctx::current();
        let Some(lock) = self.locks.get(session_id).map(|l| l.clone()) else {
            return Err(ContextError::NoLockHeld(session_id.to_string()));
        };

        if lock.holder_agent == caller.agent_id {
            self.locks.remove(session_id);
            return Ok(());
        }
        if caller.is_admin() {
            self.locks.remove(session_id);
            self.hub.broadcast_now(
                &format!("session://{session_id}"),
                NotificationPayload::new(
                    "agent_event",
                    json!({
                        "event": "lock_force_unlocked",
                        "session_id": session_id,
                        "previous_holder": lock.holder_agent,
                        "released_by": caller.agent_id,
                    }),
                ),
            );
            return Ok(());
        }
        Err(ContextError::PermissionDenied(
            "Only the lock holder or an admin may unlock".to_string(),
        ))
    }

    /// Current lock state, if any non-stale lock exists.
    pub fn status(&self, session_id: &str) -> Option<SessionLock> {
        let now = now_ts();
        self.locks
            .get(session_id)
            .map(|l| l.clone())
            .filter(|l| !l.is_stale(now))
    }

    /// Drops every lock whose heartbeat or TTL lapsed. Returns the reaped
    /// session ids.
    pub fn expire_stale(&self) -> Vec<String> {
        let now = now_ts();
        let stale: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &stale {
            self.locks.remove(session_id);
            tracing::info!(session_id = %session_id, "[Locks] expired stale lock");
        }
        stale
    }

    pub fn active_count(&self) -> usize {
        let now = now_ts();
        self.locks.iter().filter(|e| !e.value().is_stale(now)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::auth_ctx::{with_auth, AuthContext};
    use crate::context::types::Permission;

    fn agent(agent_id: &str, perms: Vec<Permission>) -> AuthContext {
        AuthContext {
            agent_id: agent_id.to_string(),
            agent_type: "claude".to_string(),
            permissions: perms,
            authenticated: true,
            auth_method: Some("jwt".to_string()),
        }
    }

    fn writer(agent_id: &str) -> AuthContext {
        agent(agent_id, vec![Permission::Read, Permission::Write])
    }

    const SID: &str = "session_0123456789abcdef";

    #[tokio::test]
    async fn lock_is_exclusive_between_agents() {
        let locks = LockManager::new(NotificationHub::new());
        with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;

        let err = with_auth(writer("a2"), async { locks.acquire(SID, LockType::Write) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_LOCKED");
    }

    #[tokio::test]
    async fn holder_renewal_keeps_acquire_time() {
        let locks = LockManager::new(NotificationHub::new());
        let first = with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;
        let renewed =
            with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;
        assert_eq!(renewed.acquired_at, first.acquired_at);
        assert!(renewed.heartbeat_expires_at >= first.heartbeat_expires_at);
    }

    #[tokio::test]
    async fn release_requires_holder_or_admin() {
        let locks = LockManager::new(NotificationHub::new());
        with_auth(writer("a1"), async { locks.acquire(SID, LockType::Exclusive).unwrap() }).await;

        let err = with_auth(writer("a2"), async { locks.release(SID) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");

        with_auth(
            agent("root", vec![Permission::Read, Permission::Admin]),
            async { locks.release(SID).unwrap() },
        )
        .await;
        assert!(locks.status(SID).is_none());
    }

    #[tokio::test]
    async fn force_unlock_broadcasts() {
        let hub = NotificationHub::new();
        let mut rx = hub.register("watcher", "a2");
        hub.subscribe("watcher", &format!("session://{SID}"));

        let locks = LockManager::new(hub);
        with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;
        with_auth(
            agent("root", vec![Permission::Admin]),
            async { locks.release(SID).unwrap() },
        )
        .await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.data["event"], "lock_force_unlocked");
        assert_eq!(event.data["previous_holder"], "a1");
    }

    #[tokio::test]
    async fn release_without_lock_is_an_error() {
        let locks = LockManager::new(NotificationHub::new());
        let err = with_auth(writer("a1"), async { locks.release(SID) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_LOCK_HELD");
    }

    #[tokio::test]
    async fn stale_lock_yields_to_next_contender() {
        let locks = LockManager::new(NotificationHub::new());
        with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;

        // Simulate a holder that stopped heartbeating.
        locks.locks.get_mut(SID).unwrap().heartbeat_expires_at = now_ts() - 1.0;

        let lock = with_auth(writer("a2"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;
        assert_eq!(lock.holder_agent, "a2");
    }

    #[tokio::test]
    async fn expire_stale_reaps_only_lapsed() {
        let locks = LockManager::new(NotificationHub::new());
        with_auth(writer("a1"), async { locks.acquire(SID, LockType::Write).unwrap() }).await;
        with_auth(writer("a2"), async {
            locks
                .acquire("session_feedfacefeedface", LockType::Read)
                .unwrap()
        })
        .await;

        locks.locks.get_mut(SID).unwrap().expires_at = now_ts() - 1.0;
        let reaped = locks.expire_stale();
        assert_eq!(reaped, vec![SID.to_string()]);
        assert_eq!(locks.active_count(), 1);
    }
}
