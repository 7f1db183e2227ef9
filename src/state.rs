use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::context::audit::AuditLog;
use crate::context::batch::BufferedWriteManager;
use crate::context::locks::LockManager;
use crate::context::memory::MemoryStore;
use crate::context::message::MessageLog;
use crate::context::notify::NotificationHub;
use crate::context::presence::PresenceRegistry;
use crate::context::search::SearchEngine;
use crate::context::session::SessionRegistry;
use crate::context::tokens::TokenService;
use crate::db::Store;

/// The global application state shared across all routes via Axum State.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub tokens: TokenService,
    pub sessions: SessionRegistry,
    pub messages: MessageLog,
    pub memory: MemoryStore,
    pub search: SearchEngine,
    pub audit: AuditLog,
    pub hub: Arc<NotificationHub>,
    pub locks: LockManager,
    pub presence: PresenceRegistry,
    pub started_at: Instant,
}

impl AppState {
    /// Connects the store, initializes the schema, and wires every service.
    /// Returns the state plus the audit write manager, which the caller
    /// spawns as its own background task.
    pub async fn new(config: Config) -> anyhow::Result<(Arc<Self>, BufferedWriteManager)> {
        let store = Store::connect(&config.database_url, config.pool_min, config.pool_max).await?;
        store.init_schema().await?;
        Self::assemble(config, store)
    }

    fn assemble(config: Config, store: Store) -> anyhow::Result<(Arc<Self>, BufferedWriteManager)> {
        let (audit, audit_rx) = AuditLog::new(store.clone());
        let write_manager =
            BufferedWriteManager::new(store.clone(), audit_rx, config.write_batch_size);

        let hub = NotificationHub::new();
        let tokens = TokenService::new(
            store.clone(),
            config.api_key.clone(),
            config.jwt_secret_key.clone(),
            &config.jwt_encryption_key,
        )?;
        let sessions = SessionRegistry::new(store.clone(), audit.clone());
        let messages = MessageLog::new(
            store.clone(),
            sessions.clone(),
            audit.clone(),
            Arc::clone(&hub),
        );
        let memory = MemoryStore::new(store.clone(), audit.clone(), Arc::clone(&hub));
        let search = SearchEngine::new(
            store.clone(),
            audit.clone(),
            config.default_search_recency_hours,
            config.default_search_max_rows,
        );
        let locks = LockManager::new(Arc::clone(&hub));
        let presence = PresenceRegistry::new();

        let state = Arc::new(Self {
            config,
            store,
            tokens,
            sessions,
            messages,
            memory,
            search,
            audit,
            hub,
            locks,
            presence,
            started_at: Instant::now(),
        });
        Ok((state, write_manager))
    }

    #[cfg(test)]
    pub async fn for_tests() -> (Arc<Self>, BufferedWriteManager) {
        let config = Config::for_tests();
        let store = Store::connect_memory().await.expect("in-memory store");
        Self::assemble(config, store).expect("test state")
    }
}
