use tokio::sync::mpsc;

use crate::context::audit::AuditEvent;
use crate::db::Store;

/// Drains buffered audit events into small batched transactions, so bursty
/// writers don't serialize on single-row commits against the one SQLite
/// writer.
pub struct BufferedWriteManager {
    store: Store,
    rx: mpsc::UnboundedReceiver<AuditEvent>,
    batch_size: usize,
}

impl BufferedWriteManager {
    pub fn new(store: Store, rx: mpsc::UnboundedReceiver<AuditEvent>, batch_size: usize) -> Self {
        Self {
            store,
            rx,
            batch_size: batch_size.max(1),
        }
    }

    /// Pulls at most one batch off the channel and commits it in a single
    /// transaction. Returns the number of rows written.
    pub async fn drain_once(&mut self) -> usize {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            return 0;
        }

        let count = batch.len();
        if let Err(e) = self.write_batch(&batch).await {
            // The events are already off the channel; losing an audit batch
            // must not take the server down.
            tracing::error!(error = %e, count, "❌ [Audit] batch flush failed");
            return 0;
        }
        count
    }

    async fn write_batch(&self, batch: &[AuditEvent]) -> Result<(), crate::db::StoreError> {
        let mut tx = self.store.begin().await?;
        for event in batch {
            let metadata = event
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());
            sqlx::query(
                "INSERT INTO audit_log (event_type, agent_id, session_id, metadata, timestamp)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&event.event_type)
            .bind(&event.agent_id)
            .bind(&event.session_id)
            .bind(&metadata)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|e| crate::db::StoreError::Transient(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| crate::db::StoreError::Transient(e.to_string()))?;
        Ok(())
    }

    /// The flusher loop: one drain per tick until the channel closes.
    pub async fn run(mut self, flush_interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        loop {
            ticker.tick().await;
            // Keep draining while a burst is backed up, then wait out the tick.
            loop {
                let written = self.drain_once().await;
                if written < self.batch_size {
                    break;
                }
            }
            if self.rx.is_closed() && self.rx.is_empty() {
                tracing::info!("[Audit] channel closed — flusher exiting");
                return;
            }
        }
    }
}
