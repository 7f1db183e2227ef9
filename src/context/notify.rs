use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::context::types::now_iso;

/// Wire shape of a push event, shared by MCP subscribers and websocket
/// clients.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: String,
}

impl NotificationPayload {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: now_iso(),
        }
    }
}

struct SubscriberSink {
    tx: mpsc::UnboundedSender<NotificationPayload>,
    agent_id: String,
}

/// Fan-out of resource change events.
///
/// Subscribers register a sink once, then subscribe to any number of
/// resource URIs (`session://{id}`, `agent://{id}/memory`). `notify` is
/// debounced per URI; one in-flight delivery task per URI keeps events
/// FIFO from any single subscriber's point of view while distinct URIs
/// broadcast in parallel.
pub struct NotificationHub {
    subscribers: DashMap<String, HashSet<String>>,
    sinks: DashMap<String, SubscriberSink>,
    last_seen: DashMap<String, Instant>,
    last_notified: DashMap<String, Instant>,
    last_payload: DashMap<String, NotificationPayload>,
    pending: DashMap<String, ()>,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            sinks: DashMap::new(),
            last_seen: DashMap::new(),
            last_notified: DashMap::new(),
            last_payload: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Registers a sink for `subscriber_id` owned by `agent_id` and returns
    /// the receiving end. Re-registering replaces the old sink.
    pub fn register(
        &self,
        subscriber_id: &str,
        agent_id: &str,
    ) -> mpsc::UnboundedReceiver<NotificationPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks.insert(
            subscriber_id.to_string(),
            SubscriberSink {
                tx,
                agent_id: agent_id.to_string(),
            },
        );
        self.last_seen.insert(subscriber_id.to_string(), Instant::now());
        rx
    }

    pub fn subscribe(&self, subscriber_id: &str, resource_uri: &str) {
        self.subscribers
            .entry(resource_uri.to_string())
            .or_default()
            .insert(subscriber_id.to_string());
        self.touch(subscriber_id);
        tracing::debug!(subscriber = subscriber_id, uri = resource_uri, "[Hub] subscribed");
    }

    /// Drops one subscription, or every subscription plus the sink when
    /// `resource_uri` is `None`.
    pub fn unsubscribe(&self, subscriber_id: &str, resource_uri: Option<&str>) {
        match resource_uri {
            Some(uri) => {
                if let Some(mut set) = self.subscribers.get_mut(uri) {
                    set.remove(subscriber_id);
                }
            }
            None => {
                for mut entry in self.subscribers.iter_mut() {
                    entry.value_mut().remove(subscriber_id);
                }
                self.sinks.remove(subscriber_id);
                self.last_seen.remove(subscriber_id);
            }
        }
    }

    /// Refreshes the liveness clock for a subscriber.
    pub fn touch(&self, subscriber_id: &str) {
        self.last_seen.insert(subscriber_id.to_string(), Instant::now());
    }

    /// Schedules a debounced delivery for `resource_uri`. Bursts within the
    /// debounce window coalesce into a single event carrying the *latest*
    /// payload of the burst; delivery fires only after the URI has been
    /// quiet for `debounce`.
    pub fn notify(self: &Arc<Self>, resource_uri: &str, payload: NotificationPayload, debounce: Duration) {
        // Every call replaces the pending payload, so the delivery task
        // always ships the state the burst settled on.
        self.last_payload.insert(resource_uri.to_string(), payload);
        self.last_notified.insert(resource_uri.to_string(), Instant::now());

        if self.pending.insert(resource_uri.to_string(), ()).is_some() {
            // A delivery task is already waiting on this URI.
            return;
        }

        let hub = Arc::clone(self);
        let uri = resource_uri.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;
                let quiet = hub
                    .last_notified
                    .get(&uri)
                    .map(|t| t.elapsed() >= debounce)
                    .unwrap_or(true);
                if quiet {
                    break;
                }
            }
            hub.pending.remove(&uri);
            // A notify landing between the two removes spawns its own task,
            // so taking the entry here cannot strand an event.
            if let Some((_, latest)) = hub.last_payload.remove(&uri) {
                hub.deliver(&uri, latest);
            }
        });
    }

    /// Immediate, non-debounced broadcast (force-unlock announcements).
    pub fn broadcast_now(&self, resource_uri: &str, payload: NotificationPayload) {
        self.deliver(resource_uri, payload);
    }

    fn deliver(&self, resource_uri: &str, payload: NotificationPayload) {
        let ids: Vec<String> = match self.subscribers.get(resource_uri) {
            Some(set) => set.iter().cloned().collect(),
            None => return,
        };

        // agent://{id}/memory events are owner-only; the hub enforces that
        // on delivery, not at subscribe time.
        let owner = resource_uri
            .strip_prefix("agent://")
            .and_then(|rest| rest.strip_suffix("/memory"));

        let mut dead = Vec::new();
        for id in ids {
            let Some(sink) = self.sinks.get(&id) else {
                dead.push(id);
                continue;
            };
            if let Some(owner_id) = owner {
                if sink.agent_id != owner_id {
                    continue;
                }
            }
            if sink.tx.send(payload.clone()).is_err() {
                dead.push(id.clone());
            }
        }

        // A failed delivery silently unsubscribes the failing subscriber.
        for id in dead {
            tracing::debug!(subscriber = %id, uri = resource_uri, "[Hub] dropping dead subscriber");
            self.unsubscribe(&id, None);
        }
    }

    /// Evicts subscribers idle longer than `idle_timeout`. Returns how many
    /// were reaped.
    pub fn reap(&self, idle_timeout: Duration) -> usize {
        let stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| entry.value().elapsed() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.unsubscribe(id, None);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "[Hub] reaped idle subscribers");
        }
        stale.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FAST: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn debounced_burst_delivers_latest_payload_once() {
        let hub = NotificationHub::new();
        let mut rx = hub.register("sub-1", "a1");
        hub.subscribe("sub-1", "session://session_0123456789abcdef");

        for i in 0..10 {
            hub.notify(
                "session://session_0123456789abcdef",
                NotificationPayload::new("session_update", json!({"n": i})),
                FAST,
            );
        }

        tokio::time::sleep(FAST * 4).await;
        let event = rx.try_recv().expect("one coalesced event");
        assert_eq!(event.data["n"], 9, "must carry the last payload of the burst");
        assert!(rx.try_recv().is_err(), "burst must coalesce");
    }

    #[tokio::test]
    async fn memory_events_are_owner_only() {
        let hub = NotificationHub::new();
        let mut owner_rx = hub.register("sub-owner", "a1");
        let mut other_rx = hub.register("sub-other", "a2");
        hub.subscribe("sub-owner", "agent://a1/memory");
        hub.subscribe("sub-other", "agent://a1/memory");

        hub.broadcast_now(
            "agent://a1/memory",
            NotificationPayload::new("agent_event", json!({"key": "k"})),
        );

        assert!(owner_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscriber_is_unsubscribed_silently() {
        let hub = NotificationHub::new();
        let rx = hub.register("sub-1", "a1");
        hub.subscribe("sub-1", "session://session_0123456789abcdef");
        drop(rx);

        hub.broadcast_now(
            "session://session_0123456789abcdef",
            NotificationPayload::new("session_update", json!({})),
        );
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn reap_evicts_only_idle() {
        let hub = NotificationHub::new();
        let _rx1 = hub.register("old", "a1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _rx2 = hub.register("fresh", "a2");

        let reaped = hub.reap(Duration::from_millis(25));
        assert_eq!(reaped, 1);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let hub = NotificationHub::new();
        let mut rx = hub.register("sub-1", "a1");
        hub.subscribe("sub-1", "session://session_0123456789abcdef");

        for i in 0..5 {
            hub.broadcast_now(
                "session://session_0123456789abcdef",
                NotificationPayload::new("new_message", json!({"seq": i})),
            );
        }
        for expected in 0..5 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.data["seq"], expected);
        }
    }
}
