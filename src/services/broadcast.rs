use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::ws::messages::ServerMessage;

/// Topic carrying every realtime event for one attempt. Derived
/// deterministically so any process can address an attempt's
/// connections without knowing where they live.
pub fn attempt_topic(attempt_id: Uuid) -> String {
    format!("attempt:{}", attempt_id)
}

/// Cross-process publish/subscribe seam. A decision taken on one
/// server process (transfer approval, expiry) reaches whichever
/// process holds the attempt's sockets.
#[async_trait]
pub trait BroadcastBridge: Send + Sync {
    async fn publish(&self, topic: &str, message: &ServerMessage) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<BridgeSubscription>;
}

/// Live subscription to one topic. Dropping it unsubscribes.
pub struct BridgeSubscription {
    receiver: UnboundedReceiver<ServerMessage>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl BridgeSubscription {
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }
}

impl Drop for BridgeSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.on_drop.take() {
            unsubscribe();
        }
    }
}

/// Postgres LISTEN/NOTIFY bridge: piggybacks on the store the service
/// already runs against, so no separate broker is deployed.
pub struct PgBridge {
    pool: PgPool,
}

impl PgBridge {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BroadcastBridge for PgBridge {
    async fn publish(&self, topic: &str, message: &ServerMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        sqlx::query(r#"SELECT pg_notify($1, $2)"#)
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BridgeSubscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(topic).await?;

        let (tx, rx): (UnboundedSender<ServerMessage>, _) = mpsc::unbounded_channel();
        let channel = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ServerMessage>(notification.payload()) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(%channel, error = %e, "dropping unparseable bridge payload");
                            }
                        }
                    }
                    Err(e) => {
                        error!(%channel, error = %e, "bridge listener error");
                        break;
                    }
                }
            }
        });

        Ok(BridgeSubscription {
            receiver: rx,
            on_drop: Some(Box::new(move || handle.abort())),
        })
    }
}

struct InMemorySubscriber {
    id: u64,
    sender: UnboundedSender<ServerMessage>,
}

/// Process-local fan-out for single-process deployments and tests.
#[derive(Default)]
pub struct InMemoryBridge {
    topics: Arc<Mutex<HashMap<String, Vec<InMemorySubscriber>>>>,
    next_id: AtomicU64,
}

impl InMemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().expect("bridge registry poisoned");
        topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BroadcastBridge for InMemoryBridge {
    async fn publish(&self, topic: &str, message: &ServerMessage) -> Result<()> {
        let mut topics = self.topics.lock().expect("bridge registry poisoned");
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|sub| sub.sender.send(message.clone()).is_ok());
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        } else {
            debug!(%topic, "publish with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BridgeSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut topics = self.topics.lock().expect("bridge registry poisoned");
            topics
                .entry(topic.to_string())
                .or_default()
                .push(InMemorySubscriber { id, sender: tx });
        }

        let registry = Arc::clone(&self.topics);
        let channel = topic.to_string();
        Ok(BridgeSubscription {
            receiver: rx,
            on_drop: Some(Box::new(move || {
                let mut topics = registry.lock().expect("bridge registry poisoned");
                if let Some(subscribers) = topics.get_mut(&channel) {
                    subscribers.retain(|sub| sub.id != id);
                    if subscribers.is_empty() {
                        topics.remove(&channel);
                    }
                }
            })),
        })
    }
}
