use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ws::messages::ServerMessage;

/// Why a connection attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRejection {
    CapacityExceeded { current: usize, limit: usize },
}

impl ConnectRejection {
    pub fn close_reason(&self) -> &'static str {
        match self {
            ConnectRejection::CapacityExceeded { .. } => "connection_limit_exceeded",
        }
    }
}

struct ConnectionEntry {
    attempt_id: Uuid,
    user_id: Uuid,
    sender: UnboundedSender<ServerMessage>,
    connected_at: Instant,
    last_activity: Instant,
    message_count: u64,
    heartbeat: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, ConnectionEntry>,
    by_attempt: HashMap<Uuid, HashSet<Uuid>>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

struct ManagerShared {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    max_connections_per_user: usize,
    registry: Mutex<Registry>,
}

/// Owns every live session for this process: registration, heartbeat
/// eviction, and fan-out. All registry mutation happens behind the
/// manager's own lock; callers only go through these operations.
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    pub fn new(
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        max_connections_per_user: usize,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                heartbeat_interval,
                heartbeat_timeout,
                max_connections_per_user,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .expect("connection registry poisoned")
    }

    /// Register a connection and start its heartbeat monitor. Refused
    /// when the user is already at the concurrent-connection cap,
    /// counted across all of their attempts.
    pub fn connect(
        &self,
        attempt_id: Uuid,
        user_id: Uuid,
        sender: UnboundedSender<ServerMessage>,
    ) -> Result<Uuid, ConnectRejection> {
        let connection_id = Uuid::new_v4();

        {
            let mut registry = self.registry();
            let current = registry
                .by_user
                .get(&user_id)
                .map(|c| c.len())
                .unwrap_or(0);
            if current >= self.shared.max_connections_per_user {
                warn!(
                    %user_id,
                    current,
                    limit = self.shared.max_connections_per_user,
                    "connection refused: per-user cap reached"
                );
                return Err(ConnectRejection::CapacityExceeded {
                    current,
                    limit: self.shared.max_connections_per_user,
                });
            }

            let now = Instant::now();
            registry.connections.insert(
                connection_id,
                ConnectionEntry {
                    attempt_id,
                    user_id,
                    sender,
                    connected_at: now,
                    last_activity: now,
                    message_count: 0,
                    heartbeat: None,
                },
            );
            registry
                .by_attempt
                .entry(attempt_id)
                .or_default()
                .insert(connection_id);
            registry
                .by_user
                .entry(user_id)
                .or_default()
                .insert(connection_id);
        }

        let handle = tokio::spawn(heartbeat_loop(self.clone(), connection_id));
        {
            let mut registry = self.registry();
            if let Some(entry) = registry.connections.get_mut(&connection_id) {
                entry.heartbeat = Some(handle);
            } else {
                // Connection already torn down before we could stash the
                // monitor handle.
                handle.abort();
            }
        }

        info!(%connection_id, %attempt_id, %user_id, "session connected");
        Ok(connection_id)
    }

    /// Idempotent removal: drops the connection from every index,
    /// cancels its heartbeat task, and prunes now-empty sets.
    pub fn disconnect(&self, connection_id: Uuid) {
        let entry = {
            let mut registry = self.registry();
            let Some(entry) = registry.connections.remove(&connection_id) else {
                return;
            };

            if let Some(set) = registry.by_attempt.get_mut(&entry.attempt_id) {
                set.remove(&connection_id);
                if set.is_empty() {
                    registry.by_attempt.remove(&entry.attempt_id);
                }
            }
            if let Some(set) = registry.by_user.get_mut(&entry.user_id) {
                set.remove(&connection_id);
                if set.is_empty() {
                    registry.by_user.remove(&entry.user_id);
                }
            }
            entry
        };

        if let Some(handle) = entry.heartbeat {
            handle.abort();
        }
        info!(
            %connection_id,
            attempt_id = %entry.attempt_id,
            uptime_secs = entry.connected_at.elapsed().as_secs(),
            messages = entry.message_count,
            "session disconnected"
        );
    }

    /// Best-effort single send; a closed transport evicts the
    /// connection and reports failure.
    pub fn send_to_one(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        let sender = {
            let registry = self.registry();
            match registry.connections.get(&connection_id) {
                Some(entry) => entry.sender.clone(),
                None => return false,
            }
        };

        if sender.send(message).is_err() {
            debug!(%connection_id, "send failed, evicting connection");
            self.disconnect(connection_id);
            return false;
        }
        true
    }

    /// Fan out to every connection on an attempt, optionally skipping
    /// the originator. Per-recipient failures evict only that
    /// connection; the broadcast continues.
    pub fn broadcast_to_attempt(
        &self,
        attempt_id: Uuid,
        message: ServerMessage,
        exclude: Option<Uuid>,
    ) -> usize {
        let targets: Vec<(Uuid, UnboundedSender<ServerMessage>)> = {
            let registry = self.registry();
            registry
                .by_attempt
                .get(&attempt_id)
                .map(|conns| {
                    conns
                        .iter()
                        .filter(|id| Some(**id) != exclude)
                        .filter_map(|id| {
                            registry
                                .connections
                                .get(id)
                                .map(|entry| (*id, entry.sender.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut sent = 0;
        for (connection_id, sender) in targets {
            if sender.send(message.clone()).is_ok() {
                sent += 1;
            } else {
                debug!(%connection_id, "broadcast send failed, evicting connection");
                self.disconnect(connection_id);
            }
        }
        sent
    }

    pub fn broadcast_to_user(&self, user_id: Uuid, message: ServerMessage) -> usize {
        let targets: Vec<(Uuid, UnboundedSender<ServerMessage>)> = {
            let registry = self.registry();
            registry
                .by_user
                .get(&user_id)
                .map(|conns| {
                    conns
                        .iter()
                        .filter_map(|id| {
                            registry
                                .connections
                                .get(id)
                                .map(|entry| (*id, entry.sender.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut sent = 0;
        for (connection_id, sender) in targets {
            if sender.send(message.clone()).is_ok() {
                sent += 1;
            } else {
                self.disconnect(connection_id);
            }
        }
        sent
    }

    /// Any inbound frame counts as liveness, including pongs.
    pub fn record_activity(&self, connection_id: Uuid) {
        let mut registry = self.registry();
        if let Some(entry) = registry.connections.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
            entry.message_count += 1;
        }
    }

    pub fn is_connected(&self, connection_id: Uuid) -> bool {
        self.registry().connections.contains_key(&connection_id)
    }

    pub fn connections_for_attempt(&self, attempt_id: Uuid) -> Vec<Uuid> {
        self.registry()
            .by_attempt
            .get(&attempt_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count_for_user(&self, user_id: Uuid) -> usize {
        self.registry()
            .by_user
            .get(&user_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn staleness(&self, connection_id: Uuid) -> Option<Duration> {
        self.registry()
            .connections
            .get(&connection_id)
            .map(|entry| entry.last_activity.elapsed())
    }
}

/// Per-connection monitor: ping on every interval, evict once the
/// client has been silent past the timeout.
async fn heartbeat_loop(manager: ConnectionManager, connection_id: Uuid) {
    let mut ticker = tokio::time::interval(manager.shared.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(idle) = manager.staleness(connection_id) else {
            break;
        };
        if idle >= manager.shared.heartbeat_timeout {
            warn!(
                %connection_id,
                idle_secs = idle.as_secs(),
                "heartbeat timeout, evicting connection"
            );
            manager.disconnect(connection_id);
            break;
        }

        if !manager.send_to_one(
            connection_id,
            ServerMessage::Ping {
                timestamp: Utc::now(),
            },
        ) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Duration::from_secs(5), Duration::from_secs(10), 2)
    }

    #[tokio::test]
    async fn refuses_connections_past_the_per_user_cap() {
        let manager = manager();
        let attempt_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();

        let first = manager.connect(attempt_id, user_id, tx1).unwrap();
        manager.connect(attempt_id, user_id, tx2).unwrap();

        let rejected = manager.connect(attempt_id, user_id, tx3).unwrap_err();
        assert_eq!(
            rejected,
            ConnectRejection::CapacityExceeded {
                current: 2,
                limit: 2
            }
        );

        // Freeing a slot lets the user back in.
        manager.disconnect(first);
        let (tx4, _rx4) = mpsc::unbounded_channel();
        manager.connect(attempt_id, user_id, tx4).unwrap();
        assert_eq!(manager.connection_count_for_user(user_id), 2);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_cleans_indices() {
        let manager = manager();
        let attempt_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let (tx, _rx) = mpsc::unbounded_channel();
        let connection_id = manager.connect(attempt_id, user_id, tx).unwrap();
        assert_eq!(manager.connections_for_attempt(attempt_id).len(), 1);

        manager.disconnect(connection_id);
        manager.disconnect(connection_id);

        assert!(!manager.is_connected(connection_id));
        assert!(manager.connections_for_attempt(attempt_id).is_empty());
        assert_eq!(manager.connection_count_for_user(user_id), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_the_excluded_sender() {
        let manager = manager();
        let attempt_id = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let sender = manager.connect(attempt_id, Uuid::new_v4(), tx1).unwrap();
        manager.connect(attempt_id, Uuid::new_v4(), tx2).unwrap();

        let sent = manager.broadcast_to_attempt(
            attempt_id,
            ServerMessage::notification("Answer Saved", "Question 7 saved".to_string(), "success"),
            Some(sender),
        );

        assert_eq!(sent, 1);
        assert!(rx1.try_recv().is_err());
        assert!(matches!(
            rx2.try_recv().unwrap(),
            ServerMessage::Notification { .. }
        ));
    }

    #[tokio::test]
    async fn failed_send_evicts_only_the_dead_connection() {
        let manager = manager();
        let attempt_id = Uuid::new_v4();

        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let dead = manager.connect(attempt_id, Uuid::new_v4(), tx1).unwrap();
        let live = manager.connect(attempt_id, Uuid::new_v4(), tx2).unwrap();

        drop(rx1);
        let sent = manager.broadcast_to_attempt(
            attempt_id,
            ServerMessage::notification("t", "m".to_string(), "info"),
            None,
        );

        assert_eq!(sent, 1);
        assert!(!manager.is_connected(dead));
        assert!(manager.is_connected(live));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_is_evicted_after_the_timeout() {
        let manager = ConnectionManager::new(Duration::from_secs(5), Duration::from_secs(10), 3);
        let attempt_id = Uuid::new_v4();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = manager.connect(attempt_id, Uuid::new_v4(), tx).unwrap();

        // First ping arrives while the connection is still fresh.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Ping { .. }
        ));
        assert!(manager.is_connected(connection_id));

        // No pong ever comes back; the monitor evicts at the timeout.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!manager.is_connected(connection_id));
        assert!(manager.connections_for_attempt(attempt_id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_eviction() {
        let manager = ConnectionManager::new(Duration::from_secs(5), Duration::from_secs(10), 3);
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection_id = manager.connect(Uuid::new_v4(), Uuid::new_v4(), tx).unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            manager.record_activity(connection_id);
        }
        assert!(manager.is_connected(connection_id));
    }
}
