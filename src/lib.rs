pub mod config;
pub mod database;
pub mod dto;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::services::audit_service::AuditService;
use crate::services::broadcast::{BroadcastBridge, InMemoryBridge, PgBridge};
use crate::services::checkpoint_service::CheckpointService;
use crate::services::transfer_service::TransferService;
use crate::store::{PgSessionStore, SessionStore};
use crate::ws::manager::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub manager: ConnectionManager,
    pub bridge: Arc<dyn BroadcastBridge>,
    pub audit_service: AuditService,
    pub checkpoint_service: CheckpointService,
    pub transfer_service: TransferService,
    pub heartbeat_interval_secs: u64,
    pub checkpoint_debounce_secs: u64,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let config = crate::config::get_config();
        let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
        let bridge: Arc<dyn BroadcastBridge> = Arc::new(PgBridge::new(pool));
        Self::build(
            store,
            bridge,
            config.heartbeat_interval_secs,
            config.heartbeat_timeout_secs,
            config.max_connections_per_user,
            config.checkpoint_debounce_secs,
            config.transfer_min_remaining_minutes,
        )
    }

    /// Single-process wiring over any store and bridge, used for tests
    /// and embedded deployments. Realtime knobs take their defaults.
    pub fn with_store(store: Arc<dyn SessionStore>, bridge: Arc<dyn BroadcastBridge>) -> Self {
        Self::build(store, bridge, 30, 60, 3, 2, 5)
    }

    /// Single-process wiring with no external collaborators at all.
    pub fn in_memory() -> Self {
        Self::with_store(
            Arc::new(crate::store::MemoryStore::new()),
            Arc::new(InMemoryBridge::new()),
        )
    }

    fn build(
        store: Arc<dyn SessionStore>,
        bridge: Arc<dyn BroadcastBridge>,
        heartbeat_interval_secs: u64,
        heartbeat_timeout_secs: u64,
        max_connections_per_user: usize,
        checkpoint_debounce_secs: u64,
        transfer_min_remaining_minutes: i64,
    ) -> Self {
        let manager = ConnectionManager::new(
            Duration::from_secs(heartbeat_interval_secs),
            Duration::from_secs(heartbeat_timeout_secs),
            max_connections_per_user,
        );
        let audit_service = AuditService::new(store.clone());
        let checkpoint_service = CheckpointService::new(
            store.clone(),
            manager.clone(),
            Duration::from_secs(checkpoint_debounce_secs),
        );
        let transfer_service = TransferService::new(
            store.clone(),
            audit_service.clone(),
            bridge.clone(),
            transfer_min_remaining_minutes,
        );

        Self {
            store,
            manager,
            bridge,
            audit_service,
            checkpoint_service,
            transfer_service,
            heartbeat_interval_secs,
            checkpoint_debounce_secs,
        }
    }
}
