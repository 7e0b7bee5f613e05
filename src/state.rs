// ====================================================================================
// src/state.rs - 共享应用状态
// ====================================================================================
use crate::{heartbeat::HeartbeatMonitor, hub::BroadcastHub, Config};
use sqlx::SqlitePool;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

pub struct AppState {
    pub db_pool: SqlitePool,
    pub hub: BroadcastHub,
    pub heartbeats: HeartbeatMonitor,
    pub total_connections: Arc<AtomicU32>,
    pub config: Config,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: Config) -> Self {
        Self {
            db_pool,
            hub: BroadcastHub::new(config.viewer_queue_capacity),
            heartbeats: HeartbeatMonitor::new(config.heartbeat_timeout_seconds),
            total_connections: Arc::new(AtomicU32::new(0)),
            config,
        }
    }
}
