// ====================================================================================
// src/heartbeat.rs - 控制端心跳监测
// ====================================================================================
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    NeverSeen,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatCheck {
    pub liveness: Liveness,
    /// True only for the first check that observes the ACTIVE -> INACTIVE edge.
    pub newly_inactive: bool,
}

struct HeartbeatRecord {
    last_seen: DateTime<Utc>,
    reported_inactive: bool,
}

/// Last-seen table for live controllers. Evaluated lazily on read, nothing
/// ticks in the background, and nothing survives a restart.
pub struct HeartbeatMonitor {
    timeout: Duration,
    records: Mutex<HashMap<String, HeartbeatRecord>>,
}

impl HeartbeatMonitor {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            timeout: Duration::seconds(timeout_seconds as i64),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn beat(&self, resource_id: &str) {
        self.beat_at(resource_id, Utc::now()).await
    }

    pub async fn beat_at(&self, resource_id: &str, now: DateTime<Utc>) {
        let previous = self.records.lock().await.insert(
            resource_id.to_string(),
            HeartbeatRecord { last_seen: now, reported_inactive: false },
        );
        if previous.is_none() {
            tracing::info!(resource_id, "Controller heartbeat started");
        }
    }

    pub async fn check(&self, resource_id: &str) -> HeartbeatCheck {
        self.check_at(resource_id, Utc::now()).await
    }

    pub async fn check_at(&self, resource_id: &str, now: DateTime<Utc>) -> HeartbeatCheck {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(resource_id) else {
            return HeartbeatCheck { liveness: Liveness::NeverSeen, newly_inactive: false };
        };

        if now - record.last_seen <= self.timeout {
            return HeartbeatCheck { liveness: Liveness::Active, newly_inactive: false };
        }

        let newly_inactive = !record.reported_inactive;
        record.reported_inactive = true;
        if newly_inactive {
            tracing::warn!(
                resource_id,
                last_seen = %record.last_seen,
                "Controller heartbeat timed out"
            );
        }
        HeartbeatCheck { liveness: Liveness::Inactive, newly_inactive }
    }

    /// Un-reports the inactive edge so the next check fires it again.
    pub async fn rearm(&self, resource_id: &str) {
        if let Some(record) = self.records.lock().await.get_mut(resource_id) {
            record.reported_inactive = false;
        }
    }

    pub async fn stop(&self, resource_id: &str) -> bool {
        let removed = self.records.lock().await.remove(resource_id).is_some();
        if removed {
            tracing::info!(resource_id, "Controller heartbeat stopped");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn unknown_resource_was_never_seen() {
        let monitor = HeartbeatMonitor::new(10);
        let check = monitor.check_at("game-1", t0()).await;
        assert_eq!(check.liveness, Liveness::NeverSeen);
        assert!(!check.newly_inactive);
    }

    #[tokio::test]
    async fn goes_inactive_after_timeout_exactly_once() {
        let monitor = HeartbeatMonitor::new(10);
        monitor.beat_at("game-1", t0()).await;

        let check = monitor.check_at("game-1", t0() + Duration::seconds(9)).await;
        assert_eq!(check.liveness, Liveness::Active);

        let check = monitor.check_at("game-1", t0() + Duration::seconds(10)).await;
        assert_eq!(check.liveness, Liveness::Active);

        let check = monitor.check_at("game-1", t0() + Duration::seconds(11)).await;
        assert_eq!(check, HeartbeatCheck { liveness: Liveness::Inactive, newly_inactive: true });

        let check = monitor.check_at("game-1", t0() + Duration::seconds(16)).await;
        assert_eq!(check, HeartbeatCheck { liveness: Liveness::Inactive, newly_inactive: false });
    }

    #[tokio::test]
    async fn new_beat_reactivates_and_rearms_transition() {
        let monitor = HeartbeatMonitor::new(10);
        monitor.beat_at("game-1", t0()).await;
        assert!(monitor.check_at("game-1", t0() + Duration::seconds(20)).await.newly_inactive);

        monitor.beat_at("game-1", t0() + Duration::seconds(21)).await;
        let check = monitor.check_at("game-1", t0() + Duration::seconds(25)).await;
        assert_eq!(check.liveness, Liveness::Active);

        let check = monitor.check_at("game-1", t0() + Duration::seconds(40)).await;
        assert!(check.newly_inactive);
    }

    #[tokio::test]
    async fn rearmed_transition_fires_again() {
        let monitor = HeartbeatMonitor::new(10);
        monitor.beat_at("game-1", t0()).await;
        assert!(monitor.check_at("game-1", t0() + Duration::seconds(11)).await.newly_inactive);

        monitor.rearm("game-1").await;
        assert!(monitor.check_at("game-1", t0() + Duration::seconds(12)).await.newly_inactive);
        assert!(!monitor.check_at("game-1", t0() + Duration::seconds(13)).await.newly_inactive);

        monitor.rearm("game-2").await;
        assert_eq!(monitor.check_at("game-2", t0()).await.liveness, Liveness::NeverSeen);
    }

    #[tokio::test]
    async fn stop_forgets_the_controller() {
        let monitor = HeartbeatMonitor::new(10);
        monitor.beat_at("game-1", t0()).await;
        assert!(monitor.stop("game-1").await);
        assert!(!monitor.stop("game-1").await);
        let check = monitor.check_at("game-1", t0()).await;
        assert_eq!(check.liveness, Liveness::NeverSeen);
    }

    #[tokio::test]
    async fn resources_are_tracked_independently() {
        let monitor = HeartbeatMonitor::new(10);
        monitor.beat_at("game-1", t0()).await;
        monitor.beat_at("game-2", t0() + Duration::seconds(8)).await;

        let later = t0() + Duration::seconds(12);
        assert_eq!(monitor.check_at("game-1", later).await.liveness, Liveness::Inactive);
        assert_eq!(monitor.check_at("game-2", later).await.liveness, Liveness::Active);
    }
}
