// ====================================================================================
// src/hub.rs - 房间广播中心
// ====================================================================================
use crate::models::BroadcastEvent;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use uuid::Uuid;

pub type ViewerId = Uuid;
pub type ViewerSender = mpsc::Sender<BroadcastEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Game,
    Bracket,
    Scoreboard,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Game => "game",
            RoomKind::Bracket => "bracket",
            RoomKind::Scoreboard => "scoreboard",
        }
    }
}

impl FromStr for RoomKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(RoomKind::Game),
            "bracket" => Ok(RoomKind::Bracket),
            "scoreboard" => Ok(RoomKind::Scoreboard),
            other => Err(format!("unknown room kind {:?}", other)),
        }
    }
}

/// `<kind>:<SHARECODE>`; share codes route case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    kind: RoomKind,
    share_code: String,
}

impl RoomKey {
    pub fn new(kind: RoomKind, share_code: &str) -> Self {
        Self { kind, share_code: share_code.trim().to_uppercase() }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.share_code)
    }
}

#[derive(Default)]
struct Room {
    viewers: HashMap<ViewerId, ViewerSender>,
    // 已从表中摘除，迟到的 join 需要重建房间
    closed: bool,
}

impl Room {
    /// Non-blocking sweep over every viewer. Viewers whose queue is closed or
    /// full are evicted after the sweep. Returns (delivered, evicted).
    fn deliver(&mut self, key: &RoomKey, event: &BroadcastEvent) -> (usize, usize) {
        let mut dead = Vec::new();
        for (viewer_id, sender) in &self.viewers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(room = %key, %viewer_id, "Evicting slow viewer, queue full");
                    dead.push(*viewer_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(room = %key, %viewer_id, "Evicting disconnected viewer");
                    dead.push(*viewer_id);
                }
            }
        }
        for viewer_id in &dead {
            self.viewers.remove(viewer_id);
        }
        (self.viewers.len(), dead.len())
    }

    // 人数按当前成员重新计算；若广播过程中又淘汰了连接则再发一次
    fn announce_viewer_count(&mut self, key: &RoomKey) {
        while !self.viewers.is_empty() {
            let event = BroadcastEvent::ViewerCount { count: self.viewers.len() };
            let (_, evicted) = self.deliver(key, &event);
            if evicted == 0 {
                break;
            }
        }
    }
}

/// Fans events out to the viewers of each room.
///
/// The room table lock is only held to look a room up, insert or remove it.
/// Membership changes and deliveries within one room are serialized by that
/// room's own lock, so every member sees publishes in the same order and
/// rooms never wait on each other.
pub struct BroadcastHub {
    rooms: Mutex<HashMap<RoomKey, Arc<Mutex<Room>>>>,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Creates a bounded viewer queue and joins it to `key`.
    pub async fn subscribe(&self, key: &RoomKey) -> (ViewerId, mpsc::Receiver<BroadcastEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let viewer_id = Uuid::new_v4();
        self.join(key, viewer_id, tx).await;
        (viewer_id, rx)
    }

    pub async fn join(&self, key: &RoomKey, viewer_id: ViewerId, sender: ViewerSender) {
        loop {
            let room = {
                let mut rooms = self.rooms.lock().await;
                rooms.entry(key.clone()).or_default().clone()
            };
            let mut guard = room.lock().await;
            if guard.closed {
                continue;
            }
            guard.viewers.insert(viewer_id, sender);
            tracing::debug!(room = %key, %viewer_id, viewers = guard.viewers.len(), "Viewer joined");
            guard.announce_viewer_count(key);
            if guard.viewers.is_empty() {
                self.close_room(key, &room, guard).await;
            }
            return;
        }
    }

    /// Removes a viewer. Leaving twice, or leaving an unknown room, is a no-op.
    pub async fn leave(&self, key: &RoomKey, viewer_id: ViewerId) -> bool {
        let Some(room) = self.room(key).await else {
            return false;
        };
        let mut guard = room.lock().await;
        if guard.viewers.remove(&viewer_id).is_none() {
            return false;
        }
        tracing::debug!(room = %key, %viewer_id, viewers = guard.viewers.len(), "Viewer left");
        guard.announce_viewer_count(key);
        if guard.viewers.is_empty() {
            self.close_room(key, &room, guard).await;
        }
        true
    }

    /// Delivers `event` to the current members of `key` and returns how many
    /// received it. Delivery failures are absorbed here; the failing viewers
    /// are dropped from the room.
    pub async fn publish(&self, key: &RoomKey, event: BroadcastEvent) -> usize {
        let Some(room) = self.room(key).await else {
            return 0;
        };
        let mut guard = room.lock().await;
        if guard.closed {
            return 0;
        }
        let (delivered, evicted) = guard.deliver(key, &event);
        if evicted > 0 {
            guard.announce_viewer_count(key);
        }
        if guard.viewers.is_empty() {
            self.close_room(key, &room, guard).await;
        }
        tracing::debug!(room = %key, delivered, evicted, "Published event");
        delivered
    }

    #[cfg(test)]
    pub async fn viewer_count(&self, key: &RoomKey) -> usize {
        let Some(room) = self.room(key).await else {
            return 0;
        };
        let guard = room.lock().await;
        guard.viewers.len()
    }

    #[cfg(test)]
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    async fn room(&self, key: &RoomKey) -> Option<Arc<Mutex<Room>>> {
        self.rooms.lock().await.get(key).cloned()
    }

    // 持有房间锁的同时摘除空房间，保证不会留下悬空的空房间
    async fn close_room(&self, key: &RoomKey, room: &Arc<Mutex<Room>>, mut guard: MutexGuard<'_, Room>) {
        guard.closed = true;
        let mut rooms = self.rooms.lock().await;
        if rooms.get(key).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(key);
            tracing::debug!(room = %key, "Room closed");
        }
    }
}
