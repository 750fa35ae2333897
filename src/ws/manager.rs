use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};

use super::events::ServerEvent;
use crate::store::model::{DeviceId, GroupId, UserId};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// A named set of connections that receive the same broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Device(DeviceId),
    Group(GroupId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Device(id) => write!(f, "device-{id}"),
            Room::Group(id) => write!(f, "group_{id}"),
        }
    }
}

pub struct WsConnection {
    /// Set once the connection presented a valid token.
    pub user_id: Option<UserId>,
    pub sender: WsSender,
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame of any kind, pongs included.
    pub last_seen: DateTime<Utc>,
    pub rooms: HashSet<Room>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, WsConnection>,
    rooms: HashMap<Room, HashSet<String>>,
}

impl Registry {
    fn leave(&mut self, conn_id: &str, room: &Room) -> bool {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return false;
        };
        if !conn.rooms.remove(room) {
            return false;
        }
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
        true
    }

    fn remove(&mut self, conn_id: &str) -> Option<WsConnection> {
        let conn = self.connections.remove(conn_id)?;
        for room in &conn.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(conn_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(conn)
    }
}

/// Tracks live connections and the rooms they joined.
///
/// Connections and rooms share one lock so a broadcast never observes a
/// connection that is half-way through joining or leaving.
pub struct RoomManager {
    registry: RwLock<Registry>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Registers a connection and returns the receiver that feeds its sink.
    pub async fn add(
        &self,
        conn_id: String,
        user_id: Option<UserId>,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        let conn = WsConnection {
            user_id,
            sender: tx,
            connected_at: now,
            last_seen: now,
            rooms: HashSet::new(),
        };
        self.registry.write().await.connections.insert(conn_id, conn);
        rx
    }

    /// Drops a connection and its room memberships.
    pub async fn remove(&self, conn_id: &str) {
        if let Some(conn) = self.registry.write().await.remove(conn_id) {
            tracing::debug!(
                conn_id,
                rooms = conn.rooms.len(),
                connected_for = %(Utc::now() - conn.connected_at),
                "Connection removed"
            );
        }
    }

    pub async fn authenticate(&self, conn_id: &str, user_id: UserId) -> bool {
        match self.registry.write().await.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.user_id = Some(user_id);
                true
            }
            None => false,
        }
    }

    pub async fn user_of(&self, conn_id: &str) -> Option<UserId> {
        self.registry
            .read()
            .await
            .connections
            .get(conn_id)?
            .user_id
            .clone()
    }

    pub async fn join(&self, conn_id: &str, room: Room) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get_mut(conn_id) else {
            return false;
        };
        conn.rooms.insert(room.clone());
        registry
            .rooms
            .entry(room)
            .or_default()
            .insert(conn_id.to_string());
        true
    }

    pub async fn leave(&self, conn_id: &str, room: &Room) -> bool {
        self.registry.write().await.leave(conn_id, room)
    }

    pub async fn rooms_of(&self, conn_id: &str) -> HashSet<Room> {
        self.registry
            .read()
            .await
            .connections
            .get(conn_id)
            .map(|conn| conn.rooms.clone())
            .unwrap_or_default()
    }

    /// Takes every connection of `user_id` out of `room`, e.g. after the
    /// user stopped being a member of the group.
    pub async fn evict_user(&self, room: &Room, user_id: &str) -> usize {
        let mut registry = self.registry.write().await;
        let targets: Vec<String> = registry
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| {
                        registry
                            .connections
                            .get(*id)
                            .is_some_and(|c| c.user_id.as_deref() == Some(user_id))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for conn_id in &targets {
            registry.leave(conn_id, room);
        }
        targets.len()
    }

    /// Empties a room, e.g. after its group was deleted.
    pub async fn close_room(&self, room: &Room) -> usize {
        let mut registry = self.registry.write().await;
        let Some(members) = registry.rooms.remove(room) else {
            return 0;
        };
        for conn_id in &members {
            if let Some(conn) = registry.connections.get_mut(conn_id) {
                conn.rooms.remove(room);
            }
        }
        members.len()
    }

    pub async fn send_to(&self, conn_id: &str, event: &ServerEvent) -> bool {
        let Some(message) = event.to_message() else {
            return false;
        };
        match self.registry.read().await.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Sends `event` to every connection in `room` except `except`.
    ///
    /// Closed channels are skipped; their receive loop cleans them up.
    /// Returns the number of connections the event was queued for.
    pub async fn broadcast(&self, room: &Room, event: &ServerEvent, except: Option<&str>) -> usize {
        let Some(message) = event.to_message() else {
            return 0;
        };
        let registry = self.registry.read().await;
        let Some(members) = registry.rooms.get(room) else {
            return 0;
        };
        let mut sent = 0;
        for conn_id in members {
            if Some(conn_id.as_str()) == except {
                continue;
            }
            if let Some(conn) = registry.connections.get(conn_id) {
                if conn.sender.send(message.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        tracing::trace!(room = %room, kind = event.kind(), sent, "Event broadcast");
        sent
    }

    pub async fn touch(&self, conn_id: &str) {
        if let Some(conn) = self.registry.write().await.connections.get_mut(conn_id) {
            conn.last_seen = Utc::now();
        }
    }

    /// Closes and removes connections silent for longer than `timeout`.
    pub async fn reap_idle(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut registry = self.registry.write().await;
        let idle: Vec<String> = registry
            .connections
            .iter()
            .filter(|(_, conn)| {
                (now - conn.last_seen)
                    .to_std()
                    .is_ok_and(|silent| silent > timeout)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for conn_id in &idle {
            if let Some(conn) = registry.remove(conn_id) {
                let _ = conn.sender.send(Message::Close(None));
            }
        }
        if !idle.is_empty() {
            tracing::info!(count = idle.len(), "Reaped idle WebSocket connections");
        }
        idle
    }

    pub async fn ping_all(&self) {
        let registry = self.registry.read().await;
        for conn in registry.connections.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }

    /// Sends a Close frame to every connection, then forgets them all.
    pub async fn shutdown_all(&self) {
        let mut registry = self.registry.write().await;
        let count = registry.connections.len();
        for conn in registry.connections.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        registry.connections.clear();
        registry.rooms.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn room_size(&self, room: &Room) -> usize {
        self.registry
            .read()
            .await
            .rooms
            .get(room)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(t) => serde_json::from_str(t.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn room_names() {
        assert_eq!(Room::Device("d1".into()).to_string(), "device-d1");
        assert_eq!(Room::Group("g1".into()).to_string(), "group_g1");
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_other_rooms() {
        let manager = RoomManager::new();
        let mut a = manager.add("a".into(), Some("alice".into())).await;
        let mut b = manager.add("b".into(), Some("bob".into())).await;
        let mut c = manager.add("c".into(), Some("carol".into())).await;
        let room = Room::Group("g".into());
        manager.join("a", room.clone()).await;
        manager.join("b", room.clone()).await;
        manager.join("c", Room::Group("other".into())).await;

        let event = ServerEvent::GroupDeleted { group_id: "g".into() };
        assert_eq!(manager.broadcast(&room, &event, Some("a")).await, 1);

        assert_eq!(text(b.try_recv().unwrap())["type"], "group_deleted");
        assert!(a.try_recv().is_err());
        assert!(c.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_clears_room_membership() {
        let manager = RoomManager::new();
        let _rx = manager.add("a".into(), None).await;
        let room = Room::Device("d".into());
        manager.join("a", room.clone()).await;
        assert_eq!(manager.room_size(&room).await, 1);

        manager.remove("a").await;
        assert_eq!(manager.room_size(&room).await, 0);
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn evict_user_only_touches_that_user() {
        let manager = RoomManager::new();
        let _a1 = manager.add("a1".into(), Some("alice".into())).await;
        let _a2 = manager.add("a2".into(), Some("alice".into())).await;
        let _b = manager.add("b".into(), Some("bob".into())).await;
        let room = Room::Group("g".into());
        for id in ["a1", "a2", "b"] {
            manager.join(id, room.clone()).await;
        }

        assert_eq!(manager.evict_user(&room, "alice").await, 2);
        assert_eq!(manager.room_size(&room).await, 1);
        assert!(manager.rooms_of("a1").await.is_empty());
    }

    #[tokio::test]
    async fn close_room_keeps_connections_alive() {
        let manager = RoomManager::new();
        let _a = manager.add("a".into(), None).await;
        let room = Room::Group("g".into());
        manager.join("a", room.clone()).await;

        assert_eq!(manager.close_room(&room).await, 1);
        assert_eq!(manager.room_size(&room).await, 0);
        assert_eq!(manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn idle_connections_are_closed_and_removed() {
        let manager = RoomManager::new();
        let mut quiet = manager.add("quiet".into(), None).await;
        let _busy = manager.add("busy".into(), None).await;
        manager.join("quiet", Room::Group("g".into())).await;

        let later = Utc::now() + chrono::Duration::seconds(90);
        {
            let mut registry = manager.registry.write().await;
            if let Some(conn) = registry.connections.get_mut("busy") {
                conn.last_seen = later;
            }
        }

        let reaped = manager.reap_idle(Duration::from_secs(60), later).await;
        assert_eq!(reaped, vec!["quiet".to_string()]);
        assert!(matches!(quiet.try_recv(), Ok(Message::Close(None))));
        assert_eq!(manager.connection_count().await, 1);
        assert_eq!(manager.room_size(&Room::Group("g".into())).await, 0);
    }

    #[tokio::test]
    async fn authenticate_sets_user() {
        let manager = RoomManager::new();
        let _rx = manager.add("a".into(), None).await;
        assert_eq!(manager.user_of("a").await, None);
        assert!(manager.authenticate("a", "alice".into()).await);
        assert_eq!(manager.user_of("a").await.as_deref(), Some("alice"));
        assert!(!manager.authenticate("missing", "x".into()).await);
    }
}
