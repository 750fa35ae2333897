use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::manager::RoomManager;

/// Spawns the keep-alive loop: every `interval` it closes connections that
/// have been silent for longer than `idle_timeout`, then pings the rest.
/// A zero `interval` is treated as one second.
pub fn start_heartbeat(
    rooms: Arc<RoomManager>,
    interval: Duration,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            rooms.reap_idle(idle_timeout, Utc::now()).await;
            let count = rooms.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            rooms.ping_all().await;
        }
    })
}
