use std::sync::Arc;

use config::Config;
use geofence::GeofenceEvaluator;
use location::{LocationBatcher, PresenceDirectory};
use notify::PushNotifier;
use store::{Store, StoreOptions};
use ws::RoomManager;

pub mod access;
pub mod config;
pub mod error;
pub mod geofence;
pub mod location;
pub mod middleware;
pub mod notify;
pub mod router;
pub mod routes;
pub mod store;
pub mod utils;
pub mod ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub presence: Arc<PresenceDirectory>,
    pub batcher: Arc<LocationBatcher>,
    pub geofence: Arc<GeofenceEvaluator>,
    pub rooms: Arc<RoomManager>,
    pub notifier: Arc<dyn PushNotifier>,
}

impl AppState {
    /// Opens the store and wires every component around it. Background
    /// loops (flush, heartbeat) are started by the caller.
    pub async fn build(config: Config) -> Self {
        let notifier = notify::from_config(&config);
        Self::with_notifier(config, notifier).await
    }

    pub async fn with_notifier(config: Config, notifier: Arc<dyn PushNotifier>) -> Self {
        let store = Store::open(StoreOptions::from(&config)).await;

        let presence = Arc::new(PresenceDirectory::new());
        presence.rebuild(&store.snapshot().await).await;

        let batcher = Arc::new(LocationBatcher::new(
            store.clone(),
            presence.clone(),
            config.batch_queue_limit,
        ));

        Self {
            geofence: Arc::new(GeofenceEvaluator::new(config.geofence_cooldown())),
            rooms: Arc::new(RoomManager::new()),
            config,
            store,
            presence,
            batcher,
            notifier,
        }
    }

    /// Drains pending samples, writes the store once more and closes every
    /// socket.
    pub async fn shutdown(&self) {
        let report = self.batcher.flush().await;
        tracing::info!(samples = report.samples, "Flushed location batches before shutdown");
        if let Err(e) = self.store.save().await {
            tracing::error!(error = %e, "Final save failed");
        }
        self.rooms.shutdown_all().await;
    }
}
