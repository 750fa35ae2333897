use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::presence::PresenceDirectory;
use crate::store::Store;
use crate::store::model::{LocationSample, Track};

pub const DEFAULT_QUEUE_LIMIT: usize = 100;

/// Result of one flush pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub devices: usize,
    pub samples: usize,
    pub presence_updates: usize,
}

/// Per-track FIFO queues that absorb high-frequency samples and apply them
/// to the store in periodic flushes.
pub struct LocationBatcher {
    queues: Mutex<HashMap<Track, VecDeque<LocationSample>>>,
    queue_limit: usize,
    store: Arc<Store>,
    presence: Arc<PresenceDirectory>,
}

impl LocationBatcher {
    pub fn new(store: Arc<Store>, presence: Arc<PresenceDirectory>, queue_limit: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            queue_limit: queue_limit.max(1),
            store,
            presence,
        }
    }

    /// Queues a sample for `track`. Invalid samples are dropped and
    /// `false` is returned. A full queue sheds its oldest sample.
    pub async fn add_to_batch(&self, track: &Track, sample: LocationSample) -> bool {
        let device_id = track.id();
        if let Err(e) = sample.validate() {
            tracing::debug!(device_id, error = %e, "Dropping invalid location sample");
            return false;
        }

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(track.clone()).or_default();
        if queue.len() >= self.queue_limit {
            queue.pop_front();
            tracing::debug!(device_id, limit = self.queue_limit, "Batch queue full, dropped oldest sample");
        }
        queue.push_back(sample);
        true
    }

    pub async fn queue_len(&self, track: &Track) -> usize {
        self.queues
            .lock()
            .await
            .get(track)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drains every queue into the store in arrival order and refreshes the
    /// presence entry of each member in every group they belong to.
    pub async fn flush(&self) -> FlushReport {
        let drained: Vec<(Track, Vec<LocationSample>)> = {
            let mut queues = self.queues.lock().await;
            queues
                .drain()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(track, queue)| (track, Vec::from(queue)))
                .collect()
        };

        let mut report = FlushReport::default();
        if drained.is_empty() {
            return report;
        }

        let now = Utc::now();
        for (track, samples) in drained {
            report.devices += 1;
            report.samples += samples.len();

            let Some(latest) = samples.iter().max_by_key(|s| s.timestamp).copied() else {
                continue;
            };
            self.store.append_locations(&track, samples).await;

            let Track::Member(user_id) = &track else {
                continue;
            };
            for group_id in self.store.group_ids_for_user(user_id).await {
                if self.presence.record(&group_id, user_id, latest, now).await {
                    report.presence_updates += 1;
                }
            }
        }

        let pruned = self
            .presence
            .retain_members(&self.store.member_pairs().await)
            .await;

        tracing::debug!(
            devices = report.devices,
            samples = report.samples,
            presence_updates = report.presence_updates,
            pruned,
            "Location batch flushed"
        );
        report
    }

    /// Spawns the periodic flush loop. A zero `interval` is treated as 1 ms.
    pub fn start(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }
}
