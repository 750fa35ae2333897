use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::store::model::{GroupId, LocationSample, Snapshot, UserId};

/// How recent `last_seen` must be for a member to count as active.
///
/// The dashboard and the live map deliberately use different windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityWindow {
    /// 15 minutes.
    Dashboard,
    /// 5 minutes, used for "online" badges.
    LiveMap,
    Custom(Duration),
}

impl ActivityWindow {
    pub fn duration(self) -> Duration {
        match self {
            ActivityWindow::Dashboard => Duration::from_secs(15 * 60),
            ActivityWindow::LiveMap => Duration::from_secs(5 * 60),
            ActivityWindow::Custom(d) => d,
        }
    }

    pub fn contains(self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - last_seen)
            .to_std()
            .map(|elapsed| elapsed < self.duration())
            // last_seen in the future counts as just seen
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub sample: LocationSample,
    pub last_seen: DateTime<Utc>,
}

/// Derived index group → member → latest known location.
///
/// Only the batch flush writes here; everything else reads.
#[derive(Default)]
pub struct PresenceDirectory {
    entries: RwLock<HashMap<GroupId, HashMap<UserId, PresenceEntry>>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the directory from stored history: for each member, their
    /// newest sample, with `last_seen` taken from the sample itself.
    pub async fn rebuild(&self, snapshot: &Snapshot) {
        let mut rebuilt: HashMap<GroupId, HashMap<UserId, PresenceEntry>> = HashMap::new();
        for (group_id, members) in &snapshot.group_members {
            for member in members {
                let latest = snapshot
                    .location_history
                    .get(&member.user_id)
                    .and_then(|history| history.iter().max_by_key(|s| s.timestamp));
                let Some(sample) = latest else { continue };
                let last_seen = DateTime::from_timestamp_millis(sample.timestamp).unwrap_or_default();
                rebuilt.entry(group_id.clone()).or_default().insert(
                    member.user_id.clone(),
                    PresenceEntry {
                        sample: *sample,
                        last_seen,
                    },
                );
            }
        }
        let count: usize = rebuilt.values().map(HashMap::len).sum();
        *self.entries.write().await = rebuilt;
        tracing::info!(entries = count, "Presence directory rebuilt");
    }

    /// Records `sample` for the member unless a newer sample (by device
    /// timestamp) is already present. Returns whether the entry changed.
    pub async fn record(
        &self,
        group_id: &str,
        user_id: &str,
        sample: LocationSample,
        now: DateTime<Utc>,
    ) -> bool {
        let mut entries = self.entries.write().await;
        let group = entries.entry(group_id.to_string()).or_default();
        match group.get_mut(user_id) {
            Some(existing) if existing.sample.timestamp > sample.timestamp => false,
            Some(existing) => {
                existing.sample = sample;
                existing.last_seen = now;
                true
            }
            None => {
                group.insert(
                    user_id.to_string(),
                    PresenceEntry {
                        sample,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Drops entries whose (group, member) pair no longer exists.
    pub async fn retain_members(&self, members: &HashSet<(GroupId, UserId)>) -> usize {
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        entries.retain(|group_id, group| {
            group.retain(|user_id, _| {
                let keep = members.contains(&(group_id.clone(), user_id.clone()));
                if !keep {
                    removed += 1;
                }
                keep
            });
            !group.is_empty()
        });
        removed
    }

    pub async fn latest(&self, group_id: &str, user_id: &str) -> Option<PresenceEntry> {
        self.entries
            .read()
            .await
            .get(group_id)?
            .get(user_id)
            .cloned()
    }

    pub async fn group(&self, group_id: &str) -> HashMap<UserId, PresenceEntry> {
        self.entries
            .read()
            .await
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn active_members(
        &self,
        group_id: &str,
        window: ActivityWindow,
        now: DateTime<Utc>,
    ) -> Vec<(UserId, PresenceEntry)> {
        let entries = self.entries.read().await;
        let Some(group) = entries.get(group_id) else {
            return Vec::new();
        };
        let mut active: Vec<_> = group
            .iter()
            .filter(|(_, entry)| window.contains(entry.last_seen, now))
            .map(|(user_id, entry)| (user_id.clone(), entry.clone()))
            .collect();
        active.sort_by(|a, b| a.0.cmp(&b.0));
        active
    }

    pub async fn active_count(&self, group_id: &str, window: ActivityWindow, now: DateTime<Utc>) -> usize {
        self.entries
            .read()
            .await
            .get(group_id)
            .map(|group| {
                group
                    .values()
                    .filter(|entry| window.contains(entry.last_seen, now))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::Coords;

    fn sample(timestamp: i64) -> LocationSample {
        LocationSample {
            timestamp,
            coords: Coords {
                latitude: 41.0,
                longitude: 29.0,
                accuracy: None,
                heading: None,
                speed: None,
            },
        }
    }

    #[tokio::test]
    async fn out_of_order_sample_does_not_replace_newer_one() {
        let presence = PresenceDirectory::new();
        let now = Utc::now();

        assert!(presence.record("g", "u", sample(100), now).await);
        assert!(!presence.record("g", "u", sample(50), now).await);

        assert_eq!(presence.latest("g", "u").await.unwrap().sample.timestamp, 100);
    }

    #[tokio::test]
    async fn replaying_a_sample_keeps_the_same_latest_state() {
        let presence = PresenceDirectory::new();
        let now = Utc::now();
        presence.record("g", "u", sample(100), now).await;
        presence.record("g", "u", sample(100), now).await;

        let entry = presence.latest("g", "u").await.unwrap();
        assert_eq!(entry.sample, sample(100));
        assert_eq!(entry.last_seen, now);
    }

    #[tokio::test]
    async fn dashboard_and_live_map_windows_differ() {
        let presence = PresenceDirectory::new();
        let now = Utc::now();
        presence
            .record("g", "recent", sample(1), now - chrono::Duration::minutes(2))
            .await;
        presence
            .record("g", "idle", sample(1), now - chrono::Duration::minutes(10))
            .await;
        presence
            .record("g", "gone", sample(1), now - chrono::Duration::minutes(30))
            .await;

        assert_eq!(presence.active_count("g", ActivityWindow::LiveMap, now).await, 1);
        assert_eq!(presence.active_count("g", ActivityWindow::Dashboard, now).await, 2);

        let active = presence
            .active_members("g", ActivityWindow::Dashboard, now)
            .await;
        let ids: Vec<&str> = active.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["idle", "recent"]);
    }

    #[tokio::test]
    async fn retain_members_prunes_departed_members() {
        let presence = PresenceDirectory::new();
        let now = Utc::now();
        presence.record("g", "stay", sample(1), now).await;
        presence.record("g", "left", sample(1), now).await;
        presence.record("deleted", "x", sample(1), now).await;

        let members = HashSet::from([("g".to_string(), "stay".to_string())]);
        assert_eq!(presence.retain_members(&members).await, 2);
        assert!(presence.latest("g", "left").await.is_none());
        assert!(presence.group("deleted").await.is_empty());
        assert!(presence.latest("g", "stay").await.is_some());
    }
}
