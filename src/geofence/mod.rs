//! Work-area checks for incoming member locations.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::store::model::{GeoPoint, Group, GroupId, LocationSample, UserId};
use crate::utils::calculate_distance;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub group_id: GroupId,
    pub user_id: UserId,
    /// Meters from the center, rounded.
    pub distance: u64,
    pub radius: f64,
    pub center: GeoPoint,
    pub at: DateTime<Utc>,
}

/// Returns a violation when `sample` lies outside the group's work area.
/// Groups without a center never produce one.
pub fn evaluate(
    group: &Group,
    user_id: &str,
    sample: &LocationSample,
    now: DateTime<Utc>,
) -> Option<Violation> {
    let center = group.center?;
    let distance = calculate_distance(
        center.lat,
        center.lng,
        sample.coords.latitude,
        sample.coords.longitude,
    );
    if distance <= group.work_radius {
        return None;
    }
    Some(Violation {
        group_id: group.id.clone(),
        user_id: user_id.to_string(),
        distance: distance.round() as u64,
        radius: group.work_radius,
        center,
        at: now,
    })
}

#[derive(Debug, Clone, Copy)]
struct MemberFence {
    /// Device timestamp of the newest sample judged so far.
    newest: i64,
    alerted_at: Option<DateTime<Utc>>,
}

/// [`evaluate`] plus a per-member cooldown so a member who stays outside
/// the area is reported once per window. Samples older than one already
/// judged for the same member are ignored.
pub struct GeofenceEvaluator {
    cooldown: Duration,
    fences: Mutex<HashMap<(GroupId, UserId), MemberFence>>,
}

impl GeofenceEvaluator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            fences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(
        &self,
        group: &Group,
        user_id: &str,
        sample: &LocationSample,
        now: DateTime<Utc>,
    ) -> Option<Violation> {
        let mut fences = self.fences.lock().await;
        let fence = fences
            .entry((group.id.clone(), user_id.to_string()))
            .or_insert(MemberFence {
                newest: i64::MIN,
                alerted_at: None,
            });

        if sample.timestamp < fence.newest {
            tracing::trace!(group_id = %group.id, user_id, "Stale sample skipped by geofence");
            return None;
        }
        fence.newest = sample.timestamp;

        let Some(violation) = evaluate(group, user_id, sample, now) else {
            // Back inside: the next exit alerts immediately.
            fence.alerted_at = None;
            return None;
        };

        if let Some(previous) = fence.alerted_at {
            let elapsed = (now - previous).to_std().unwrap_or_default();
            if elapsed < self.cooldown {
                tracing::trace!(group_id = %group.id, user_id, "Geofence violation suppressed by cooldown");
                return None;
            }
        }

        fence.alerted_at = Some(now);
        tracing::info!(
            group_id = %group.id,
            user_id,
            distance = violation.distance,
            radius = violation.radius,
            "Member left the work area"
        );
        Some(violation)
    }

    /// Forgets throttle state for a group, e.g. after it was deleted.
    pub async fn forget_group(&self, group_id: &str) {
        self.fences
            .lock()
            .await
            .retain(|(gid, _), _| gid != group_id);
    }

    /// Forgets one member's throttle state once they are out of the group.
    pub async fn forget_member(&self, group_id: &str, user_id: &str) {
        self.fences
            .lock()
            .await
            .remove(&(group_id.to_string(), user_id.to_string()));
    }
}

impl Default for GeofenceEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
