use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geofence::Violation;
use crate::location::PresenceEntry;
use crate::store::model::{Coords, Role};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLocationRequest {
    pub coords: Coords,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Per-device ingest. Without `deviceId` the caller's own id is used.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLocationRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    pub coords: Coords,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLocation {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub location: Option<PresenceEntry>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupActivity {
    pub group_id: String,
    pub name: String,
    pub member_count: usize,
    pub active_members: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub groups: Vec<GroupActivity>,
    pub total_active: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResult {
    pub purged: bool,
}
