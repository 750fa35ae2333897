use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, CoreResult};

pub type UserId = String;
pub type GroupId = String;
pub type DeviceId = String;

pub const DEFAULT_WORK_RADIUS_M: f64 = 150.0;

/// Whose history a sample is filed under. A member reports under their own
/// user id; any other device id is a free-standing tracker kept in its own
/// namespace, which never feeds group presence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Track {
    Member(UserId),
    Device(DeviceId),
}

impl Track {
    pub fn member(user_id: impl Into<UserId>) -> Self {
        Self::Member(user_id.into())
    }

    pub fn device(device_id: impl Into<DeviceId>) -> Self {
        Self::Device(device_id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Member(id) | Self::Device(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn validate(&self) -> CoreResult<()> {
        validate_coordinates(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

fn default_work_radius() -> f64 {
    DEFAULT_WORK_RADIUS_M
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    /// Geofencing is disabled while this is `None`.
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default = "default_work_radius")]
    pub work_radius: f64,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub id: String,
    pub group_id: GroupId,
    pub user_id: UserId,
    pub display_name: String,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// One GPS fix. `timestamp` is milliseconds since the Unix epoch as reported
/// by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub timestamp: i64,
    pub coords: Coords,
}

impl LocationSample {
    pub fn validate(&self) -> CoreResult<()> {
        validate_coordinates(self.coords.latitude, self.coords.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

pub fn validate_coordinates(lat: f64, lng: f64) -> CoreResult<()> {
    if !lat.is_finite() || !lng.is_finite() {
        return Err(CoreError::Validation("coordinates must be finite".into()));
    }
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CoreError::Validation(format!(
            "latitude {lat} out of range [-90, 90]"
        )));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(CoreError::Validation(format!(
            "longitude {lng} out of range [-180, 180]"
        )));
    }
    Ok(())
}

/// Treats an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The complete persisted object graph.
///
/// Every collection tolerates being absent or `null` on disk so an older or
/// hand-edited file still loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub users: BTreeMap<UserId, User>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: BTreeMap<GroupId, Group>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group_members: BTreeMap<GroupId, Vec<Membership>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group_requests: BTreeMap<GroupId, Vec<JoinRequest>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub location_history: BTreeMap<UserId, VecDeque<LocationSample>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_history: BTreeMap<DeviceId, VecDeque<LocationSample>>,
}

fn repair_histories(
    histories: &mut BTreeMap<String, VecDeque<LocationSample>>,
    history_cap: usize,
) -> usize {
    let mut repairs = 0;
    for (device_id, history) in histories.iter_mut() {
        let before = history.len();
        history.retain(LocationSample::is_valid);
        while history.len() > history_cap {
            history.pop_front();
        }
        if history.len() != before {
            tracing::warn!(
                device_id = %device_id,
                dropped = before - history.len(),
                "Dropped invalid or excess location samples on load"
            );
            repairs += 1;
        }
    }
    histories.retain(|_, history| !history.is_empty());
    repairs
}

impl Snapshot {
    pub fn admin_count(&self, group_id: &str) -> usize {
        self.group_members
            .get(group_id)
            .map(|members| members.iter().filter(|m| m.role == Role::Admin).count())
            .unwrap_or(0)
    }

    pub fn membership(&self, group_id: &str, user_id: &str) -> Option<&Membership> {
        self.group_members
            .get(group_id)?
            .iter()
            .find(|m| m.user_id == user_id)
    }

    /// Brings a freshly loaded graph back within its invariants. Returns the
    /// number of repairs made.
    pub fn repair(&mut self, history_cap: usize) -> usize {
        let mut repairs = repair_histories(&mut self.location_history, history_cap)
            + repair_histories(&mut self.device_history, history_cap);

        let orphaned: Vec<GroupId> = self
            .groups
            .keys()
            .filter(|id| self.group_members.get(*id).is_none_or(Vec::is_empty))
            .cloned()
            .collect();
        for group_id in orphaned {
            tracing::warn!(group_id = %group_id, "Removing group without members");
            self.groups.remove(&group_id);
            repairs += 1;
        }

        let groups = &self.groups;
        self.group_members.retain(|id, _| groups.contains_key(id));
        self.group_requests.retain(|id, _| groups.contains_key(id));

        for (group_id, members) in self.group_members.iter_mut() {
            if members.iter().any(|m| m.role == Role::Admin) {
                continue;
            }
            if let Some(oldest) = members.iter_mut().min_by_key(|m| m.joined_at) {
                tracing::warn!(
                    group_id = %group_id,
                    user_id = %oldest.user_id,
                    "Group had no admin, promoting earliest member"
                );
                oldest.role = Role::Admin;
                repairs += 1;
            }
        }

        repairs
    }
}
