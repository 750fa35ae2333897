use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::model::{GeoPoint, Group, Membership, Role, User, Visibility};

/// Public view of a group, returned to anyone holding its code.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: String,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub member_count: usize,
}

impl GroupInfo {
    pub fn new(group: Group, member_count: usize) -> Self {
        Self {
            id: group.id,
            code: group.code,
            name: group.name,
            address: group.address,
            member_count,
        }
    }
}

/// Full view of a group for its members.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDetail {
    pub id: String,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub center: Option<GeoPoint>,
    pub work_radius: f64,
    pub visibility: Visibility,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl From<Group> for GroupDetail {
    fn from(group: Group) -> Self {
        Self {
            id: group.id,
            code: group.code,
            name: group.name,
            address: group.address,
            center: group.center,
            work_radius: group.work_radius,
            visibility: group.visibility,
            created_by: group.created_by,
            created_at: group.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCenterRequest {
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default)]
    pub work_radius: Option<f64>,
    /// Turns geofencing off for the group.
    #[serde(default)]
    pub clear_center: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestBody {
    pub code: String,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAdminRequest {
    pub new_admin_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl MemberInfo {
    /// Falls back to the user id when the profile is unknown.
    pub fn new(membership: Membership, user: Option<User>) -> Self {
        let display_name = user
            .map(|u| u.display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| membership.user_id.clone());
        Self {
            user_id: membership.user_id,
            display_name,
            role: membership.role,
            joined_at: membership.joined_at,
        }
    }
}
