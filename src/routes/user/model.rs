use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::model::Role;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    /// Expiry of the token used for this request, seconds since the epoch.
    pub token_expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenResponse {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub code: String,
    pub name: String,
    pub address: Option<String>,
    pub role: Role,
    pub is_admin: bool,
    pub member_count: usize,
    /// Members seen within the live-map window.
    pub online_count: usize,
    pub created_at: DateTime<Utc>,
}
