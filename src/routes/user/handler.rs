use axum::{
    extract::{Extension, Json, State},
    response::IntoResponse,
};
use chrono::Utc;

use crate::{
    AppState,
    error::{AppResult, CoreError},
    location::ActivityWindow,
    store::{UserGroup, model::{Role, User}},
    utils::{Claims, generate_token, success_to_api_response},
};

use super::model::{GroupSummary, ProfileResponse, RefreshTokenResponse, UpdateProfileRequest};

#[axum::debug_handler]
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let user = state.store.user(&claims.sub).await;
    success_to_api_response(ProfileResponse {
        email: user.as_ref().map(|u| u.email.clone()).unwrap_or_default(),
        display_name: user.map(|u| u.display_name).unwrap_or_default(),
        user_id: claims.sub,
        token_expires_at: claims.exp,
    })
}

#[axum::debug_handler]
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> AppResult<impl IntoResponse> {
    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(CoreError::Validation("display name is required".into()).into());
    }
    let user = User {
        id: claims.sub.clone(),
        email: req.email.trim().to_string(),
        display_name: display_name.to_string(),
    };
    state.store.upsert_user(user.clone()).await;
    Ok(success_to_api_response(ProfileResponse {
        user_id: user.id,
        email: user.email,
        display_name: user.display_name,
        token_expires_at: claims.exp,
    }))
}

#[axum::debug_handler]
pub async fn refresh_token(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let (token, expires_at) = generate_token(&claims.sub, &state.config).map_err(|e| {
        tracing::error!(user_id = %claims.sub, error = %e, "Failed to sign refreshed token");
        CoreError::Unauthorized
    })?;
    Ok(success_to_api_response(RefreshTokenResponse { token, expires_at }))
}

async fn summarize(state: &AppState, groups: Vec<UserGroup>) -> Vec<GroupSummary> {
    let now = Utc::now();
    let mut summaries = Vec::with_capacity(groups.len());
    for UserGroup {
        group,
        role,
        member_count,
    } in groups
    {
        let online_count = state
            .presence
            .active_count(&group.id, ActivityWindow::LiveMap, now)
            .await;
        summaries.push(GroupSummary {
            id: group.id,
            code: group.code,
            name: group.name,
            address: group.address,
            is_admin: role == Role::Admin,
            role,
            member_count,
            online_count,
            created_at: group.created_at,
        });
    }
    summaries
}

#[axum::debug_handler]
pub async fn my_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let groups = state.store.groups_for_user(&claims.sub).await;
    success_to_api_response(summarize(&state, groups).await)
}

#[axum::debug_handler]
pub async fn my_admin_groups(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let groups = state.store.admin_groups(&claims.sub).await;
    success_to_api_response(summarize(&state, groups).await)
}
