use std::collections::{BTreeMap, HashSet};

use axum::{
    Extension,
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::AppState;
use crate::access::authorize_group;
use crate::error::{AppResult, CoreError};
use crate::location::ActivityWindow;
use crate::utils::{Claims, success_to_api_response};
use crate::ws::events::sample_from;
use crate::ws::publish::{publish_device_location, publish_group_location};

use super::model::{
    Dashboard, DeviceLocationRequest, GroupActivity, GroupLocationRequest, IngestResult,
    MemberLocation, PurgeResult, RecentQuery,
};

#[axum::debug_handler]
pub async fn post_group_location(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<GroupLocationRequest>,
) -> AppResult<impl IntoResponse> {
    let access = authorize_group(&state.store, &claims.sub, &group_id).await?;
    let sample = sample_from(req.coords, req.timestamp);
    let violation = publish_group_location(&state, &access, sample, None).await?;
    Ok((
        StatusCode::ACCEPTED,
        success_to_api_response(IngestResult {
            accepted: true,
            violation,
        }),
    ))
}

#[axum::debug_handler]
pub async fn ingest_location(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<DeviceLocationRequest>,
) -> AppResult<impl IntoResponse> {
    let device_id = req
        .device_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| claims.sub.clone());
    let sample = sample_from(req.coords, req.timestamp);
    publish_device_location(&state, &claims.sub, &device_id, sample, None).await?;
    Ok((
        StatusCode::ACCEPTED,
        success_to_api_response(IngestResult {
            accepted: true,
            violation: None,
        }),
    ))
}

#[axum::debug_handler]
pub async fn group_locations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    authorize_group(&state.store, &claims.sub, &group_id).await?;
    let locations: BTreeMap<_, _> = state.presence.group(&group_id).await.into_iter().collect();
    Ok(success_to_api_response(locations))
}

#[axum::debug_handler]
pub async fn members_with_locations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    authorize_group(&state.store, &claims.sub, &group_id).await?;
    let presence = state.presence.group(&group_id).await;
    let now = Utc::now();

    let mut members = Vec::new();
    for membership in state.store.members(&group_id).await? {
        let location = presence.get(&membership.user_id).cloned();
        let display_name = state
            .store
            .user(&membership.user_id)
            .await
            .map(|u| u.display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| membership.user_id.clone());
        members.push(MemberLocation {
            is_online: location
                .as_ref()
                .is_some_and(|entry| ActivityWindow::LiveMap.contains(entry.last_seen, now)),
            last_seen: location.as_ref().map(|entry| entry.last_seen),
            location,
            display_name,
            user_id: membership.user_id,
            role: membership.role,
            joined_at: membership.joined_at,
        });
    }
    Ok(success_to_api_response(members))
}

/// History of one device. A member's history is readable by its owner and
/// by anyone sharing a group with them; a free-standing device's history is
/// as open as its device room.
#[axum::debug_handler]
pub async fn recent_locations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(device_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> AppResult<impl IntoResponse> {
    if device_id != claims.sub && !state.store.is_known_user(&device_id).await {
        let history = state
            .store
            .device_history(&device_id, query.since, query.limit)
            .await;
        return Ok(success_to_api_response(history));
    }

    if device_id != claims.sub {
        let mine: HashSet<_> = state
            .store
            .group_ids_for_user(&claims.sub)
            .await
            .into_iter()
            .collect();
        let shared = state
            .store
            .group_ids_for_user(&device_id)
            .await
            .iter()
            .any(|group_id| mine.contains(group_id));
        if !shared {
            return Err(CoreError::Forbidden("no group shared with this device".into()).into());
        }
    }

    let history = state
        .store
        .location_history(&device_id, query.since, query.limit)
        .await;
    Ok(success_to_api_response(history))
}

/// Active members per group over the dashboard window.
#[axum::debug_handler]
pub async fn dashboard(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let now = Utc::now();
    let mut groups = Vec::new();
    for user_group in state.store.groups_for_user(&claims.sub).await {
        let active_members = state
            .presence
            .active_count(&user_group.group.id, ActivityWindow::Dashboard, now)
            .await;
        groups.push(GroupActivity {
            group_id: user_group.group.id,
            name: user_group.group.name,
            member_count: user_group.member_count,
            active_members,
        });
    }
    let total_active = groups.iter().map(|g| g.active_members).sum();
    Ok(success_to_api_response(Dashboard {
        groups,
        total_active,
    }))
}

#[axum::debug_handler]
pub async fn purge_my_locations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let purged = state.store.purge_locations(&claims.sub).await;
    tracing::info!(user_id = %claims.sub, purged, "Location history purged");
    Ok(success_to_api_response(PurgeResult { purged }))
}
