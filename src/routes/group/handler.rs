use axum::{
    Extension,
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;

use crate::AppState;
use crate::access::authorize_group;
use crate::error::{AppResult, CoreError};
use crate::store::NewGroup;
use crate::utils::{Claims, success_to_api_response};
use crate::ws::ServerEvent;
use crate::ws::publish::publish_lifecycle;

use super::model::{
    GroupDetail, GroupInfo, JoinRequestBody, MemberInfo, TransferAdminRequest, UpdateCenterRequest,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Done {
    pub success: bool,
}

const DONE: Done = Done { success: true };

#[axum::debug_handler]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<NewGroup>,
) -> AppResult<impl IntoResponse> {
    let group = state.store.create_group(&claims.sub, req).await?;
    Ok((
        StatusCode::CREATED,
        success_to_api_response(GroupDetail::from(group)),
    ))
}

#[axum::debug_handler]
pub async fn group_info(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> AppResult<impl IntoResponse> {
    let group = state
        .store
        .group_by_code(&code)
        .await
        .ok_or_else(|| CoreError::not_found("group", code.as_str()))?;
    let member_count = state.store.members(&group.id).await?.len();
    Ok(success_to_api_response(GroupInfo::new(group, member_count)))
}

#[axum::debug_handler]
pub async fn group_detail(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    authorize_group(&state.store, &claims.sub, &group_id).await?;
    let group = state
        .store
        .group(&group_id)
        .await
        .ok_or_else(|| CoreError::not_found("group", group_id.as_str()))?;
    Ok(success_to_api_response(GroupDetail::from(group)))
}

#[axum::debug_handler]
pub async fn update_center(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<UpdateCenterRequest>,
) -> AppResult<impl IntoResponse> {
    let group = state
        .store
        .update_group_center(
            &group_id,
            &claims.sub,
            req.center,
            req.work_radius,
            req.clear_center,
        )
        .await?;
    tracing::info!(
        group_id = %group.id,
        center = ?group.center,
        work_radius = group.work_radius,
        "Group work area updated"
    );
    Ok(success_to_api_response(GroupDetail::from(group)))
}

#[axum::debug_handler]
pub async fn delete_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let group = state.store.delete_group(&group_id, &claims.sub).await?;
    publish_lifecycle(&state, ServerEvent::GroupDeleted { group_id: group.id }).await;
    Ok(success_to_api_response(DONE))
}

#[axum::debug_handler]
pub async fn submit_join_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<JoinRequestBody>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .store
        .submit_join_request(&req.code, &claims.sub, &req.display_name)
        .await?;
    publish_lifecycle(
        &state,
        ServerEvent::NewRequest {
            group_id: request.group_id.clone(),
            request: request.clone(),
        },
    )
    .await;
    Ok((StatusCode::CREATED, success_to_api_response(request)))
}

#[axum::debug_handler]
pub async fn pending_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let requests = state.store.pending_requests(&group_id, &claims.sub).await?;
    Ok(success_to_api_response(requests))
}

#[axum::debug_handler]
pub async fn approve_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, request_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let (request, _membership) = state
        .store
        .approve_request(&group_id, &request_id, &claims.sub)
        .await?;
    publish_lifecycle(
        &state,
        ServerEvent::MemberApproved {
            group_id,
            user_id: request.user_id.clone(),
            display_name: request.display_name.clone(),
        },
    )
    .await;
    Ok(success_to_api_response(request))
}

#[axum::debug_handler]
pub async fn reject_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, request_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let request = state
        .store
        .reject_request(&group_id, &request_id, &claims.sub)
        .await?;
    Ok(success_to_api_response(request))
}

#[axum::debug_handler]
pub async fn transfer_admin(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
    Json(req): Json<TransferAdminRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .store
        .transfer_admin(&group_id, &claims.sub, &req.new_admin_id)
        .await?;
    publish_lifecycle(
        &state,
        ServerEvent::AdminTransferred {
            group_id,
            from: claims.sub,
            to: req.new_admin_id,
        },
    )
    .await;
    Ok(success_to_api_response(DONE))
}

#[axum::debug_handler]
pub async fn leave_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.leave_group(&group_id, &claims.sub).await?;
    publish_lifecycle(
        &state,
        ServerEvent::MemberLeft {
            group_id,
            user_id: claims.sub,
        },
    )
    .await;
    Ok(success_to_api_response(DONE))
}

#[axum::debug_handler]
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((group_id, user_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    state
        .store
        .remove_member(&group_id, &claims.sub, &user_id)
        .await?;
    publish_lifecycle(&state, ServerEvent::MemberRemoved { group_id, user_id }).await;
    Ok(success_to_api_response(DONE))
}

#[axum::debug_handler]
pub async fn list_members(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(group_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    authorize_group(&state.store, &claims.sub, &group_id).await?;
    let mut members = Vec::new();
    for membership in state.store.members(&group_id).await? {
        let user = state.store.user(&membership.user_id).await;
        members.push(MemberInfo::new(membership, user));
    }
    Ok(success_to_api_response(members))
}

#[axum::debug_handler]
pub async fn leave_all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let summary = state.store.leave_all_groups(&claims.sub).await;
    for group_id in &summary.deleted {
        publish_lifecycle(
            &state,
            ServerEvent::GroupDeleted {
                group_id: group_id.clone(),
            },
        )
        .await;
    }
    for group_id in &summary.left {
        publish_lifecycle(
            &state,
            ServerEvent::MemberLeft {
                group_id: group_id.clone(),
                user_id: claims.sub.clone(),
            },
        )
        .await;
    }
    Ok(success_to_api_response(summary))
}
