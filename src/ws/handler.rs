use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use axum_extra::typed_header::TypedHeaderRejection;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use super::events::{ClientMessage, ServerEvent, sample_from};
use super::manager::Room;
use super::publish::{publish_device_location, publish_group_location};
use crate::AppState;
use crate::access::authorize_group;
use crate::error::{AppError, CoreError};
use crate::store::model::UserId;
use crate::utils::verify_token;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Upgrades to a WebSocket. A token is optional here (query `token` or a
/// bearer header) but one that is present must be valid.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
) -> Result<Response, AppError> {
    let token = params
        .token
        .or_else(|| bearer.ok().map(|TypedHeader(auth)| auth.token().to_string()));

    let user_id = match token {
        Some(token) => match verify_token(&token, &state.config) {
            Ok(claims) => Some(claims.sub),
            Err(e) => {
                tracing::warn!(error = %e, "Rejected WebSocket upgrade with invalid token");
                return Err(CoreError::Unauthorized.into());
            }
        },
        None => None,
    };

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<UserId>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, user_id = ?user_id, "WebSocket connected");

    let mut rx = state.rooms.add(conn_id.clone(), user_id).await;
    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        state.rooms.touch(&conn_id).await;
        match result {
            Ok(Message::Text(text)) => dispatch(&state, &conn_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.rooms.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Handles one inbound text frame from connection `conn_id`.
pub async fn dispatch(state: &AppState, conn_id: &str, raw: &str) {
    let message = match serde_json::from_str::<ClientMessage>(raw) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Malformed client message");
            state
                .rooms
                .send_to(
                    conn_id,
                    &ServerEvent::Error {
                        message: format!("malformed message: {e}"),
                    },
                )
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Authenticate { token } => match verify_token(&token, &state.config) {
            Ok(claims) => {
                state.rooms.authenticate(conn_id, claims.sub.clone()).await;
                state
                    .rooms
                    .send_to(conn_id, &ServerEvent::Authenticated { user_id: claims.sub })
                    .await;
            }
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "Socket authentication failed");
                state
                    .rooms
                    .send_to(
                        conn_id,
                        &ServerEvent::Error {
                            message: "invalid token".into(),
                        },
                    )
                    .await;
            }
        },
        ClientMessage::JoinDevice { device_id } => {
            state.rooms.join(conn_id, Room::Device(device_id)).await;
        }
        ClientMessage::LeaveDevice { device_id } => {
            state.rooms.leave(conn_id, &Room::Device(device_id)).await;
        }
        ClientMessage::JoinGroup { group_id } => {
            let Some(user_id) = state.rooms.user_of(conn_id).await else {
                tracing::warn!(conn_id, group_id = %group_id, "Unauthenticated group join dropped");
                return;
            };
            match authorize_group(&state.store, &user_id, &group_id).await {
                Ok(access) => {
                    state.rooms.join(conn_id, Room::Group(group_id.clone())).await;
                    tracing::info!(conn_id, group_id = %group_id, user_id = %user_id, "Joined group room");
                    state
                        .rooms
                        .send_to(
                            conn_id,
                            &ServerEvent::GroupJoined {
                                group_id,
                                role: access.role,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(conn_id, group_id = %group_id, user_id = %user_id, error = %e, "Group join denied");
                    state
                        .rooms
                        .send_to(
                            conn_id,
                            &ServerEvent::JoinRejected {
                                group_id,
                                reason: e.to_string(),
                            },
                        )
                        .await;
                }
            }
        }
        ClientMessage::LeaveGroup { group_id } => {
            state.rooms.leave(conn_id, &Room::Group(group_id)).await;
        }
        ClientMessage::LocationUpdate {
            device_id,
            coords,
            timestamp,
        } => {
            let Some(user_id) = state.rooms.user_of(conn_id).await else {
                tracing::warn!(conn_id, device_id = %device_id, "Unauthenticated location update dropped");
                return;
            };
            let sample = sample_from(coords, timestamp);
            match publish_device_location(state, &user_id, &device_id, sample, Some(conn_id)).await {
                Ok(()) => {}
                Err(e @ CoreError::Forbidden(_)) => {
                    tracing::warn!(conn_id, device_id = %device_id, user_id = %user_id, "Location update for another user dropped");
                    state
                        .rooms
                        .send_to(conn_id, &ServerEvent::Error { message: e.to_string() })
                        .await;
                }
                Err(e) => {
                    tracing::debug!(conn_id, device_id = %device_id, error = %e, "Device location dropped");
                }
            }
        }
        ClientMessage::GroupLocationUpdate {
            group_id,
            coords,
            timestamp,
        } => {
            let Some(user_id) = state.rooms.user_of(conn_id).await else {
                tracing::warn!(conn_id, group_id = %group_id, "Unauthenticated group location update dropped");
                return;
            };
            let access = match authorize_group(&state.store, &user_id, &group_id).await {
                Ok(access) => access,
                Err(e) => {
                    tracing::warn!(conn_id, group_id = %group_id, user_id = %user_id, error = %e, "Location update from non-member dropped");
                    return;
                }
            };
            let sample = sample_from(coords, timestamp);
            if let Err(e) = publish_group_location(state, &access, sample, Some(conn_id)).await {
                tracing::debug!(conn_id, group_id = %group_id, error = %e, "Group location dropped");
            }
        }
    }
}
