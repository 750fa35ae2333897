//! Server-side fan-out shared by socket messages and REST handlers.

use chrono::Utc;

use super::events::ServerEvent;
use super::manager::Room;
use crate::AppState;
use crate::access::GroupAccess;
use crate::error::{CoreError, CoreResult};
use crate::geofence::Violation;
use crate::store::model::{LocationSample, Track};

/// Runs one group location sample through the pipeline: queue it for the
/// next flush, check the work area, then tell the rest of the room.
///
/// `origin` is the sending connection, which does not get its own update
/// echoed back.
pub async fn publish_group_location(
    state: &AppState,
    access: &GroupAccess,
    sample: LocationSample,
    origin: Option<&str>,
) -> CoreResult<Option<Violation>> {
    sample.validate()?;
    let group = state
        .store
        .group(&access.group_id)
        .await
        .ok_or_else(|| CoreError::not_found("group", access.group_id.as_str()))?;

    if !state
        .batcher
        .add_to_batch(&Track::member(access.user_id.as_str()), sample)
        .await
    {
        return Err(CoreError::Validation("location sample rejected".into()));
    }

    let violation = state
        .geofence
        .check(&group, &access.user_id, &sample, Utc::now())
        .await;

    let room = Room::Group(group.id.clone());
    let update = ServerEvent::LocationUpdate {
        group_id: group.id.clone(),
        user_id: access.user_id.clone(),
        sample,
    };
    state.rooms.broadcast(&room, &update, origin).await;

    if let Some(violation) = &violation {
        let event = ServerEvent::GeofenceViolation(violation.clone());
        state.rooms.broadcast(&room, &event, origin).await;
        state.notifier.dispatch(&event);
    }

    Ok(violation)
}

/// Per-device tracking: queue the sample and mirror it to the device room.
///
/// A caller reporting under their own id feeds their member history. Any
/// other id is a free-standing device; it may not name another known user.
pub async fn publish_device_location(
    state: &AppState,
    caller: &str,
    device_id: &str,
    sample: LocationSample,
    origin: Option<&str>,
) -> CoreResult<()> {
    sample.validate()?;
    let track = if device_id == caller {
        Track::member(caller)
    } else if state.store.is_known_user(device_id).await {
        return Err(CoreError::Forbidden(
            "cannot report locations for another user".into(),
        ));
    } else {
        Track::device(device_id)
    };

    if !state.batcher.add_to_batch(&track, sample).await {
        return Err(CoreError::Validation("location sample rejected".into()));
    }
    let event = ServerEvent::LocationUpdated {
        device_id: device_id.to_string(),
        sample,
    };
    state
        .rooms
        .broadcast(&Room::Device(device_id.to_string()), &event, origin)
        .await;
    Ok(())
}

/// Announces a committed membership change to the whole group room and the
/// push service, then drops room state the change made stale.
///
/// Call only after the store mutation succeeded.
pub async fn publish_lifecycle(state: &AppState, event: ServerEvent) {
    let Some(group_id) = event.group_id().map(str::to_string) else {
        tracing::warn!(kind = event.kind(), "Lifecycle event without a group, not published");
        return;
    };
    let room = Room::Group(group_id.clone());
    let sent = state.rooms.broadcast(&room, &event, None).await;
    tracing::debug!(group_id = %group_id, kind = event.kind(), sent, "Lifecycle event published");

    if event.is_pushable() {
        state.notifier.dispatch(&event);
    }

    match &event {
        ServerEvent::MemberLeft { user_id, .. } | ServerEvent::MemberRemoved { user_id, .. } => {
            state.rooms.evict_user(&room, user_id).await;
            state.geofence.forget_member(&group_id, user_id).await;
        }
        ServerEvent::GroupDeleted { .. } => {
            state.rooms.close_room(&room).await;
            state.geofence.forget_group(&group_id).await;
        }
        _ => {}
    }
}
