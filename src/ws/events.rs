//! Socket payloads, one JSON object per text frame, discriminated by `type`.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::geofence::Violation;
use crate::store::model::{Coords, DeviceId, GroupId, JoinRequest, LocationSample, Role, UserId};
use crate::utils::now_millis;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinDevice {
        device_id: DeviceId,
    },
    LeaveDevice {
        device_id: DeviceId,
    },
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    /// Per-device tracking outside any group.
    LocationUpdate {
        device_id: DeviceId,
        coords: Coords,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// The sender's own position, shared with one group.
    GroupLocationUpdate {
        group_id: GroupId,
        coords: Coords,
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Builds a sample from client coordinates, stamping it with the server
/// clock when the client sent no timestamp.
pub fn sample_from(coords: Coords, timestamp: Option<i64>) -> LocationSample {
    LocationSample {
        timestamp: timestamp.unwrap_or_else(now_millis),
        coords,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
    },
    GroupJoined {
        group_id: GroupId,
        role: Role,
    },
    JoinRejected {
        group_id: GroupId,
        reason: String,
    },
    LocationUpdated {
        device_id: DeviceId,
        sample: LocationSample,
    },
    LocationUpdate {
        group_id: GroupId,
        user_id: UserId,
        sample: LocationSample,
    },
    GeofenceViolation(Violation),
    NewRequest {
        group_id: GroupId,
        request: JoinRequest,
    },
    MemberApproved {
        group_id: GroupId,
        user_id: UserId,
        display_name: String,
    },
    MemberLeft {
        group_id: GroupId,
        user_id: UserId,
    },
    MemberRemoved {
        group_id: GroupId,
        user_id: UserId,
    },
    AdminTransferred {
        group_id: GroupId,
        from: UserId,
        to: UserId,
    },
    GroupDeleted {
        group_id: GroupId,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// The `type` tag as sent on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Authenticated { .. } => "authenticated",
            ServerEvent::GroupJoined { .. } => "group_joined",
            ServerEvent::JoinRejected { .. } => "join_rejected",
            ServerEvent::LocationUpdated { .. } => "location_updated",
            ServerEvent::LocationUpdate { .. } => "location_update",
            ServerEvent::GeofenceViolation(_) => "geofence_violation",
            ServerEvent::NewRequest { .. } => "new_request",
            ServerEvent::MemberApproved { .. } => "member_approved",
            ServerEvent::MemberLeft { .. } => "member_left",
            ServerEvent::MemberRemoved { .. } => "member_removed",
            ServerEvent::AdminTransferred { .. } => "admin_transferred",
            ServerEvent::GroupDeleted { .. } => "group_deleted",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// The group whose room this event belongs to, if any.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            ServerEvent::GroupJoined { group_id, .. }
            | ServerEvent::JoinRejected { group_id, .. }
            | ServerEvent::LocationUpdate { group_id, .. }
            | ServerEvent::NewRequest { group_id, .. }
            | ServerEvent::MemberApproved { group_id, .. }
            | ServerEvent::MemberLeft { group_id, .. }
            | ServerEvent::MemberRemoved { group_id, .. }
            | ServerEvent::AdminTransferred { group_id, .. }
            | ServerEvent::GroupDeleted { group_id } => Some(group_id),
            ServerEvent::GeofenceViolation(v) => Some(&v.group_id),
            ServerEvent::Authenticated { .. }
            | ServerEvent::LocationUpdated { .. }
            | ServerEvent::Error { .. } => None,
        }
    }

    /// Violations and membership lifecycle changes are worth a push
    /// notification; position updates and session chatter are not.
    pub fn is_pushable(&self) -> bool {
        matches!(
            self,
            ServerEvent::GeofenceViolation(_)
                | ServerEvent::NewRequest { .. }
                | ServerEvent::MemberApproved { .. }
                | ServerEvent::MemberLeft { .. }
                | ServerEvent::MemberRemoved { .. }
                | ServerEvent::AdminTransferred { .. }
                | ServerEvent::GroupDeleted { .. }
        )
    }

    pub fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(kind = self.kind(), error = %e, "Failed to serialize server event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_snake_case_tags_and_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "group_location_update",
            "groupId": "g1",
            "coords": {"latitude": 41.0, "longitude": 29.0, "accuracy": 5.0}
        }))
        .unwrap();

        match msg {
            ClientMessage::GroupLocationUpdate {
                group_id,
                coords,
                timestamp,
            } => {
                assert_eq!(group_id, "g1");
                assert_eq!(coords.accuracy, Some(5.0));
                assert_eq!(timestamp, None);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let parsed = serde_json::from_value::<ClientMessage>(json!({"type": "self_destruct"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn violation_event_flattens_into_the_tagged_object() {
        let event = ServerEvent::GeofenceViolation(Violation {
            group_id: "g1".into(),
            user_id: "bob".into(),
            distance: 200,
            radius: 150.0,
            center: crate::store::model::GeoPoint { lat: 41.0, lng: 29.0 },
            at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "geofence_violation");
        assert_eq!(value["groupId"], "g1");
        assert_eq!(value["distance"], 200);
        assert_eq!(event.group_id(), Some("g1"));
        assert!(event.is_pushable());
    }

    #[test]
    fn kind_matches_the_serialized_tag() {
        let events = [
            ServerEvent::AdminTransferred {
                group_id: "g".into(),
                from: "a".into(),
                to: "b".into(),
            },
            ServerEvent::GroupDeleted { group_id: "g".into() },
            ServerEvent::Error {
                message: "bad".into(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }

    #[test]
    fn missing_timestamp_uses_server_clock() {
        let coords = Coords {
            latitude: 1.0,
            longitude: 2.0,
            accuracy: None,
            heading: None,
            speed: None,
        };
        let before = now_millis();
        assert!(sample_from(coords, None).timestamp >= before);
        assert_eq!(sample_from(coords, Some(42)).timestamp, 42);
    }
}
