mod common;

use axum::extract::ws::Message;
use axum::http::{Method, StatusCode};
use common::{TestApp, lat_north_of_41};
use crewtrack::store::model::Track;
use crewtrack::ws::{Room, dispatch};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Message::Text(text) = msg {
            events.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    events
}

fn kinds(events: &[Value]) -> Vec<&str> {
    events.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

async fn send(app: &TestApp, conn_id: &str, message: Value) {
    dispatch(&app.state, conn_id, &message.to_string()).await;
}

/// Connects `user` over a fake socket, authenticates it and joins `group_id`.
async fn connect_member(app: &TestApp, conn_id: &str, user: &str, group_id: &str) -> UnboundedReceiver<Message> {
    let mut rx = app.state.rooms.add(conn_id.to_string(), None).await;
    send(app, conn_id, json!({"type": "authenticate", "token": app.token(user)})).await;
    send(app, conn_id, json!({"type": "join_group", "groupId": group_id})).await;
    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["authenticated", "group_joined"]);
    rx
}

async fn crew(app: &TestApp, center: Option<Value>) -> String {
    let mut body = json!({"name": "Crew"});
    if let Some(center) = center {
        body["center"] = center;
    }
    let (group_id, code) = app.create_group("alice", body).await;
    app.join("alice", "bob", &group_id, &code).await;
    group_id
}

#[tokio::test]
async fn unauthenticated_connections_cannot_join_or_publish() {
    let app = TestApp::new().await;
    let group_id = crew(&app, None).await;

    let mut rx = app.state.rooms.add("anon".into(), None).await;
    send(&app, "anon", json!({"type": "join_group", "groupId": group_id})).await;
    send(
        &app,
        "anon",
        json!({"type": "group_location_update", "groupId": group_id,
               "coords": {"latitude": 41.0, "longitude": 29.0}}),
    )
    .await;

    assert!(drain(&mut rx).is_empty());
    assert_eq!(app.state.rooms.room_size(&Room::Group(group_id)).await, 0);
    assert_eq!(app.state.batcher.queue_len(&Track::member("anon")).await, 0);
}

#[tokio::test]
async fn non_member_join_is_rejected() {
    let app = TestApp::new().await;
    let group_id = crew(&app, None).await;

    let mut rx = app.state.rooms.add("c".into(), None).await;
    send(&app, "c", json!({"type": "authenticate", "token": app.token("mallory")})).await;
    send(&app, "c", json!({"type": "join_group", "groupId": group_id})).await;

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["authenticated", "join_rejected"]);
    assert_eq!(events[1]["groupId"], group_id.as_str());
    assert_eq!(app.state.rooms.room_size(&Room::Group(group_id)).await, 0);
}

#[tokio::test]
async fn bad_token_and_malformed_frames_get_error_events() {
    let app = TestApp::new().await;
    let mut rx = app.state.rooms.add("c".into(), None).await;

    send(&app, "c", json!({"type": "authenticate", "token": "garbage"})).await;
    dispatch(&app.state, "c", "{not json").await;

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["error", "error"]);
    assert_eq!(app.state.rooms.user_of("c").await, None);
}

#[tokio::test]
async fn location_update_goes_to_everyone_but_the_sender() {
    let app = TestApp::new().await;
    let group_id = crew(&app, None).await;
    let mut alice = connect_member(&app, "alice-1", "alice", &group_id).await;
    let mut bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    send(
        &app,
        "bob-1",
        json!({"type": "group_location_update", "groupId": group_id,
               "coords": {"latitude": 41.0, "longitude": 29.0, "heading": 90.0},
               "timestamp": 1234}),
    )
    .await;

    let received = drain(&mut alice);
    assert_eq!(kinds(&received), vec!["location_update"]);
    assert_eq!(received[0]["userId"], "bob");
    assert_eq!(received[0]["sample"]["timestamp"], 1234);
    assert_eq!(received[0]["sample"]["coords"]["heading"], 90.0);
    assert!(drain(&mut bob).is_empty());

    // Broadcast is immediate; the store only sees the sample after a flush.
    assert_eq!(app.state.batcher.queue_len(&Track::member("bob")).await, 1);
    assert!(app.state.store.latest_location("bob").await.is_none());
    app.state.batcher.flush().await;
    assert_eq!(app.state.store.latest_location("bob").await.unwrap().timestamp, 1234);
}

#[tokio::test]
async fn geofence_violation_is_broadcast_and_throttled() {
    let app = TestApp::new().await;
    let group_id = crew(&app, Some(json!({"lat": 41.0, "lng": 29.0}))).await;
    let mut alice = connect_member(&app, "alice-1", "alice", &group_id).await;
    let _bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    let outside = json!({"type": "group_location_update", "groupId": group_id,
                         "coords": {"latitude": lat_north_of_41(200.0), "longitude": 29.0}});
    send(&app, "bob-1", outside.clone()).await;

    let received = drain(&mut alice);
    assert_eq!(kinds(&received), vec!["location_update", "geofence_violation"]);
    assert_eq!(received[1]["distance"], 200);
    assert_eq!(received[1]["radius"], 150.0);
    assert_eq!(received[1]["center"], json!({"lat": 41.0, "lng": 29.0}));

    send(&app, "bob-1", outside).await;
    assert_eq!(kinds(&drain(&mut alice)), vec!["location_update"]);

    // Back inside resets the throttle.
    send(
        &app,
        "bob-1",
        json!({"type": "group_location_update", "groupId": group_id,
               "coords": {"latitude": 41.0, "longitude": 29.0}}),
    )
    .await;
    send(
        &app,
        "bob-1",
        json!({"type": "group_location_update", "groupId": group_id,
               "coords": {"latitude": lat_north_of_41(300.0), "longitude": 29.0}}),
    )
    .await;
    assert_eq!(
        kinds(&drain(&mut alice)),
        vec!["location_update", "location_update", "geofence_violation"]
    );
}

#[tokio::test]
async fn late_inside_sample_does_not_reset_the_throttle() {
    let app = TestApp::new().await;
    let group_id = crew(&app, Some(json!({"lat": 41.0, "lng": 29.0}))).await;
    let mut alice = connect_member(&app, "alice-1", "alice", &group_id).await;
    let _bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    for (timestamp, latitude) in [
        (100, lat_north_of_41(200.0)),
        (50, 41.0),
        (150, lat_north_of_41(200.0)),
    ] {
        send(
            &app,
            "bob-1",
            json!({"type": "group_location_update", "groupId": group_id,
                   "coords": {"latitude": latitude, "longitude": 29.0},
                   "timestamp": timestamp}),
        )
        .await;
    }

    assert_eq!(
        kinds(&drain(&mut alice)),
        vec!["location_update", "geofence_violation", "location_update", "location_update"]
    );
}

#[tokio::test]
async fn rejoined_member_is_not_held_by_an_old_throttle() {
    let app = TestApp::new().await;
    let (group_id, code) = app
        .create_group("alice", json!({"name": "Crew", "center": {"lat": 41.0, "lng": 29.0}}))
        .await;
    app.join("alice", "bob", &group_id, &code).await;
    let mut alice = connect_member(&app, "alice-1", "alice", &group_id).await;
    let _bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    let outside = json!({"type": "group_location_update", "groupId": group_id,
                         "coords": {"latitude": lat_north_of_41(200.0), "longitude": 29.0}});
    send(&app, "bob-1", outside.clone()).await;
    assert_eq!(kinds(&drain(&mut alice)), vec!["location_update", "geofence_violation"]);

    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/groups/{group_id}/members/bob/remove"),
            Some("alice"),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    drain(&mut alice);

    app.join("alice", "bob", &group_id, &code).await;
    drain(&mut alice);
    let _bob = connect_member(&app, "bob-2", "bob", &group_id).await;
    send(&app, "bob-2", outside).await;
    assert_eq!(kinds(&drain(&mut alice)), vec!["location_update", "geofence_violation"]);
}

#[tokio::test]
async fn device_room_relays_per_device_tracking() {
    let app = TestApp::new().await;
    let mut viewer = app.state.rooms.add("viewer".into(), None).await;
    send(&app, "viewer", json!({"type": "join_device", "deviceId": "truck-7"})).await;

    let mut tracker = app.state.rooms.add("tracker".into(), None).await;
    send(&app, "tracker", json!({"type": "authenticate", "token": app.token("driver")})).await;
    send(&app, "tracker", json!({"type": "join_device", "deviceId": "truck-7"})).await;
    drain(&mut tracker);

    send(
        &app,
        "tracker",
        json!({"type": "location_update", "deviceId": "truck-7",
               "coords": {"latitude": 10.0, "longitude": 20.0}, "timestamp": 7}),
    )
    .await;

    let received = drain(&mut viewer);
    assert_eq!(kinds(&received), vec!["location_updated"]);
    assert_eq!(received[0]["deviceId"], "truck-7");
    assert!(drain(&mut tracker).is_empty());
    assert_eq!(app.state.batcher.queue_len(&Track::device("truck-7")).await, 1);
}

#[tokio::test]
async fn socket_cannot_report_under_another_members_id() {
    let app = TestApp::new().await;
    let group_id = crew(&app, None).await;
    let mut watcher = app.state.rooms.add("watcher".into(), None).await;
    send(&app, "watcher", json!({"type": "join_device", "deviceId": "bob"})).await;

    let mut mallory = app.state.rooms.add("m".into(), None).await;
    send(&app, "m", json!({"type": "authenticate", "token": app.token("mallory")})).await;
    send(
        &app,
        "m",
        json!({"type": "location_update", "deviceId": "bob",
               "coords": {"latitude": 10.0, "longitude": 29.0}, "timestamp": 999}),
    )
    .await;

    assert_eq!(kinds(&drain(&mut mallory)), vec!["authenticated", "error"]);
    assert!(drain(&mut watcher).is_empty());
    assert_eq!(app.state.batcher.queue_len(&Track::member("bob")).await, 0);
    assert_eq!(app.state.batcher.queue_len(&Track::device("bob")).await, 0);
    app.state.batcher.flush().await;
    assert!(app.state.presence.latest(&group_id, "bob").await.is_none());
}

#[tokio::test]
async fn lifecycle_events_reach_the_room_after_commit() {
    let app = TestApp::new().await;
    let (group_id, code) = app.create_group("alice", json!({"name": "Crew"})).await;
    let mut alice = connect_member(&app, "alice-1", "alice", &group_id).await;

    let (status, _) = app
        .call(
            Method::POST,
            "/api/groups/join-requests",
            Some("bob"),
            Some(json!({"code": code, "displayName": "Bob"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let events = drain(&mut alice);
    assert_eq!(kinds(&events), vec!["new_request"]);
    assert_eq!(events[0]["request"]["displayName"], "Bob");
    let request_id = events[0]["request"]["id"].as_str().unwrap().to_string();

    app.call(
        Method::POST,
        &format!("/api/groups/{group_id}/requests/{request_id}/approve"),
        Some("alice"),
        None,
    )
    .await;
    let events = drain(&mut alice);
    assert_eq!(kinds(&events), vec!["member_approved"]);
    assert_eq!(events[0]["userId"], "bob");

    let mut bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    // A failed mutation announces nothing.
    let (status, _) = app
        .call(Method::POST, &format!("/api/groups/{group_id}/leave"), Some("alice"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(drain(&mut alice).is_empty());

    app.call(
        Method::POST,
        &format!("/api/groups/{group_id}/members/bob/remove"),
        Some("alice"),
        None,
    )
    .await;
    assert_eq!(kinds(&drain(&mut alice)), vec!["member_removed"]);
    assert_eq!(kinds(&drain(&mut bob)), vec!["member_removed"]);

    // The removed member no longer hears the room.
    assert_eq!(app.state.rooms.room_size(&Room::Group(group_id.clone())).await, 1);

    app.call(Method::DELETE, &format!("/api/groups/{group_id}"), Some("alice"), None)
        .await;
    assert_eq!(kinds(&drain(&mut alice)), vec!["group_deleted"]);
    assert!(drain(&mut bob).is_empty());
    assert_eq!(app.state.rooms.room_size(&Room::Group(group_id)).await, 0);
}

#[tokio::test]
async fn out_of_order_samples_keep_the_newest_presence() {
    let app = TestApp::new().await;
    let group_id = crew(&app, None).await;
    let _bob = connect_member(&app, "bob-1", "bob", &group_id).await;

    for (timestamp, latitude) in [(100, 41.0), (50, 42.0)] {
        send(
            &app,
            "bob-1",
            json!({"type": "group_location_update", "groupId": group_id,
                   "coords": {"latitude": latitude, "longitude": 29.0},
                   "timestamp": timestamp}),
        )
        .await;
    }
    app.state.batcher.flush().await;

    let entry = app.state.presence.latest(&group_id, "bob").await.unwrap();
    assert_eq!(entry.sample.timestamp, 100);
    assert_eq!(entry.sample.coords.latitude, 41.0);

    // History keeps arrival order.
    let history = app.state.store.location_history("bob", None, None).await;
    let stamps: Vec<i64> = history.iter().map(|s| s.timestamp).collect();
    assert_eq!(stamps, vec![100, 50]);
}
