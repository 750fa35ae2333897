#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use crewtrack::{
    AppState, config::Config, notify::MemoryNotifier, router::build_router, utils::generate_token,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub router: Router,
    pub notifier: Arc<MemoryNotifier>,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::new("test-secret", dir.path().join("data.json"));
    config.save_debounce_ms = 50;
    config
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir).await
    }

    pub async fn in_dir(dir: TempDir) -> Self {
        let notifier = Arc::new(MemoryNotifier::new());
        let state = AppState::with_notifier(test_config(&dir), notifier.clone()).await;
        let router = build_router(state.clone());
        Self {
            dir,
            state,
            router,
            notifier,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        generate_token(user_id, &self.state.config).unwrap().0
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(user)));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Creates a group owned by `admin` and returns `(id, code)`.
    pub async fn create_group(&self, admin: &str, body: Value) -> (String, String) {
        let (status, json) = self.call(Method::POST, "/api/groups", Some(admin), Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        let data = &json["resp_data"];
        (
            data["id"].as_str().unwrap().to_string(),
            data["code"].as_str().unwrap().to_string(),
        )
    }

    /// Runs the join-request flow so `user` becomes a member.
    pub async fn join(&self, admin: &str, user: &str, group_id: &str, code: &str) {
        let (status, json) = self
            .call(
                Method::POST,
                "/api/groups/join-requests",
                Some(user),
                Some(serde_json::json!({"code": code, "displayName": user})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        let request_id = json["resp_data"]["id"].as_str().unwrap().to_string();

        let (status, json) = self
            .call(
                Method::POST,
                &format!("/api/groups/{group_id}/requests/{request_id}/approve"),
                Some(admin),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{json}");
    }
}

/// Latitude `meters` north of 41.0 on the haversine sphere.
pub fn lat_north_of_41(meters: f64) -> f64 {
    41.0 + (meters / crewtrack::utils::EARTH_RADIUS_M).to_degrees()
}
