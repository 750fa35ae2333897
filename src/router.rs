use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower::ServiceBuilder;
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::{
    AppState,
    middleware::{auth_middleware, log_errors},
    routes, ws,
};

pub fn build_router(state: AppState) -> Router {
    // Health and the socket upgrade authenticate on their own terms.
    let public_routes = Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(ws::ws_handler));

    let protected_routes = Router::new()
        // users
        .route("/users/me", get(routes::user::me).put(routes::user::update_profile))
        .route("/users/refresh-token", post(routes::user::refresh_token))
        .route("/users/me/groups", get(routes::user::my_groups))
        .route("/users/me/admin-groups", get(routes::user::my_admin_groups))
        // groups
        .route("/groups", post(routes::group::create_group))
        .route("/groups/by-code/{code}", get(routes::group::group_info))
        .route("/groups/join-requests", post(routes::group::submit_join_request))
        .route("/groups/leave-all", post(routes::group::leave_all))
        .route(
            "/groups/{group_id}",
            get(routes::group::group_detail).delete(routes::group::delete_group),
        )
        .route("/groups/{group_id}/center", put(routes::group::update_center))
        .route("/groups/{group_id}/requests", get(routes::group::pending_requests))
        .route(
            "/groups/{group_id}/requests/{request_id}/approve",
            post(routes::group::approve_request),
        )
        .route(
            "/groups/{group_id}/requests/{request_id}/reject",
            post(routes::group::reject_request),
        )
        .route("/groups/{group_id}/transfer-admin", post(routes::group::transfer_admin))
        .route("/groups/{group_id}/leave", post(routes::group::leave_group))
        .route("/groups/{group_id}/members", get(routes::group::list_members))
        .route(
            "/groups/{group_id}/members/{user_id}/remove",
            post(routes::group::remove_member),
        )
        // locations
        .route(
            "/groups/{group_id}/locations",
            get(routes::location::group_locations).post(routes::location::post_group_location),
        )
        .route(
            "/groups/{group_id}/members-with-locations",
            get(routes::location::members_with_locations),
        )
        .route("/locations", post(routes::location::ingest_location))
        .route("/locations/me", delete(routes::location::purge_my_locations))
        .route("/locations/{device_id}/recent", get(routes::location::recent_locations))
        .route("/dashboard", get(routes::location::dashboard))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let base_uri = state.config.api_base_uri.clone();
    let api = Router::new().merge(public_routes).merge(protected_routes);
    let router = if base_uri.is_empty() || base_uri == "/" {
        api
    } else {
        Router::new().nest(&base_uri, api)
    };

    let router = router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(log_errors)),
    );

    // Browsers on the dev server talk to us cross-origin.
    #[cfg(debug_assertions)]
    let router = router.layer(CorsLayer::permissive());

    router.with_state(state)
}
