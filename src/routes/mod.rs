pub mod group;
pub mod location;
pub mod user;

use axum::{extract::State, response::IntoResponse};
use serde::Serialize;

use crate::AppState;
use crate::store::persist::LoadSource;
use crate::utils::success_to_api_response;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub ok: bool,
    pub connections: usize,
    pub load_source: LoadSource,
    pub saves_completed: u64,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response(Health {
        ok: true,
        connections: state.rooms.connection_count().await,
        load_source: state.store.load_source(),
        saves_completed: state.store.saves_completed(),
    })
}
