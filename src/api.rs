use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::{EntityState, StateStore};

/// Shared application state
pub struct AppState {
    pub store: StateStore,
    /// Configured station ids
    pub stations: Vec<String>,
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// GET /api/health response
#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    entities: usize,
    stations: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/ (API running check)
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/states: all published sensors
async fn get_states(State(app): State<Arc<AppState>>) -> Json<Vec<EntityState>> {
    Json(app.store.get_all())
}

/// GET /api/states/{entity_id}
async fn get_state(
    State(app): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    app.store
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn health(State(app): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        entities: app.store.len(),
        stations: app.stations.len(),
    })
}
