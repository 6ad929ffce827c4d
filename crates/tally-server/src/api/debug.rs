// ABOUTME: Diagnostics endpoints for operators.
// ABOUTME: Exposes the store connection state without touching the store itself.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tally_store::ConnectionState;

use crate::app_state::SharedState;

pub fn router() -> Router<SharedState> {
    Router::new().route("/connection", get(connection))
}

/// GET /api/debug/connection
async fn connection(State(state): State<SharedState>) -> Json<ConnectionState> {
    Json(state.connection.state())
}
