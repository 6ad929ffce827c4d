// ABOUTME: Router assembly for the tally HTTP API.
// ABOUTME: Liveness and health routes, mounted modules, the fallback, and the fault/trace layers.

use axum::extract::State;
use axum::http::{HeaderValue, Method, header};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tally_store::ConnectionState;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::SharedState;
use crate::fault;
use crate::modules::ModuleRegistry;

pub const LIVENESS_TEXT: &str = "API is running...";

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store: ConnectionState,
}

/// Build the complete Axum router: fixed routes, every present module,
/// and the fault boundary wrapped around all of it.
pub fn create_router(state: SharedState, modules: ModuleRegistry) -> Router {
    let router = Router::new()
        .route("/", get(liveness))
        .route("/health", get(health));

    modules
        .mount(router)
        .fallback(fault::not_found)
        .layer(CatchPanicLayer::custom(fault::panic_response))
        .layer(axum::middleware::from_fn(fault::envelope_failures))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for the dashboard origin, with credentials allowed.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, header::InvalidHeaderValue> {
    let origin = HeaderValue::from_str(origin)?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

async fn liveness() -> &'static str {
    LIVENESS_TEXT
}

/// Answers regardless of store state; the store field says where it stands.
async fn health(State(state): State<SharedState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        store: state.connection.state(),
    })
}
