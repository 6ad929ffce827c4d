// ABOUTME: API key management handlers: list, create, and revoke stored ingestion keys.
// ABOUTME: The raw secret is returned once at creation; only its SHA-256 digest is stored.

use std::collections::BTreeSet;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tally_core::{ApiKeyRecord, digest_secret, generate_key_id, generate_secret};
use tally_store::InsertOutcome;

use crate::app_state::SharedState;
use crate::fault::ApiError;

const KEY_ID_PREFIX: &str = "key";

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_keys).post(create_key))
        .route("/{key_id}", delete(revoke_key))
}

/// Request body for creating a new key.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub scopes: BTreeSet<String>,
}

/// Response body after creating a key. `secret` is never retrievable again.
#[derive(Debug, Serialize)]
pub struct CreatedKey {
    #[serde(flatten)]
    pub record: ApiKeyRecord,
    pub secret: String,
}

/// GET /api/apikeys
async fn list_keys(State(state): State<SharedState>) -> Result<Json<Vec<ApiKeyRecord>>, ApiError> {
    let keys = state.store()?.list_api_keys().await?;
    Ok(Json(keys))
}

/// POST /api/apikeys
async fn create_key(
    State(state): State<SharedState>,
    payload: Result<Json<CreateKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedKey>), ApiError> {
    let Json(req) = payload?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    let scopes: BTreeSet<String> = req
        .scopes
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if scopes.is_empty() {
        return Err(ApiError::BadRequest("at least one scope is required".into()));
    }

    let store = state.store()?;
    let secret = generate_secret();
    let key_id = generate_key_id(KEY_ID_PREFIX);
    let record = ApiKeyRecord::new(name, key_id, digest_secret(&secret), scopes);

    match store.insert_api_key(record).await? {
        InsertOutcome::Created(record) => {
            tracing::info!(key_id = %record.key_id, name = %record.name, "created api key");
            Ok((StatusCode::CREATED, Json(CreatedKey { record, secret })))
        }
        // A 256-bit random secret colliding means something is badly wrong with the RNG.
        InsertOutcome::Existing(_) => Err(ApiError::Unhandled),
    }
}

/// DELETE /api/apikeys/{key_id}
async fn revoke_key(
    State(state): State<SharedState>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store()?.delete_api_key(&key_id).await? {
        tracing::info!(key_id = %key_id, "revoked api key");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no api key with id {key_id}")))
    }
}
