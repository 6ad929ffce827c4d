// ABOUTME: User account handlers: list accounts and register new ones.
// ABOUTME: Passwords are Argon2-hashed off the async runtime and never serialized back.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tally_core::{Role, UserAccount, hash_password};

use crate::app_state::SharedState;
use crate::fault::ApiError;

const MIN_PASSWORD_LEN: usize = 8;

pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(list_users).post(create_user))
}

/// Request body for registering an account.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Role,
}

/// GET /api/user
async fn list_users(State(state): State<SharedState>) -> Result<Json<Vec<UserAccount>>, ApiError> {
    let users = state.store()?.list_users().await?;
    Ok(Json(users))
}

/// POST /api/user
///
/// Only `user` accounts can be registered here; the administrator is
/// provisioned at startup and there is never more than one.
async fn create_user(
    State(state): State<SharedState>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserAccount>), ApiError> {
    let Json(req) = payload?;
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".into()));
    }
    if !looks_like_email(req.email.trim()) {
        return Err(ApiError::BadRequest("a valid email is required".into()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if req.role == Role::Admin {
        return Err(ApiError::status(
            StatusCode::FORBIDDEN,
            "admin accounts cannot be registered",
        ));
    }

    let store = state.store()?;
    let password = req.password;
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "password hashing task failed");
            ApiError::Unhandled
        })??;

    let account = store
        .insert_user(UserAccount::new(name, &req.email, hash, Role::User))
        .await?;
    tracing::info!(user_id = %account.id, email = %account.email, "registered user");
    Ok((StatusCode::CREATED, Json(account)))
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}
