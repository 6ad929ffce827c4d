// ABOUTME: Storage abstraction for credential records (API keys and user accounts).
// ABOUTME: Defines the async CredentialStore trait and the error taxonomy used for retry decisions.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::ErrorCode;
use tally_core::{ApiKeyRecord, UserAccount};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported store uri: {0}")]
    UnsupportedUri(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot open store: {0}")]
    Unreachable(String),

    #[error("store is busy: {0}")]
    Busy(String),

    #[error("store access denied: {0}")]
    AccessDenied(String),

    #[error("store is not a usable database: {0}")]
    Corrupt(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether a connection attempt that failed with this error is worth repeating.
    /// Misconfiguration (bad scheme, wrong file, denied access) never heals by waiting.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_)
            | StoreError::Unreachable(_)
            | StoreError::Busy(_)
            | StoreError::Database(_) => true,
            StoreError::UnsupportedUri(_)
            | StoreError::AccessDenied(_)
            | StoreError::Corrupt(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Serialization(_)
            | StoreError::Poisoned => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        match err.sqlite_error_code() {
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) => {
                StoreError::Unreachable(message)
            }
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(message)
            }
            Some(ErrorCode::PermissionDenied)
            | Some(ErrorCode::ReadOnly)
            | Some(ErrorCode::AuthorizationForStatementDenied) => StoreError::AccessDenied(message),
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                StoreError::Corrupt(message)
            }
            Some(ErrorCode::ConstraintViolation) => StoreError::AlreadyExists(message),
            _ => StoreError::Database(message),
        }
    }
}

/// Result of a conflict-safe insert: either our record went in, or an
/// equivalent record was already there and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome<T> {
    Created(T),
    Existing(T),
}

/// Storage backend for credential records.
///
/// Implementations must enforce uniqueness of API key hashes and account
/// emails themselves; callers rely on the conflict-safe inserts rather than
/// on check-then-create sequences.
#[async_trait]
pub trait CredentialStore: Send + Sync + Debug {
    /// Cheap round trip used for health probes.
    async fn ping(&self) -> Result<(), StoreError>;

    // API keys

    async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Insert unless a record with the same hash exists; then return that one.
    async fn insert_api_key(
        &self,
        record: ApiKeyRecord,
    ) -> Result<InsertOutcome<ApiKeyRecord>, StoreError>;

    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete_api_key(&self, key_id: &str) -> Result<bool, StoreError>;

    // User accounts

    async fn find_admin(&self) -> Result<Option<UserAccount>, StoreError>;

    /// Atomically insert `account` only if no administrator exists yet.
    /// Concurrent callers against the same store serialize; at most one wins.
    async fn insert_admin_if_absent(
        &self,
        account: UserAccount,
    ) -> Result<InsertOutcome<UserAccount>, StoreError>;

    /// Insert an account. Fails with `AlreadyExists` on a duplicate email.
    async fn insert_user(&self, account: UserAccount) -> Result<UserAccount, StoreError>;

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError>;
}

/// Type alias for the Arc-wrapped store handed to handlers and the seeder.
pub type SharedStore = Arc<dyn CredentialStore>;
