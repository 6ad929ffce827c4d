// ABOUTME: Shared application state for the tally HTTP server.
// ABOUTME: Carries the read-only connection handle; handlers fetch the live store through it.

use std::sync::Arc;

use tally_store::{ConnectionHandle, SharedStore};

use crate::fault::ApiError;

/// Shared application state accessible by all Axum handlers.
pub struct AppState {
    pub connection: ConnectionHandle,
}

/// Type alias for the Arc-wrapped state used with Axum's State extractor.
pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self { connection }
    }

    /// The live store, or `StoreUnavailable` while the connection is not open.
    pub fn store(&self) -> Result<SharedStore, ApiError> {
        self.connection.store().ok_or(ApiError::StoreUnavailable)
    }
}
