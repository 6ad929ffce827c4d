// ABOUTME: HTTP server for tally: mounts optional handler modules behind a single fault boundary.
// ABOUTME: Startup binds the listener first, then supervises the store and seeds credentials in the background.

pub mod api;
pub mod app_state;
pub mod config;
pub mod fault;
pub mod modules;
pub mod routes;
pub mod startup;

pub use app_state::{AppState, SharedState};
pub use config::{ConfigError, TallyConfig};
pub use fault::{ApiError, FailureEnvelope};
pub use modules::{Capability, ModuleRegistry};
pub use routes::create_router;
pub use startup::{RunningServer, StartupError, start};
