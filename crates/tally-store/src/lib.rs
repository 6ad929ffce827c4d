// ABOUTME: Persistence layer for tally: the credential store, its connection supervisor, and seeding.
// ABOUTME: The HTTP listener never waits on anything in this crate; it all runs in background tasks.

pub mod connection;
pub mod seed;
pub mod sqlite;
pub mod store;

pub use connection::{
    ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState, Connector,
    OpenedSignal, RetryPolicy, SqliteConnector,
};
pub use seed::{CredentialSeeder, SeedConfig, SeedError, SeedOutcome, SeedReport};
pub use sqlite::{SqliteStore, StoreLocation};
pub use store::{CredentialStore, InsertOutcome, SharedStore, StoreError};
