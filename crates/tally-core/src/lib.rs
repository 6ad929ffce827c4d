// ABOUTME: Core types for tally: persisted credential records and hashing primitives.
// ABOUTME: Shared by the store (seeding, persistence) and the HTTP server (key and user modules).

pub mod credential;
pub mod model;

pub use credential::{
    CredentialError, digest_secret, generate_key_id, generate_secret, hash_password,
    verify_password,
};
pub use model::{ApiKeyRecord, INGEST_EVENTS_SCOPE, Role, RoleParseError, UserAccount};
