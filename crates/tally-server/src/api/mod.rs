// ABOUTME: Collaborator handler modules mounted by the module registry.
// ABOUTME: Each module exposes a router() nested under its /api/* prefix.

pub mod apikeys;
pub mod debug;
pub mod users;
