// ABOUTME: Credential primitives: secret digests, public key ids, and password hashing.
// ABOUTME: API secrets use SHA-256 (lookup by digest); passwords use salted Argon2id.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while hashing or verifying passwords.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("stored password hash is malformed: {0}")]
    MalformedHash(String),
}

/// Hex-encoded SHA-256 digest of an API secret. Deterministic, so the
/// digest doubles as the lookup key for an incoming secret.
pub fn digest_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Generate a public key id of the form `<prefix>-<12 hex chars>`.
pub fn generate_key_id(prefix: &str) -> String {
    let bytes: [u8; 6] = rand::random();
    format!("{}-{}", prefix, hex::encode(bytes))
}

/// Generate a fresh 256-bit API secret, hex-encoded.
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Hash a plaintext password into an Argon2id PHC string.
pub fn hash_password(password: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CredentialError::Hash(e.to_string()))
}

/// Check a plaintext password against a stored PHC string.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, CredentialError> {
    let parsed =
        PasswordHash::new(stored).map_err(|e| CredentialError::MalformedHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
