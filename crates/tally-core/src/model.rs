// ABOUTME: Persisted credential record shapes: API keys and user accounts.
// ABOUTME: Secrets never appear in serialized output; only digests are stored.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Scope granted to ingestion keys.
pub const INGEST_EVENTS_SCOPE: &str = "ingest:events";

/// A stored API key. The raw secret is never kept, only its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Public identifier, safe to show and to look keys up by.
    pub key_id: String,
    pub name: String,
    /// Hex SHA-256 digest of the secret. Unique across all records.
    #[serde(skip_serializing)]
    pub hash: String,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Build a new record stamped with the current time.
    pub fn new<I, S>(
        name: impl Into<String>,
        key_id: impl Into<String>,
        hash: impl Into<String>,
        scopes: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_id: key_id.into(),
            name: name.into(),
            hash: hash.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        }
    }
}

/// Closed set of account roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Error)]
#[error("unknown role: {0}")]
pub struct RoleParseError(pub String);

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// A dashboard user. `password` holds an Argon2 PHC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: Ulid,
    pub name: String,
    /// Stored trimmed and lowercased; unique across all accounts.
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    /// Build a new account with a fresh id. `password_hash` must already be hashed.
    pub fn new(
        name: impl Into<String>,
        email: &str,
        password_hash: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            email: normalize_email(email),
            password: password_hash.into(),
            role,
            created_at: Utc::now(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::User.to_string(), "user");
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn api_key_serialization_hides_hash() {
        let record = ApiKeyRecord::new("ingest", "key-01", "deadbeef", [INGEST_EVENTS_SCOPE]);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["keyId"], "key-01");
        assert_eq!(json["scopes"][0], INGEST_EVENTS_SCOPE);
        assert!(json.get("hash").is_none(), "hash must not be serialized");
    }

    #[test]
    fn user_serialization_hides_password() {
        let user = UserAccount::new("Ada", "  Ada@Example.COM ", "$argon2id$fake", Role::Admin);
        assert_eq!(user.email, "ada@example.com");
        assert!(user.is_admin());

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["role"], "admin");
        assert!(json.get("password").is_none());
    }

    #[test]
    fn duplicate_scopes_collapse() {
        let record = ApiKeyRecord::new("k", "id", "h", ["a", "b", "a"]);
        assert_eq!(record.scopes.len(), 2);
        assert!(record.scopes.contains("b"));
    }
}
