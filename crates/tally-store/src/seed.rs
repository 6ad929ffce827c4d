// ABOUTME: One-time credential seeding run when the store first opens.
// ABOUTME: Migrates the legacy ingestion secret into a hashed key and bootstraps a local admin.

use tally_core::{
    ApiKeyRecord, CredentialError, INGEST_EVENTS_SCOPE, Role, UserAccount, digest_secret,
    generate_key_id, hash_password, verify_password,
};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::connection::OpenedSignal;
use crate::store::{CredentialStore, InsertOutcome, StoreError};

pub const LEGACY_KEY_NAME: &str = "legacy-ingest-key";
pub const LEGACY_KEY_PREFIX: &str = "legacy";

pub const BOOTSTRAP_ADMIN_NAME: &str = "Local Admin";
pub const BOOTSTRAP_ADMIN_EMAIL: &str = "admin@local.test";
/// Development-only password for the bootstrapped admin.
pub const BOOTSTRAP_ADMIN_PASSWORD: &str = "password";

/// Errors that can occur while seeding. Never escape `CredentialSeeder::run`.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("hashing task failed: {0}")]
    Task(String),
}

/// Externally supplied inputs. Empty strings count as unset.
#[derive(Debug, Clone, Default)]
pub struct SeedConfig {
    pub legacy_ingest_secret: Option<String>,
    pub admin_registration_code: Option<String>,
}

/// What one seeding step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    /// A record was written; carries its public identifier.
    Created(String),
    AlreadyPresent,
    /// Required configuration is absent, so the step did nothing.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub legacy_key: SeedOutcome,
    pub admin: SeedOutcome,
}

/// Ensures baseline credentials exist without ever duplicating them.
#[derive(Debug, Clone)]
pub struct CredentialSeeder {
    config: SeedConfig,
}

impl CredentialSeeder {
    pub fn new(config: SeedConfig) -> Self {
        Self { config }
    }

    /// Wait for the first open, then seed exactly once. Reconnects never
    /// re-trigger this because the signal only fires once.
    pub fn spawn_on_open(self, signal: OpenedSignal) -> JoinHandle<Option<SeedReport>> {
        tokio::spawn(async move {
            let Some(store) = signal.opened().await else {
                tracing::warn!("store never opened; credential seeding skipped");
                return None;
            };
            Some(self.run(store.as_ref()).await)
        })
    }

    /// Run both steps. Failures are logged and reported, never propagated.
    /// The admin step runs even if the key step failed.
    pub async fn run(&self, store: &dyn CredentialStore) -> SeedReport {
        let legacy_key = self.ensure_legacy_key(store).await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error ensuring legacy ingest key");
            SeedOutcome::Failed(e.to_string())
        });

        let admin = self.ensure_admin(store).await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "error ensuring admin user");
            SeedOutcome::Failed(e.to_string())
        });

        SeedReport { legacy_key, admin }
    }

    async fn ensure_legacy_key(
        &self,
        store: &dyn CredentialStore,
    ) -> Result<SeedOutcome, SeedError> {
        let Some(secret) = configured(&self.config.legacy_ingest_secret) else {
            tracing::debug!("INGEST_API_KEY not set; no legacy key to migrate");
            return Ok(SeedOutcome::Skipped);
        };

        let hash = digest_secret(secret);
        if store.find_api_key_by_hash(&hash).await?.is_some() {
            return Ok(SeedOutcome::AlreadyPresent);
        }

        let record = ApiKeyRecord::new(
            LEGACY_KEY_NAME,
            generate_key_id(LEGACY_KEY_PREFIX),
            hash,
            [INGEST_EVENTS_SCOPE],
        );
        // A concurrent starter may have won between the lookup and here.
        match store.insert_api_key(record).await? {
            InsertOutcome::Created(record) => {
                tracing::info!(
                    key_id = %record.key_id,
                    "inserted legacy INGEST_API_KEY as a stored api key"
                );
                Ok(SeedOutcome::Created(record.key_id))
            }
            InsertOutcome::Existing(_) => Ok(SeedOutcome::AlreadyPresent),
        }
    }

    async fn ensure_admin(&self, store: &dyn CredentialStore) -> Result<SeedOutcome, SeedError> {
        if let Some(admin) = store.find_admin().await? {
            if uses_development_password(&admin).await {
                tracing::warn!(
                    email = %admin.email,
                    "local admin still uses the development password"
                );
            }
            return Ok(SeedOutcome::AlreadyPresent);
        }

        if configured(&self.config.admin_registration_code).is_none() {
            tracing::info!(
                "no admin found and ADMIN_REGISTRATION_CODE not set; skip creating local admin"
            );
            return Ok(SeedOutcome::Skipped);
        }

        let password = tokio::task::spawn_blocking(|| hash_password(BOOTSTRAP_ADMIN_PASSWORD))
            .await
            .map_err(|e| SeedError::Task(e.to_string()))??;
        let account =
            UserAccount::new(BOOTSTRAP_ADMIN_NAME, BOOTSTRAP_ADMIN_EMAIL, password, Role::Admin);

        match store.insert_admin_if_absent(account).await? {
            InsertOutcome::Created(admin) => {
                tracing::info!(
                    email = %admin.email,
                    "created local admin account (development password)"
                );
                Ok(SeedOutcome::Created(admin.email))
            }
            InsertOutcome::Existing(_) => Ok(SeedOutcome::AlreadyPresent),
        }
    }
}

/// Whether `admin` is the bootstrapped account with its password unchanged.
async fn uses_development_password(admin: &UserAccount) -> bool {
    if admin.email != BOOTSTRAP_ADMIN_EMAIL {
        return false;
    }
    let stored = admin.password.clone();
    tokio::task::spawn_blocking(move || verify_password(BOOTSTRAP_ADMIN_PASSWORD, &stored))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or(false)
}

fn configured(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
