// ABOUTME: SQLite-backed credential store with store-level uniqueness on key hashes and emails.
// ABOUTME: Blocking rusqlite calls run on the blocking pool behind the async CredentialStore trait.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};
use tally_core::{ApiKeyRecord, Role, UserAccount};

use crate::store::{CredentialStore, InsertOutcome, StoreError};

/// Where a store URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    /// Parse `sqlite::memory:`, `sqlite://<path>`, `sqlite:<path>`, or a bare path.
    /// Any other `scheme://` is rejected as unsupported.
    pub fn parse(uri: &str) -> Result<Self, StoreError> {
        let uri = uri.trim();
        if uri == "sqlite::memory:" || uri == ":memory:" {
            return Ok(StoreLocation::Memory);
        }

        let path = if let Some(rest) = uri.strip_prefix("sqlite://") {
            rest
        } else if let Some(rest) = uri.strip_prefix("sqlite:") {
            rest
        } else if uri.contains("://") {
            return Err(StoreError::UnsupportedUri(redact_uri(uri)));
        } else {
            uri
        };

        if path.is_empty() {
            return Err(StoreError::UnsupportedUri(uri.to_string()));
        }
        Ok(StoreLocation::File(PathBuf::from(path)))
    }
}

/// `uri` with any `user:password@` userinfo replaced by `***@`.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://***{}", scheme, &rest[at..]),
        None => uri.to_string(),
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS api_keys (
        key_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        hash TEXT NOT NULL UNIQUE,
        scopes TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password TEXT NOT NULL,
        role TEXT NOT NULL CHECK (role IN ('user', 'admin')),
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS users_role ON users(role);
";

/// A credential store backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    location: StoreLocation,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open an existing or new database file. The parent directory must
    /// already exist; a missing directory surfaces as `Unreachable`.
    /// `busy_timeout` bounds how long any statement waits on a locked database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::migrate(conn, StoreLocation::File(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(conn, StoreLocation::Memory)
    }

    /// Open whatever `location` points at.
    pub fn open_location(
        location: &StoreLocation,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        match location {
            StoreLocation::File(path) => Self::open(path, busy_timeout),
            StoreLocation::Memory => Self::open_in_memory(),
        }
    }

    fn migrate(conn: Connection, location: StoreLocation) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("store task failed: {}", e)))?
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn api_key_from_row(row: &Row<'_>) -> Result<ApiKeyRecord, rusqlite::Error> {
    let scopes: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(ApiKeyRecord {
        key_id: row.get(0)?,
        name: row.get(1)?,
        hash: row.get(2)?,
        scopes: serde_json::from_str(&scopes).map_err(|e| conversion_error(3, e))?,
        created_at: parse_timestamp(4, &created_at)?,
    })
}

fn user_from_row(row: &Row<'_>) -> Result<UserAccount, rusqlite::Error> {
    let id: String = row.get(0)?;
    let role: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(UserAccount {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        name: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        role: role.parse::<Role>().map_err(|e| conversion_error(4, e))?,
        created_at: parse_timestamp(5, &created_at)?,
    })
}

const API_KEY_COLUMNS: &str = "key_id, name, hash, scopes, created_at";
const USER_COLUMNS: &str = "id, name, email, password, role, created_at";

fn select_api_key_by_hash(
    conn: &Connection,
    hash: &str,
) -> Result<Option<ApiKeyRecord>, StoreError> {
    let sql = format!("SELECT {} FROM api_keys WHERE hash = ?1", API_KEY_COLUMNS);
    Ok(conn
        .query_row(&sql, params![hash], api_key_from_row)
        .optional()?)
}

fn select_admin(conn: &Connection) -> Result<Option<UserAccount>, StoreError> {
    let sql = format!(
        "SELECT {} FROM users WHERE role = 'admin' ORDER BY created_at ASC LIMIT 1",
        USER_COLUMNS
    );
    Ok(conn.query_row(&sql, [], user_from_row).optional()?)
}

fn insert_user_row(conn: &Connection, account: &UserAccount) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO users (id, name, email, password, role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            account.id.to_string(),
            account.name,
            account.email,
            account.password,
            account.role.as_str(),
            account.created_at.to_rfc3339(),
        ],
    )
    .map_err(|e| match StoreError::from(e) {
        StoreError::AlreadyExists(_) => StoreError::AlreadyExists(format!(
            "an account with email {} already exists",
            account.email
        )),
        other => other,
    })?;
    Ok(())
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let hash = hash.to_string();
        self.with_conn(move |conn| select_api_key_by_hash(conn, &hash))
            .await
    }

    async fn insert_api_key(
        &self,
        record: ApiKeyRecord,
    ) -> Result<InsertOutcome<ApiKeyRecord>, StoreError> {
        self.with_conn(move |conn| {
            let scopes = serde_json::to_string(&record.scopes)?;
            let inserted = conn.execute(
                "INSERT INTO api_keys (key_id, name, hash, scopes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(hash) DO NOTHING",
                params![
                    record.key_id,
                    record.name,
                    record.hash,
                    scopes,
                    record.created_at.to_rfc3339(),
                ],
            )?;

            if inserted == 1 {
                return Ok(InsertOutcome::Created(record));
            }
            match select_api_key_by_hash(conn, &record.hash)? {
                Some(existing) => Ok(InsertOutcome::Existing(existing)),
                None => Err(StoreError::AlreadyExists(format!(
                    "api key {} conflicts with a concurrent change",
                    record.key_id
                ))),
            }
        })
        .await
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM api_keys ORDER BY created_at ASC", API_KEY_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], api_key_from_row)?;

            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<bool, StoreError> {
        let key_id = key_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM api_keys WHERE key_id = ?1", params![key_id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn find_admin(&self) -> Result<Option<UserAccount>, StoreError> {
        self.with_conn(|conn| select_admin(conn)).await
    }

    async fn insert_admin_if_absent(
        &self,
        account: UserAccount,
    ) -> Result<InsertOutcome<UserAccount>, StoreError> {
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front, so a second process
            // running the same check blocks until we commit.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(existing) = select_admin(&tx)? {
                return Ok(InsertOutcome::Existing(existing));
            }
            let mut account = account;
            account.role = Role::Admin;
            insert_user_row(&tx, &account)?;
            tx.commit()?;
            Ok(InsertOutcome::Created(account))
        })
        .await
    }

    async fn insert_user(&self, account: UserAccount) -> Result<UserAccount, StoreError> {
        self.with_conn(move |conn| {
            insert_user_row(conn, &account)?;
            Ok(account)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users ORDER BY created_at ASC", USER_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], user_from_row)?;

            let mut users = Vec::new();
            for row in rows {
                users.push(row?);
            }
            Ok(users)
        })
        .await
    }
}
