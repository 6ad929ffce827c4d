// ABOUTME: Configuration loading and validation for the tally server.
// ABOUTME: Reads environment variables; invalid values refuse startup, absent optional ones never do.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use http::HeaderValue;
use tally_store::{ConnectionSettings, RetryPolicy, SeedConfig};
use thiserror::Error;

use crate::modules::Capability;

pub const DEFAULT_STORE_URI: &str = "sqlite://tally.db";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORT is not a valid port number: {0}")]
    InvalidPort(String),

    #[error("HOST is not a valid IP address: {0}")]
    InvalidHost(String),

    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("STORE_RETRY_JITTER must be between 0 and 1, got {0}")]
    InvalidJitter(f64),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("STORE_RETRY_MULTIPLIER must be at least 1, got {0}")]
    InvalidMultiplier(f64),

    #[error("DISABLED_MODULES names an unknown module: {0}")]
    UnknownModule(String),

    #[error("CORS_ORIGIN is not a valid header value: {0}")]
    InvalidCorsOrigin(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct TallyConfig {
    pub bind: SocketAddr,
    pub store_uri: String,
    pub cors_origin: String,
    pub seed: SeedConfig,
    pub connection: ConnectionSettings,
    pub disabled_modules: BTreeSet<Capability>,
}

impl TallyConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - STORE_URI: store location (default: sqlite://tally.db)
    /// - HOST / PORT: listen address (default: 127.0.0.1:5000)
    /// - INGEST_API_KEY: legacy ingestion secret migrated into the key store (optional)
    /// - ADMIN_REGISTRATION_CODE: enables the local admin bootstrap (optional)
    /// - CORS_ORIGIN: allowed browser origin (default: http://localhost:5173)
    /// - STORE_CONNECT_TIMEOUT_MS, STORE_IO_TIMEOUT_MS, STORE_HEALTH_INTERVAL_MS
    /// - STORE_RETRY_DELAY_MS, STORE_RETRY_MAX_DELAY_MS, STORE_RETRY_MULTIPLIER,
    ///   STORE_RETRY_JITTER, STORE_RETRY_MAX_ATTEMPTS
    /// - DISABLED_MODULES: comma-separated module names to withhold
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = match var("HOST") {
            None => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(h) if h.eq_ignore_ascii_case("localhost") => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(h) => h.parse().map_err(|_| ConfigError::InvalidHost(h))?,
        };
        let port = match var("PORT") {
            None => DEFAULT_PORT,
            Some(p) => p.parse().map_err(|_| ConfigError::InvalidPort(p))?,
        };

        let store_uri = var("STORE_URI").unwrap_or_else(|| DEFAULT_STORE_URI.to_string());

        let cors_origin = var("CORS_ORIGIN").unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());
        if HeaderValue::from_str(&cors_origin).is_err() {
            return Err(ConfigError::InvalidCorsOrigin(cors_origin));
        }

        // Passed through untrimmed; the seeder treats empty as unset.
        let seed = SeedConfig {
            legacy_ingest_secret: lookup("INGEST_API_KEY"),
            admin_registration_code: lookup("ADMIN_REGISTRATION_CODE"),
        };

        let defaults = ConnectionSettings::default();
        let base_delay =
            millis(&var, "STORE_RETRY_DELAY_MS")?.unwrap_or(defaults.retry.base_delay);
        let retry = RetryPolicy {
            base_delay,
            max_delay: millis(&var, "STORE_RETRY_MAX_DELAY_MS")?.unwrap_or(base_delay),
            multiplier: number(&var, "STORE_RETRY_MULTIPLIER")?
                .unwrap_or(defaults.retry.multiplier),
            jitter: number(&var, "STORE_RETRY_JITTER")?.unwrap_or(defaults.retry.jitter),
            max_attempts: number(&var, "STORE_RETRY_MAX_ATTEMPTS")?,
        };
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::InvalidJitter(retry.jitter));
        }
        if retry.multiplier < 1.0 || retry.multiplier.is_nan() {
            return Err(ConfigError::InvalidMultiplier(retry.multiplier));
        }

        let connection = ConnectionSettings {
            connect_timeout: nonzero_millis(&var, "STORE_CONNECT_TIMEOUT_MS")?
                .unwrap_or(defaults.connect_timeout),
            io_timeout: nonzero_millis(&var, "STORE_IO_TIMEOUT_MS")?.unwrap_or(defaults.io_timeout),
            health_interval: nonzero_millis(&var, "STORE_HEALTH_INTERVAL_MS")?
                .unwrap_or(defaults.health_interval),
            retry,
        };

        let disabled_modules = match var("DISABLED_MODULES") {
            None => BTreeSet::new(),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    name.parse::<Capability>()
                        .map_err(|_| ConfigError::UnknownModule(name.to_string()))
                })
                .collect::<Result<_, _>>()?,
        };

        Ok(Self {
            bind: SocketAddr::new(host, port),
            store_uri,
            cors_origin,
            seed,
            connection,
            disabled_modules,
        })
    }
}

fn number<V, T>(var: &V, name: &'static str) -> Result<Option<T>, ConfigError>
where
    V: Fn(&str) -> Option<String>,
    T: FromStr,
{
    var(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { name, value })
        })
        .transpose()
}

fn millis<V>(var: &V, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    Ok(number::<V, u64>(var, name)?.map(Duration::from_millis))
}

/// Like `millis`, but zero is an error: these bound timers that must tick.
fn nonzero_millis<V>(var: &V, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match millis(var, name)? {
        Some(duration) if duration.is_zero() => Err(ConfigError::ZeroDuration { name }),
        other => Ok(other),
    }
}
