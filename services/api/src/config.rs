//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// The `DATABASE_URL` value that selects the in-process store instead of PostgreSQL.
pub const MEMORY_DATABASE_URL: &str = "memory";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub cors_origin: String,
    pub session_ttl_days: i64,
    /// The fee charged by the payment form, in the smallest currency unit.
    pub fee_amount: i64,
    /// How long the simulated payment "processes" before it is recorded.
    pub payment_delay: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Load Server and Database Settings ---
        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let cors_origin = std::env::var("CORS_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        // --- Load Fee and Session Settings ---
        let session_ttl_days = positive_var("SESSION_TTL_DAYS", 30)?;
        let fee_amount = positive_var("FEE_AMOUNT", 5000)?;
        let payment_delay_ms = non_negative_var("PAYMENT_DELAY_MS", 3000)?;

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            cors_origin,
            session_ttl_days,
            fee_amount,
            payment_delay: Duration::from_millis(payment_delay_ms as u64),
        })
    }

    /// Settings for tests and local experiments: in-memory store, no payment delay.
    pub fn for_memory() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: MEMORY_DATABASE_URL.to_string(),
            log_level: Level::INFO,
            cors_origin: "http://localhost:3000".to_string(),
            session_ttl_days: 30,
            fee_amount: 5000,
            payment_delay: Duration::ZERO,
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }
}

fn parse_i64_var(name: &str, default: i64) -> Result<i64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn positive_var(name: &str, default: i64) -> Result<i64, ConfigError> {
    let value = parse_i64_var(name, default)?;
    if value <= 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' must be greater than zero", value),
        ));
    }
    Ok(value)
}

fn non_negative_var(name: &str, default: i64) -> Result<i64, ConfigError> {
    let value = parse_i64_var(name, default)?;
    if value < 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' must not be negative", value),
        ));
    }
    Ok(value)
}
