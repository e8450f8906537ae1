//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/rollup";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Aggregate Engine Constants
// ============================================================================

/// Relative partition-count difference tolerated before an entity is
/// reported as mismatched.
pub const DEFAULT_MISMATCH_TOLERANCE: f64 = 0.05;

/// Entities per transaction when rebuilding a table. Keeps the IN list far
/// below the Postgres limit of 65535 bind parameters.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Hard ceiling on the batch size.
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Default periodic check-and-repair interval (1 hour).
pub const DEFAULT_REPAIR_INTERVAL_SECS: u64 = 3600;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub aggregates: AggregateSettings,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Tuning for the validator, checker and materialization engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSettings {
    pub mismatch_tolerance: f64,
    /// Report missing auto-increment key columns instead of adding them
    pub skip_auto_increment_columns: bool,
    pub batch_size: usize,
    pub repair_interval_secs: u64,
    pub periodic_repair: bool,
}

impl AggregateSettings {
    pub fn repair_interval(&self) -> Duration {
        Duration::from_secs(self.repair_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.mismatch_tolerance.is_finite() || self.mismatch_tolerance < 0.0 {
            return Err(ConfigError::InvalidSetting(format!(
                "mismatch tolerance must be a non-negative number, got {}",
                self.mismatch_tolerance
            )));
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidSetting(format!(
                "batch size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }

        if self.periodic_repair && self.repair_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "repair interval must be greater than 0 when periodic repair is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            mismatch_tolerance: DEFAULT_MISMATCH_TOLERANCE,
            skip_auto_increment_columns: true,
            batch_size: DEFAULT_BATCH_SIZE,
            repair_interval_secs: DEFAULT_REPAIR_INTERVAL_SECS,
            periodic_repair: true,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or("DATABASE_IDLE_TIMEOUT", DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
            },
            aggregates: AggregateSettings {
                mismatch_tolerance: env_or("ROLLUP_MISMATCH_TOLERANCE", DEFAULT_MISMATCH_TOLERANCE),
                skip_auto_increment_columns: env_or("ROLLUP_SKIP_AUTO_INCREMENT_COLUMNS", true),
                batch_size: env_or("ROLLUP_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                repair_interval_secs: env_or(
                    "ROLLUP_REPAIR_INTERVAL_SECS",
                    DEFAULT_REPAIR_INTERVAL_SECS,
                ),
                periodic_repair: env_or("ROLLUP_PERIODIC_REPAIR", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        self.aggregates.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            aggregates: AggregateSettings::default(),
        }
    }
}
