//! Configuration types

use crate::{ConfigError, EntitleError, EntitleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default prefix for locally generated anonymous identifiers.
pub const DEFAULT_ANONYMOUS_ID_PREFIX: &str = "$EntitleAnonymousID:";

/// Largest accepted LMDB map size (1 TiB).
pub const MAX_LMDB_MAP_SIZE_MB: usize = 1024 * 1024;

/// Synchronization engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Staleness threshold while the app is in the foreground.
    pub foreground_staleness: Duration,
    /// Staleness threshold while the app is backgrounded. Must be at least
    /// `foreground_staleness`.
    pub background_staleness: Duration,
    /// Staleness threshold for sandbox snapshots, whatever the lifecycle
    /// state. Sandbox purchases renew in minutes.
    pub sandbox_staleness: Duration,
    /// Namespace prefix for generated anonymous identifiers.
    pub anonymous_id_prefix: String,
    /// LMDB map size for the durable store, in megabytes.
    pub lmdb_map_size_mb: usize,
    /// Upper bound of the random delay before background-triggered fetches.
    /// Zero disables the delay.
    pub background_jitter_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            foreground_staleness: Duration::from_secs(5 * 60),
            background_staleness: Duration::from_secs(25 * 60 * 60),
            sandbox_staleness: Duration::from_secs(5 * 60),
            anonymous_id_prefix: DEFAULT_ANONYMOUS_ID_PREFIX.to_string(),
            lmdb_map_size_mb: 64,
            background_jitter_max: Duration::ZERO,
        }
    }
}

impl SyncConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `ENTITLE_FOREGROUND_STALENESS_SECS` (default: 300)
    /// - `ENTITLE_BACKGROUND_STALENESS_SECS` (default: 90000)
    /// - `ENTITLE_SANDBOX_STALENESS_SECS` (default: 300)
    /// - `ENTITLE_ANONYMOUS_ID_PREFIX` (default: `$EntitleAnonymousID:`)
    /// - `ENTITLE_LMDB_MAP_SIZE_MB` (default: 64)
    /// - `ENTITLE_BACKGROUND_JITTER_MS` (default: 0)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            foreground_staleness: std::env::var("ENTITLE_FOREGROUND_STALENESS_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.foreground_staleness),
            background_staleness: std::env::var("ENTITLE_BACKGROUND_STALENESS_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.background_staleness),
            sandbox_staleness: std::env::var("ENTITLE_SANDBOX_STALENESS_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sandbox_staleness),
            anonymous_id_prefix: std::env::var("ENTITLE_ANONYMOUS_ID_PREFIX")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.anonymous_id_prefix),
            lmdb_map_size_mb: std::env::var("ENTITLE_LMDB_MAP_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lmdb_map_size_mb),
            background_jitter_max: std::env::var("ENTITLE_BACKGROUND_JITTER_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.background_jitter_max),
        }
    }

    /// Staleness threshold for the given lifecycle state and environment.
    pub fn staleness_for(&self, is_app_backgrounded: bool, is_sandbox: bool) -> Duration {
        if is_sandbox {
            self.sandbox_staleness
        } else if is_app_backgrounded {
            self.background_staleness
        } else {
            self.foreground_staleness
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - all staleness durations are positive
    /// - background_staleness >= foreground_staleness
    /// - anonymous_id_prefix is not empty
    /// - lmdb_map_size_mb is between 1 and `MAX_LMDB_MAP_SIZE_MB`
    pub fn validate(&self) -> EntitleResult<()> {
        if self.foreground_staleness.is_zero() {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "foreground_staleness".to_string(),
                value: format!("{:?}", self.foreground_staleness),
                reason: "foreground_staleness must be positive".to_string(),
            }));
        }

        if self.background_staleness.is_zero() {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "background_staleness".to_string(),
                value: format!("{:?}", self.background_staleness),
                reason: "background_staleness must be positive".to_string(),
            }));
        }

        if self.sandbox_staleness.is_zero() {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "sandbox_staleness".to_string(),
                value: format!("{:?}", self.sandbox_staleness),
                reason: "sandbox_staleness must be positive".to_string(),
            }));
        }

        if self.background_staleness < self.foreground_staleness {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "background_staleness".to_string(),
                value: format!("{:?}", self.background_staleness),
                reason: "background_staleness must not be shorter than foreground_staleness"
                    .to_string(),
            }));
        }

        if self.anonymous_id_prefix.trim().is_empty() {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "anonymous_id_prefix".to_string(),
                value: self.anonymous_id_prefix.clone(),
                reason: "anonymous_id_prefix must not be empty".to_string(),
            }));
        }

        if self.lmdb_map_size_mb == 0 || self.lmdb_map_size_mb > MAX_LMDB_MAP_SIZE_MB {
            return Err(EntitleError::Config(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: self.lmdb_map_size_mb.to_string(),
                reason: format!("lmdb_map_size_mb must be between 1 and {MAX_LMDB_MAP_SIZE_MB}"),
            }));
        }

        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
