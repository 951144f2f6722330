//! Staleness contracts for cache reads.
//!
//! Callers state how old a snapshot may be before it must be refreshed, and
//! every read reports whether that bound was exceeded.

use chrono::Duration as ChronoDuration;
use entitle_core::{SyncConfig, Timestamp};
use std::time::Duration;

/// Staleness thresholds for the two app lifecycle states, plus a separate
/// one for sandbox snapshots.
///
/// Background fetches are lower value, so the background threshold is
/// normally the longer of the two. Sandbox snapshots use `sandbox` in both
/// lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staleness {
    pub foreground: Duration,
    pub background: Duration,
    pub sandbox: Duration,
}

impl Staleness {
    /// Thresholds with `sandbox` equal to `foreground`.
    pub fn new(foreground: Duration, background: Duration) -> Self {
        Self {
            foreground,
            background,
            sandbox: foreground,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Duration) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.foreground_staleness, config.background_staleness)
            .with_sandbox(config.sandbox_staleness)
    }

    /// Threshold for the given lifecycle state and environment.
    pub fn threshold(&self, is_app_backgrounded: bool, is_sandbox: bool) -> Duration {
        if is_sandbox {
            self.sandbox
        } else if is_app_backgrounded {
            self.background
        } else {
            self.foreground
        }
    }
}

impl Default for Staleness {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Whether an entry last refreshed at `last_updated` is stale at `now`.
///
/// Missing timestamps are always stale. Otherwise the entry is stale once
/// strictly more than `max_age` has elapsed.
pub fn is_stale_at(last_updated: Option<Timestamp>, now: Timestamp, max_age: Duration) -> bool {
    match last_updated {
        None => true,
        Some(last_updated) => {
            let max_age = ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::MAX);
            now.signed_duration_since(last_updated) > max_age
        }
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: Option<T>,
    last_updated: Option<Timestamp>,
    is_stale: bool,
}

impl<T> CacheRead<T> {
    pub fn new(value: Option<T>, last_updated: Option<Timestamp>, is_stale: bool) -> Self {
        Self {
            value,
            last_updated,
            is_stale,
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    pub fn last_updated(&self) -> Option<Timestamp> {
        self.last_updated
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Whether a value was found, stale or not.
    pub fn is_hit(&self) -> bool {
        self.value.is_some()
    }

    /// Whether a value was found and may be served without refreshing.
    pub fn is_fresh_hit(&self) -> bool {
        self.value.is_some() && !self.is_stale
    }
}
