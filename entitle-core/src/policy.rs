//! Cache fetch policies

use serde::{Deserialize, Serialize};

/// How a customer state read balances cached data against a network fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFetchPolicy {
    /// Deliver the cached value whatever its age. Never fetches.
    FromCacheOnly,
    /// Deliver the cached value only when it is not stale. Never fetches.
    FetchNever,
    /// Deliver the cached value when it is not stale, otherwise fetch.
    NotStaleCachedOrFetched,
    /// Deliver any cached value immediately, refreshing in the background when
    /// stale. Fetches in the foreground only when nothing is cached.
    #[default]
    CachedOrFetched,
    /// Always fetch, joining an in-flight fetch for the same owner.
    FetchCurrent,
}

impl CacheFetchPolicy {
    /// Whether this policy may ever reach the network.
    pub fn may_fetch(self) -> bool {
        !matches!(self, Self::FromCacheOnly | Self::FetchNever)
    }
}
