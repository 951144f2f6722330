//! Identity lifecycle.
//!
//! Owns the current app user id and every transition between identities.
//! Transitions are totally ordered: each one holds the transition lock from
//! its first cache mutation until its forced refresh has resolved. A failed
//! refresh does not roll the transition back; the new owner simply starts
//! with an empty cache and the next read fetches.
//!
//! The current identity is write-locked from the cache clear until the new
//! identity is set, so no reader can observe the old identifier once its
//! caches are gone.

use std::sync::{Arc, PoisonError, RwLock};

use entitle_core::{
    normalize_app_user_id, AnonymousIdFormat, CacheFetchPolicy, CustomerState, IdentityError,
    IdentityState, SyncFailure,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::EntitlementBackend;
use crate::synchronizer::{CustomerStateSynchronizer, SyncResult};

/// Result of a successful log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInOutcome {
    pub customer_state: CustomerState,
    /// Whether the backend created a new user for the identifier.
    pub created: bool,
}

pub struct IdentityManager {
    synchronizer: CustomerStateSynchronizer,
    backend: Arc<dyn EntitlementBackend>,
    format: AnonymousIdFormat,
    current: RwLock<Option<IdentityState>>,
    transition: Mutex<()>,
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("current", &self.current_identity())
            .field("prefix", &self.format.prefix())
            .finish()
    }
}

impl IdentityManager {
    pub fn new(
        synchronizer: CustomerStateSynchronizer,
        backend: Arc<dyn EntitlementBackend>,
        format: AnonymousIdFormat,
    ) -> Self {
        Self {
            synchronizer,
            backend,
            format,
            current: RwLock::new(None),
            transition: Mutex::new(()),
        }
    }

    pub fn current_identity(&self) -> Option<IdentityState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_app_user_id(&self) -> Option<String> {
        self.current_identity().map(|identity| identity.app_user_id)
    }

    pub fn is_anonymous(&self) -> bool {
        self.current_identity()
            .is_some_and(|identity| identity.is_anonymous)
    }

    pub fn anonymous_format(&self) -> &AnonymousIdFormat {
        &self.format
    }

    /// Establish the identity at startup.
    ///
    /// An explicit identifier becomes current; if a different identifier was
    /// stored before, its caches are cleared. Without one, the stored
    /// identifier is reused, then the legacy one, and only then is a new
    /// anonymous identifier generated. Blank identifiers count as absent.
    pub async fn configure(&self, app_user_id: Option<&str>) -> IdentityState {
        let _transition = self.transition.lock().await;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let cache = self.synchronizer.cache();
        let stored = cache.cached_app_user_id();
        let legacy = cache.cached_legacy_app_user_id();
        let explicit = app_user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let identity = match explicit {
            Some(app_user_id) => {
                match stored.as_deref().or(legacy.as_deref()) {
                    Some(old) if old != app_user_id => {
                        self.synchronizer
                            .clear_for_identity_change(old, &app_user_id);
                    }
                    _ => cache.cache_app_user_id(&app_user_id),
                }
                IdentityState {
                    is_anonymous: self.format.matches(&app_user_id),
                    app_user_id,
                }
            }
            None => match stored.or_else(|| legacy.clone()) {
                Some(app_user_id) => {
                    cache.cache_app_user_id(&app_user_id);
                    // Older installs only stored generated identifiers in the
                    // legacy slot.
                    let is_anonymous = self.format.matches(&app_user_id)
                        || legacy.as_deref() == Some(app_user_id.as_str());
                    IdentityState {
                        app_user_id,
                        is_anonymous,
                    }
                }
                None => {
                    let app_user_id = self.format.generate();
                    cache.cache_app_user_id(&app_user_id);
                    debug!(app_user_id = %app_user_id, "Generated anonymous app user id");
                    IdentityState::anonymous(app_user_id)
                }
            },
        };

        info!(
            app_user_id = %identity.app_user_id,
            is_anonymous = identity.is_anonymous,
            "Identity configured"
        );
        self.synchronizer.set_current_owner(&identity.app_user_id);
        *current = Some(identity.clone());
        identity
    }

    /// Switch to a known identifier.
    ///
    /// Logging in as the current identifier skips the backend but still
    /// clears the owner's cache and refetches.
    pub async fn log_in(&self, new_app_user_id: &str) -> Result<LogInOutcome, SyncFailure> {
        let new_app_user_id = self.validate_known(new_app_user_id)?;
        let _transition = self.transition.lock().await;
        let old_app_user_id = self.require_current()?.app_user_id;

        if old_app_user_id == new_app_user_id {
            info!(app_user_id = %new_app_user_id, "Already logged in, refreshing");
            self.commit(&old_app_user_id, IdentityState::known(new_app_user_id.clone()));
            let customer_state = self.forced_refresh(&new_app_user_id).await?;
            return Ok(LogInOutcome {
                customer_state,
                created: false,
            });
        }

        let response = self
            .backend
            .log_in(&old_app_user_id, &new_app_user_id)
            .await
            .map_err(|error| {
                warn!(
                    old_app_user_id = %old_app_user_id,
                    new_app_user_id = %new_app_user_id,
                    error = %error,
                    "Log in failed"
                );
                SyncFailure::new(error)
            })?;

        self.commit(&old_app_user_id, IdentityState::known(new_app_user_id.clone()));
        let customer_state = response
            .customer_state
            .with_app_user_id(new_app_user_id.clone());
        self.synchronizer.cache_customer_state(customer_state.clone());
        info!(
            app_user_id = %new_app_user_id,
            created = response.created,
            "Logged in"
        );
        Ok(LogInOutcome {
            customer_state,
            created: response.created,
        })
    }

    /// Alias the current user to `new_app_user_id` and switch to it.
    pub async fn create_alias(&self, new_app_user_id: &str) -> SyncResult {
        let new_app_user_id = self.validate_known(new_app_user_id)?;
        let _transition = self.transition.lock().await;
        let old_app_user_id = self.require_current()?.app_user_id;

        if old_app_user_id != new_app_user_id {
            self.backend
                .create_alias(&old_app_user_id, &new_app_user_id)
                .await
                .map_err(|error| {
                    warn!(
                        old_app_user_id = %old_app_user_id,
                        new_app_user_id = %new_app_user_id,
                        error = %error,
                        "Create alias failed"
                    );
                    SyncFailure::new(error)
                })?;
        }

        self.commit(&old_app_user_id, IdentityState::known(new_app_user_id.clone()));
        info!(app_user_id = %new_app_user_id, "Alias created");
        self.forced_refresh(&new_app_user_id).await
    }

    /// Log out a known user and continue as a new anonymous one.
    pub async fn log_out(&self) -> SyncResult {
        let _transition = self.transition.lock().await;
        let current = self.require_current()?;
        if current.is_anonymous {
            warn!(app_user_id = %current.app_user_id, "Log out called for anonymous user");
            return Err(IdentityError::LogOutAnonymousUser.into());
        }
        self.reset_locked(&current.app_user_id).await
    }

    /// Continue as a new anonymous user, whatever the current identity.
    pub async fn reset(&self) -> SyncResult {
        let _transition = self.transition.lock().await;
        let current = self.require_current()?;
        self.reset_locked(&current.app_user_id).await
    }

    async fn reset_locked(&self, old_app_user_id: &str) -> SyncResult {
        let new_app_user_id = self.format.generate();
        self.commit(old_app_user_id, IdentityState::anonymous(new_app_user_id.clone()));
        info!(
            old_app_user_id = %old_app_user_id,
            new_app_user_id = %new_app_user_id,
            "Reset to anonymous user"
        );
        self.forced_refresh(&new_app_user_id).await
    }

    fn validate_known(&self, app_user_id: &str) -> Result<String, IdentityError> {
        let app_user_id = normalize_app_user_id(app_user_id)?;
        if self.format.matches(&app_user_id) {
            warn!(app_user_id = %app_user_id, "Rejected anonymous app user id");
            return Err(IdentityError::AnonymousIdRejected { app_user_id });
        }
        Ok(app_user_id)
    }

    fn require_current(&self) -> Result<IdentityState, IdentityError> {
        self.current_identity().ok_or(IdentityError::NotConfigured)
    }

    /// Clear the old owner's caches and make `identity` current.
    fn commit(&self, old_app_user_id: &str, identity: IdentityState) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.synchronizer
            .clear_for_identity_change(old_app_user_id, &identity.app_user_id);
        *current = Some(identity);
    }

    async fn forced_refresh(&self, app_user_id: &str) -> SyncResult {
        self.synchronizer
            .get_customer_state(app_user_id, CacheFetchPolicy::FetchCurrent)
            .await
    }
}
