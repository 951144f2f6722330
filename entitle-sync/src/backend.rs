//! Collaborator contracts: the entitlement backend and the app lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use entitle_core::{CustomerState, EntitleResult, PurchaseParams};

/// Result of identifying a user with the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInResponse {
    pub customer_state: CustomerState,
    /// Whether the backend created a new user record.
    pub created: bool,
}

/// Remote entitlement authority.
///
/// Implementations own transport concerns including timeouts. A timeout is
/// reported as an ordinary `NetworkError`; the engine never retries on its own.
#[async_trait]
pub trait EntitlementBackend: Send + Sync {
    async fn fetch_customer_state(
        &self,
        app_user_id: &str,
        is_app_backgrounded: bool,
    ) -> EntitleResult<CustomerState>;

    async fn post_transaction(&self, params: &PurchaseParams) -> EntitleResult<CustomerState>;

    async fn log_in(
        &self,
        current_app_user_id: &str,
        new_app_user_id: &str,
    ) -> EntitleResult<LogInResponse>;

    async fn create_alias(
        &self,
        current_app_user_id: &str,
        new_app_user_id: &str,
    ) -> EntitleResult<()>;
}

/// Source of the foreground/background flag used to pick staleness durations.
pub trait AppLifecycle: Send + Sync {
    fn is_app_backgrounded(&self) -> bool;
}

/// An [`AppLifecycle`] driven by the host through [`StaticLifecycle::set_backgrounded`].
#[derive(Debug, Default)]
pub struct StaticLifecycle {
    backgrounded: AtomicBool,
}

impl StaticLifecycle {
    pub fn new(backgrounded: bool) -> Self {
        Self {
            backgrounded: AtomicBool::new(backgrounded),
        }
    }

    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.backgrounded.store(backgrounded, Ordering::SeqCst);
    }
}

impl AppLifecycle for StaticLifecycle {
    fn is_app_backgrounded(&self) -> bool {
        self.backgrounded.load(Ordering::SeqCst)
    }
}
