//! Entitle Test Utilities
//!
//! Centralized test infrastructure for the entitle workspace:
//! - A scriptable mock backend with call counters and a gate for holding
//!   calls open during concurrency tests
//! - A controllable app lifecycle
//! - Fixtures for common customer states and purchases
//! - Proptest generators
//! - Custom assertions

pub use entitle_core::{
    BackendError, CacheFetchPolicy, CustomerState, CustomerStatePayload, EntitleError,
    EntitleResult, EntitlementRecord, ManualClock, NetworkError, PeriodType, ProductInfo,
    PurchaseParams, ResponseError, Store, SubscriptionRecord, SyncConfig, SyncFailure, Timestamp,
    TransactionDescriptor,
};
pub use entitle_storage::{DeviceCache, InMemoryStore};
pub use entitle_sync::{AppLifecycle, EntitlementBackend, LogInResponse};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// A backend call as seen by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    FetchCustomerState {
        app_user_id: String,
        is_app_backgrounded: bool,
    },
    PostTransaction(PurchaseParams),
    LogIn {
        current_app_user_id: String,
        new_app_user_id: String,
    },
    CreateAlias {
        current_app_user_id: String,
        new_app_user_id: String,
    },
}

/// Scriptable [`EntitlementBackend`].
///
/// Unless stubbed, fetches return an empty customer state for the requested
/// owner and posts return [`fixtures::customer_state_with_pro`]. While the
/// gate is held every call blocks before producing its result.
#[derive(Debug)]
pub struct MockBackend {
    fetch_calls: AtomicUsize,
    post_calls: AtomicUsize,
    log_in_calls: AtomicUsize,
    alias_calls: AtomicUsize,
    fetch_stubs: Mutex<HashMap<String, EntitleResult<CustomerState>>>,
    fetch_default: Mutex<Option<EntitleResult<CustomerState>>>,
    post_result: Mutex<Option<EntitleResult<CustomerState>>>,
    log_in_error: Mutex<Option<EntitleError>>,
    alias_error: Mutex<Option<EntitleError>>,
    log_in_created: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
    gate: watch::Sender<bool>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            fetch_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
            log_in_calls: AtomicUsize::new(0),
            alias_calls: AtomicUsize::new(0),
            fetch_stubs: Mutex::new(HashMap::new()),
            fetch_default: Mutex::new(None),
            post_result: Mutex::new(None),
            log_in_error: Mutex::new(None),
            alias_error: Mutex::new(None),
            log_in_created: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            gate,
        }
    }

    // === Stubbing ===

    /// Result of fetches for `app_user_id`.
    pub fn stub_fetch(&self, app_user_id: &str, result: EntitleResult<CustomerState>) {
        self.fetch_stubs
            .lock()
            .unwrap()
            .insert(app_user_id.to_string(), result);
    }

    /// Result of fetches for owners without a specific stub.
    pub fn stub_fetch_default(&self, result: EntitleResult<CustomerState>) {
        *self.fetch_default.lock().unwrap() = Some(result);
    }

    pub fn stub_post(&self, result: EntitleResult<CustomerState>) {
        *self.post_result.lock().unwrap() = Some(result);
    }

    pub fn fail_log_in(&self, error: EntitleError) {
        *self.log_in_error.lock().unwrap() = Some(error);
    }

    pub fn fail_create_alias(&self, error: EntitleError) {
        *self.alias_error.lock().unwrap() = Some(error);
    }

    pub fn set_log_in_created(&self, created: bool) {
        self.log_in_created.store(created, Ordering::SeqCst);
    }

    // === Gate ===

    /// Block every subsequent call until [`MockBackend::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    // === Inspection ===

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }

    pub fn log_in_calls(&self) -> usize {
        self.log_in_calls.load(Ordering::SeqCst)
    }

    pub fn alias_calls(&self) -> usize {
        self.alias_calls.load(Ordering::SeqCst)
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Yield until at least `count` fetches have started.
    pub async fn wait_for_fetch_calls(&self, count: usize) {
        while self.fetch_calls() < count {
            tokio::task::yield_now().await;
        }
    }

    /// Yield until at least `count` posts have started.
    pub async fn wait_for_post_calls(&self, count: usize) {
        while self.post_calls() < count {
            tokio::task::yield_now().await;
        }
    }

    async fn pass_gate(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl EntitlementBackend for MockBackend {
    async fn fetch_customer_state(
        &self,
        app_user_id: &str,
        is_app_backgrounded: bool,
    ) -> EntitleResult<CustomerState> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.record(MockCall::FetchCustomerState {
            app_user_id: app_user_id.to_string(),
            is_app_backgrounded,
        });
        self.pass_gate().await;

        if let Some(result) = self.fetch_stubs.lock().unwrap().get(app_user_id) {
            return result.clone();
        }
        match self.fetch_default.lock().unwrap().clone() {
            Some(result) => result.map(|state| state.with_app_user_id(app_user_id)),
            None => Ok(fixtures::empty_customer_state(app_user_id)),
        }
    }

    async fn post_transaction(&self, params: &PurchaseParams) -> EntitleResult<CustomerState> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        self.record(MockCall::PostTransaction(params.clone()));
        self.pass_gate().await;

        match self.post_result.lock().unwrap().clone() {
            Some(result) => result,
            None => Ok(fixtures::customer_state_with_pro(&params.app_user_id)),
        }
    }

    async fn log_in(
        &self,
        current_app_user_id: &str,
        new_app_user_id: &str,
    ) -> EntitleResult<LogInResponse> {
        self.log_in_calls.fetch_add(1, Ordering::SeqCst);
        self.record(MockCall::LogIn {
            current_app_user_id: current_app_user_id.to_string(),
            new_app_user_id: new_app_user_id.to_string(),
        });
        self.pass_gate().await;

        if let Some(error) = self.log_in_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(LogInResponse {
            customer_state: fixtures::customer_state_with_pro(new_app_user_id),
            created: self.log_in_created.load(Ordering::SeqCst),
        })
    }

    async fn create_alias(
        &self,
        current_app_user_id: &str,
        new_app_user_id: &str,
    ) -> EntitleResult<()> {
        self.alias_calls.fetch_add(1, Ordering::SeqCst);
        self.record(MockCall::CreateAlias {
            current_app_user_id: current_app_user_id.to_string(),
            new_app_user_id: new_app_user_id.to_string(),
        });
        self.pass_gate().await;

        match self.alias_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// MOCK LIFECYCLE
// ============================================================================

/// [`AppLifecycle`] that counts how often it is consulted.
#[derive(Debug, Default)]
pub struct MockLifecycle {
    backgrounded: AtomicBool,
    queries: AtomicUsize,
}

impl MockLifecycle {
    pub fn new(backgrounded: bool) -> Self {
        Self {
            backgrounded: AtomicBool::new(backgrounded),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.backgrounded.store(backgrounded, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl AppLifecycle for MockLifecycle {
    fn is_app_backgrounded(&self) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.backgrounded.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use chrono::{TimeZone, Utc};

    /// 2999-01-01T00:00:00Z, a practically never-reached expiration.
    pub fn far_future() -> Timestamp {
        Utc.with_ymd_and_hms(2999, 1, 1, 0, 0, 0).unwrap()
    }

    /// 2024-01-15T10:00:00Z.
    pub fn purchase_date() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    /// A customer with nothing purchased.
    pub fn empty_customer_state(app_user_id: &str) -> CustomerState {
        CustomerState::new(app_user_id, Utc::now(), CustomerStatePayload::default())
    }

    /// The "pro" entitlement through `pro_monthly`, expiring 2999-01-01.
    pub fn pro_entitlement() -> EntitlementRecord {
        EntitlementRecord {
            product_identifier: "pro_monthly".to_string(),
            expires_at: Some(far_future()),
            purchased_at: purchase_date(),
            is_sandbox: true,
            period_type: PeriodType::Normal,
            store: Store::AppStore,
        }
    }

    /// A customer holding [`pro_entitlement`] and its subscription.
    pub fn customer_state_with_pro(app_user_id: &str) -> CustomerState {
        let mut payload = CustomerStatePayload {
            original_app_user_id: Some(app_user_id.to_string()),
            first_seen: Some(purchase_date()),
            ..Default::default()
        };
        payload
            .entitlements
            .insert("pro".to_string(), pro_entitlement());
        payload.subscriptions.insert(
            "pro_monthly".to_string(),
            SubscriptionRecord {
                expires_at: Some(far_future()),
                purchased_at: purchase_date(),
                original_purchase_at: Some(purchase_date()),
                is_sandbox: true,
                period_type: PeriodType::Normal,
                store: Store::AppStore,
                unsubscribe_detected_at: None,
                billing_issues_detected_at: None,
            },
        );
        CustomerState::new(app_user_id, Utc::now(), payload)
    }

    /// Raw backend body granting "pro" until 2999-01-01.
    pub fn pro_response_body() -> Vec<u8> {
        serde_json::json!({
            "request_date": "2024-06-01T12:00:00Z",
            "subscriber": {
                "entitlements": {
                    "pro": {
                        "product_identifier": "pro_monthly",
                        "expires_at": "2999-01-01T00:00:00Z",
                        "purchased_at": "2024-01-15T10:00:00Z"
                    }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    pub fn monthly_product() -> ProductInfo {
        let mut product = ProductInfo::new("pro_monthly", 4_990_000, "USD");
        product.subscription_group = Some("pro".to_string());
        product
    }

    /// A purchase of [`monthly_product`] by `app_user_id`.
    pub fn purchase_params(app_user_id: &str) -> PurchaseParams {
        PurchaseParams::new(
            app_user_id,
            TransactionDescriptor::new(b"receipt-data".to_vec()).with_product(monthly_product()),
        )
    }

    /// Config with the given foreground and background staleness in seconds.
    pub fn config_with_staleness(foreground_secs: u64, background_secs: u64) -> SyncConfig {
        SyncConfig {
            foreground_staleness: std::time::Duration::from_secs(foreground_secs),
            background_staleness: std::time::Duration::from_secs(background_secs),
            ..SyncConfig::default()
        }
    }

    pub fn malformed_response() -> EntitleError {
        ResponseError::Malformed {
            reason: "expected value at line 1 column 1".to_string(),
        }
        .into()
    }

    pub fn server_error() -> EntitleError {
        BackendError::from_status(500, None, "internal error").into()
    }

    pub fn offline() -> EntitleError {
        NetworkError::Unreachable {
            reason: "offline".to_string(),
        }
        .into()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating entitle types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a known (non-anonymous) app user id.
    pub fn arb_app_user_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,15}"
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    pub fn arb_product_info() -> impl Strategy<Value = ProductInfo> {
        (
            "[a-z_]{3,12}",
            0i64..100_000_000,
            prop::sample::select(vec!["USD", "EUR", "JPY"]),
            proptest::option::of("[a-z]{2,8}"),
        )
            .prop_map(|(id, price, currency, group)| {
                let mut product = ProductInfo::new(id, price, currency);
                product.subscription_group = group;
                product
            })
    }

    pub fn arb_transaction_descriptor() -> impl Strategy<Value = TransactionDescriptor> {
        (
            proptest::collection::vec(any::<u8>(), 1..32),
            any::<bool>(),
            proptest::option::of(arb_product_info()),
            proptest::option::of("[a-z]{3,10}"),
        )
            .prop_map(|(receipt, is_restore, product, offering)| {
                let mut descriptor = TransactionDescriptor::new(receipt).with_restore(is_restore);
                descriptor.product = product;
                descriptor.presented_offering_identifier = offering;
                descriptor
            })
    }

    pub fn arb_purchase_params() -> impl Strategy<Value = PurchaseParams> {
        (arb_app_user_id(), arb_transaction_descriptor())
            .prop_map(|(app_user_id, descriptor)| PurchaseParams::new(app_user_id, descriptor))
    }

    pub fn arb_entitlement_record() -> impl Strategy<Value = EntitlementRecord> {
        (
            "[a-z_]{3,12}",
            proptest::option::of(arb_timestamp()),
            arb_timestamp(),
            any::<bool>(),
        )
            .prop_map(|(product_identifier, expires_at, purchased_at, is_sandbox)| {
                EntitlementRecord {
                    product_identifier,
                    expires_at,
                    purchased_at,
                    is_sandbox,
                    period_type: PeriodType::Normal,
                    store: Store::AppStore,
                }
            })
    }

    /// Generate a customer state for `app_user_id` with up to four
    /// entitlements.
    pub fn arb_customer_state(app_user_id: String) -> impl Strategy<Value = CustomerState> {
        (
            proptest::collection::btree_map("[a-z]{2,8}", arb_entitlement_record(), 0..4),
            arb_timestamp(),
        )
            .prop_map(move |(entitlements, request_date)| {
                let payload = CustomerStatePayload {
                    entitlements,
                    ..Default::default()
                };
                CustomerState::new(app_user_id.clone(), request_date, payload)
            })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over synchronizer outcomes.

    use super::*;

    /// Assert that a synchronizer result is Ok and return the state.
    #[track_caller]
    pub fn assert_state(result: &Result<CustomerState, SyncFailure>) -> CustomerState {
        match result {
            Ok(state) => state.clone(),
            Err(failure) => panic!("Expected Ok, got Err: {:?}", failure),
        }
    }

    /// Assert that a synchronizer result is a cache miss.
    #[track_caller]
    pub fn assert_cache_miss(result: &Result<CustomerState, SyncFailure>) {
        match result {
            Err(SyncFailure {
                error: EntitleError::CacheMiss { .. },
                ..
            }) => {}
            other => panic!("Expected CacheMiss, got: {:?}", other),
        }
    }

    /// Assert that a synchronizer result is an identity error.
    #[track_caller]
    pub fn assert_identity_error<T: std::fmt::Debug>(result: &Result<T, SyncFailure>) {
        match result {
            Err(SyncFailure {
                error: EntitleError::Identity(_),
                ..
            }) => {}
            other => panic!("Expected Identity error, got: {:?}", other),
        }
    }

    /// Assert that `state` grants `entitlement` at `now`.
    #[track_caller]
    pub fn assert_entitlement_active(state: &CustomerState, entitlement: &str, now: Timestamp) {
        let record = state
            .entitlement(entitlement)
            .unwrap_or_else(|| panic!("Missing entitlement {entitlement}"));
        assert!(
            record.is_active_at(now),
            "Entitlement {entitlement} expired at {:?}",
            record.expires_at
        );
    }
}
