//! Customer state synchronization.
//!
//! Decides for every read whether the cached snapshot is served or a fetch is
//! needed, routes fetches and transaction posts through the coalescer, writes
//! successful results to the cache and notifies change observers.
//!
//! # Read path
//!
//! ```text
//! get_customer_state(owner, policy)
//!     │
//!     ├─► cache read (staleness for the current lifecycle state)
//!     │
//!     ├─► served from cache ──────────────────────────────► Ok(snapshot)
//!     │
//!     └─► fetch ─► coalescer (fingerprint = owner)
//!                     ├─► leader: backend fetch ─► cache ─► observers
//!                     └─► joined: wait for the leader's result
//! ```
//!
//! Cache writes are guarded by an ownership epoch and the current owner. An
//! identity change advances the epoch and names the new owner in one step, so
//! a fetch that started before the change, or one started afterwards for the
//! previous owner, delivers to its waiters but never writes the cache or
//! reaches observers.
//!
//! Observer notifications are queued under the same lock as the cache write
//! they belong to and delivered in queue order by one thread at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use entitle_core::{
    CacheFetchPolicy, Clock, CustomerState, EntitleError, PurchaseParams, RequestFingerprint,
    SyncConfig, SyncFailure,
};
use entitle_storage::{DeviceCache, Staleness};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::backend::{AppLifecycle, EntitlementBackend};
use crate::coalescer::Coalescer;

/// Outcome delivered to every caller of a synchronizer operation.
pub type SyncResult = Result<CustomerState, SyncFailure>;

/// Callback invoked with each changed customer state.
pub type ChangeObserver = Arc<dyn Fn(&CustomerState) + Send + Sync>;

struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(u64, ChangeObserver)>,
    last_sent: Option<CustomerState>,
    pending: VecDeque<CustomerState>,
    delivering: bool,
}

/// Who may write customer states to the cache.
#[derive(Debug, Default)]
struct Ownership {
    epoch: u64,
    current: Option<String>,
}

impl Ownership {
    /// A write for `owner` captured at `epoch` is admitted only if no identity
    /// change happened since and `owner` is still the current one.
    fn admits(&self, owner: &str, epoch: u64) -> bool {
        self.epoch == epoch && !matches!(&self.current, Some(current) if current != owner)
    }
}

struct SyncInner {
    backend: Arc<dyn EntitlementBackend>,
    cache: Arc<DeviceCache>,
    lifecycle: Arc<dyn AppLifecycle>,
    staleness: Staleness,
    background_jitter_max: Duration,
    fetches: Coalescer<RequestFingerprint, SyncResult>,
    posts: Coalescer<RequestFingerprint, SyncResult>,
    /// Serializes ownership checks with the cache writes they guard.
    ownership: Mutex<Ownership>,
    observers: Arc<Mutex<ObserverRegistry>>,
}

/// Customer state synchronizer. Clones share all state.
#[derive(Clone)]
pub struct CustomerStateSynchronizer {
    inner: Arc<SyncInner>,
}

impl std::fmt::Debug for CustomerStateSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomerStateSynchronizer")
            .field("staleness", &self.inner.staleness)
            .field("fetches", &self.inner.fetches)
            .field("posts", &self.inner.posts)
            .finish()
    }
}

impl CustomerStateSynchronizer {
    pub fn new(
        backend: Arc<dyn EntitlementBackend>,
        cache: Arc<DeviceCache>,
        lifecycle: Arc<dyn AppLifecycle>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                backend,
                cache,
                lifecycle,
                staleness: Staleness::from_config(config),
                background_jitter_max: config.background_jitter_max,
                fetches: Coalescer::new(),
                posts: Coalescer::new(),
                ownership: Mutex::new(Ownership::default()),
                observers: Arc::new(Mutex::new(ObserverRegistry {
                    next_id: 0,
                    observers: Vec::new(),
                    last_sent: None,
                    pending: VecDeque::new(),
                    delivering: false,
                })),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.inner.cache
    }

    pub fn staleness(&self) -> Staleness {
        self.inner.staleness
    }

    /// Customer state for `app_user_id` according to `policy`.
    pub async fn get_customer_state(&self, app_user_id: &str, policy: CacheFetchPolicy) -> SyncResult {
        let is_app_backgrounded = self.inner.lifecycle.is_app_backgrounded();
        let read = self.inner.cache.customer_states().read(
            app_user_id,
            &self.inner.staleness,
            is_app_backgrounded,
        );
        debug!(
            app_user_id = %app_user_id,
            policy = ?policy,
            hit = read.is_hit(),
            stale = read.is_stale(),
            "Customer state cache check"
        );

        match policy {
            CacheFetchPolicy::FromCacheOnly => read
                .into_value()
                .ok_or_else(|| SyncFailure::new(cache_miss(app_user_id))),
            CacheFetchPolicy::FetchNever => {
                if read.is_fresh_hit() {
                    read.into_value()
                        .ok_or_else(|| SyncFailure::new(cache_miss(app_user_id)))
                } else {
                    Err(SyncFailure::with_cached(
                        cache_miss(app_user_id),
                        read.into_value(),
                    ))
                }
            }
            CacheFetchPolicy::NotStaleCachedOrFetched => {
                if read.is_fresh_hit() {
                    if let Some(state) = read.into_value() {
                        return Ok(state);
                    }
                }
                self.fetch_and_cache(app_user_id, is_app_backgrounded).await
            }
            CacheFetchPolicy::CachedOrFetched => {
                let is_stale = read.is_stale();
                match read.into_value() {
                    Some(state) => {
                        if is_stale {
                            self.refresh_in_background(app_user_id, is_app_backgrounded);
                        }
                        Ok(state)
                    }
                    None => self.fetch_and_cache(app_user_id, is_app_backgrounded).await,
                }
            }
            CacheFetchPolicy::FetchCurrent => {
                self.fetch_and_cache(app_user_id, is_app_backgrounded).await
            }
        }
    }

    /// Fetch `app_user_id`'s state, joining an in-flight fetch for the same
    /// owner if there is one.
    pub async fn fetch_and_cache(&self, app_user_id: &str, is_app_backgrounded: bool) -> SyncResult {
        let key = RequestFingerprint::customer_state(app_user_id);
        let inner = self.inner.clone();
        let owner = app_user_id.to_string();
        self.inner
            .fetches
            .execute(key, move || inner.start_fetch(owner, is_app_backgrounded))
            .await
            .unwrap_or_else(|_| Err(SyncFailure::new(EntitleError::CallAbandoned)))
    }

    /// Start a coalesced fetch without waiting for it.
    pub fn refresh_in_background(&self, app_user_id: &str, is_app_backgrounded: bool) {
        let key = RequestFingerprint::customer_state(app_user_id);
        let inner = self.inner.clone();
        let owner = app_user_id.to_string();
        let registration = self.inner.fetches.submit(
            key,
            move || inner.start_fetch(owner, is_app_backgrounded),
            |_| {},
        );
        debug!(
            app_user_id = %app_user_id,
            leader = registration.is_leader(),
            "Background refresh requested"
        );
    }

    /// Post a transaction, coalescing identical concurrent posts.
    ///
    /// A successful post always replaces the owner's cached state. A failed
    /// post leaves the cache untouched.
    pub async fn post_purchase(&self, params: PurchaseParams) -> SyncResult {
        let key = params.fingerprint();
        let inner = self.inner.clone();
        self.inner
            .posts
            .execute(key, move || inner.start_post(params))
            .await
            .unwrap_or_else(|_| Err(SyncFailure::new(EntitleError::CallAbandoned)))
    }

    /// Cache `state` for its owner and notify observers if it changed.
    pub fn cache_customer_state(&self, state: CustomerState) {
        {
            let _ownership = lock(&self.inner.ownership);
            self.inner
                .cache
                .customer_states()
                .cache(&state.app_user_id, state.clone());
            self.inner.enqueue_if_changed(&state);
        }
        self.inner.deliver();
    }

    pub fn cached_customer_state(&self, app_user_id: &str) -> Option<CustomerState> {
        self.inner.cache.customer_states().get(app_user_id)
    }

    /// Push the cached state for `app_user_id`, if any, through the change
    /// filter. Returns whether observers were notified.
    pub fn send_cached_if_available(&self, app_user_id: &str) -> bool {
        let queued = {
            let _ownership = lock(&self.inner.ownership);
            match self.cached_customer_state(app_user_id) {
                Some(state) => self.inner.enqueue_if_changed(&state),
                None => false,
            }
        };
        self.inner.deliver();
        queued
    }

    /// Register `observer` for changed customer states.
    pub fn monitor_changes<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&CustomerState) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.observers);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push((id, Arc::new(observer)));
        debug!(observer_id = id, "Registered change observer");
        ObserverHandle {
            registry: Arc::downgrade(&self.inner.observers),
            id,
        }
    }

    /// Drop everything cached for `old_app_user_id` and make
    /// `new_app_user_id` the only owner allowed to write.
    ///
    /// Fetches and posts that are still running keep delivering to their
    /// waiters but can no longer write to the cache or notify observers.
    /// Notifications queued before the change are dropped.
    pub fn clear_for_identity_change(&self, old_app_user_id: &str, new_app_user_id: &str) {
        {
            let mut ownership = lock(&self.inner.ownership);
            ownership.epoch += 1;
            ownership.current = Some(new_app_user_id.to_string());
            self.inner.cache.clear_caches(old_app_user_id, new_app_user_id);
            let mut registry = lock(&self.inner.observers);
            registry.last_sent = None;
            registry.pending.clear();
        }
        self.inner
            .fetches
            .invalidate(&RequestFingerprint::customer_state(old_app_user_id));
    }

    /// Record `app_user_id` as the owner allowed to write, without touching
    /// any cache. Used when an identity is established rather than changed.
    pub fn set_current_owner(&self, app_user_id: &str) {
        lock(&self.inner.ownership).current = Some(app_user_id.to_string());
    }

    /// Whether a fetch for `app_user_id` is currently running.
    pub fn is_fetching(&self, app_user_id: &str) -> bool {
        self.inner
            .fetches
            .is_in_flight(&RequestFingerprint::customer_state(app_user_id))
    }
}

impl SyncInner {
    /// Leader-side setup of a fetch. Runs synchronously at registration so the
    /// epoch and refresh guard are in place before any other caller can look
    /// at the cache.
    fn start_fetch(
        self: Arc<Self>,
        owner: String,
        is_app_backgrounded: bool,
    ) -> impl std::future::Future<Output = SyncResult> + Send + 'static {
        let epoch = self.epoch();
        self.cache.customer_states().touch(&owner);
        async move { self.run_fetch(owner, epoch, is_app_backgrounded).await }
    }

    async fn run_fetch(&self, owner: String, epoch: u64, is_app_backgrounded: bool) -> SyncResult {
        if is_app_backgrounded {
            self.background_delay().await;
        }

        info!(app_user_id = %owner, is_app_backgrounded, "Fetching customer state");
        match self
            .backend
            .fetch_customer_state(&owner, is_app_backgrounded)
            .await
        {
            Ok(state) => {
                if !self.cache_if_current(&owner, epoch, &state) {
                    debug!(app_user_id = %owner, "Owner replaced during fetch, result not cached");
                }
                Ok(state)
            }
            Err(error) => {
                let customer_states = self.cache.customer_states();
                customer_states.clear_timestamp_only(&owner);
                let cached = if error.serves_stale_fallback() {
                    customer_states.get(&owner)
                } else {
                    None
                };
                warn!(
                    app_user_id = %owner,
                    error = %error,
                    stale_fallback = cached.is_some(),
                    "Customer state fetch failed"
                );
                Err(SyncFailure::with_cached(error, cached))
            }
        }
    }

    fn start_post(
        self: Arc<Self>,
        params: PurchaseParams,
    ) -> impl std::future::Future<Output = SyncResult> + Send + 'static {
        let epoch = self.epoch();
        async move { self.run_post(params, epoch).await }
    }

    async fn run_post(&self, params: PurchaseParams, epoch: u64) -> SyncResult {
        let owner = params.app_user_id.as_str();
        info!(
            app_user_id = %owner,
            is_restore = params.descriptor.is_restore,
            "Posting transaction"
        );
        match self.backend.post_transaction(&params).await {
            Ok(state) => {
                if !self.cache_if_current(owner, epoch, &state) {
                    debug!(app_user_id = %owner, "Owner replaced during post, result not cached");
                }
                Ok(state)
            }
            Err(error) => {
                warn!(
                    app_user_id = %owner,
                    error = %error,
                    finishable = error.is_finishable(),
                    "Transaction post failed"
                );
                Err(SyncFailure::new(error))
            }
        }
    }

    async fn background_delay(&self) {
        let max_ms = self.background_jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let delay_ms = rand::rng().random_range(0..=max_ms);
        debug!(delay_ms, "Delaying background fetch");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    fn epoch(&self) -> u64 {
        lock(&self.ownership).epoch
    }

    /// Cache `state` and notify observers, if `owner` captured at `epoch` may
    /// still write.
    fn cache_if_current(&self, owner: &str, epoch: u64, state: &CustomerState) -> bool {
        {
            let ownership = lock(&self.ownership);
            if !ownership.admits(owner, epoch) {
                return false;
            }
            self.cache.customer_states().cache(owner, state.clone());
            self.enqueue_if_changed(state);
        }
        self.deliver();
        true
    }

    /// Queue `state` for observers unless it is content-equal to the last one
    /// queued. Callers hold the ownership lock.
    fn enqueue_if_changed(&self, state: &CustomerState) -> bool {
        let mut registry = lock(&self.observers);
        if registry.last_sent.as_ref() == Some(state) {
            debug!(app_user_id = %state.app_user_id, "Customer state unchanged");
            return false;
        }
        registry.last_sent = Some(state.clone());
        registry.pending.push_back(state.clone());
        true
    }

    /// Deliver queued states in order, outside every lock.
    ///
    /// If another thread is already delivering this returns at once and that
    /// thread picks up the new entries. An observer that causes a further
    /// notification sees it after it returns.
    fn deliver(&self) {
        let mut guard = {
            let mut registry = lock(&self.observers);
            if registry.delivering {
                return;
            }
            registry.delivering = true;
            DeliveryGuard {
                registry: &self.observers,
                armed: true,
            }
        };
        loop {
            let (state, observers) = {
                let mut registry = lock(&self.observers);
                match registry.pending.pop_front() {
                    Some(state) => {
                        let observers: Vec<ChangeObserver> = registry
                            .observers
                            .iter()
                            .map(|(_, observer)| observer.clone())
                            .collect();
                        (state, observers)
                    }
                    None => {
                        registry.delivering = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            debug!(
                app_user_id = %state.app_user_id,
                observers = observers.len(),
                "Customer state changed"
            );
            for observer in observers {
                observer(&state);
            }
        }
    }
}

/// Releases the delivery role if an observer panics.
struct DeliveryGuard<'a> {
    registry: &'a Mutex<ObserverRegistry>,
    armed: bool,
}

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.registry).delivering = false;
        }
    }
}

/// Keeps a change observer registered. Dropping it unregisters the observer.
#[derive(Debug)]
pub struct ObserverHandle {
    registry: Weak<Mutex<ObserverRegistry>>,
    id: u64,
}

impl ObserverHandle {
    pub fn remove(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry)
                .observers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

fn cache_miss(app_user_id: &str) -> EntitleError {
    EntitleError::CacheMiss {
        app_user_id: app_user_id.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LogInResponse, StaticLifecycle};
    use async_trait::async_trait;
    use chrono::Utc;
    use entitle_core::{
        CustomerStatePayload, EntitleResult, EntitlementRecord, ManualClock, ResponseError,
        TransactionDescriptor,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingBackend {
        fetches: AtomicUsize,
        posts: AtomicUsize,
        fail_with: Mutex<Option<EntitleError>>,
        entitlement: Mutex<Option<String>>,
    }

    impl CountingBackend {
        fn state_for(&self, owner: &str) -> CustomerState {
            let mut payload = CustomerStatePayload::default();
            if let Some(id) = self.entitlement.lock().unwrap().clone() {
                payload.entitlements.insert(
                    id,
                    EntitlementRecord {
                        product_identifier: "monthly".to_string(),
                        expires_at: None,
                        purchased_at: Utc::now(),
                        is_sandbox: true,
                        period_type: Default::default(),
                        store: Default::default(),
                    },
                );
            }
            CustomerState::new(owner, Utc::now(), payload)
        }

        fn result_for(&self, owner: &str) -> EntitleResult<CustomerState> {
            match self.fail_with.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(self.state_for(owner)),
            }
        }
    }

    #[async_trait]
    impl EntitlementBackend for CountingBackend {
        async fn fetch_customer_state(&self, app_user_id: &str, _bg: bool) -> EntitleResult<CustomerState> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.result_for(app_user_id)
        }

        async fn post_transaction(&self, params: &PurchaseParams) -> EntitleResult<CustomerState> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            self.result_for(&params.app_user_id)
        }

        async fn log_in(&self, _current: &str, new: &str) -> EntitleResult<LogInResponse> {
            Ok(LogInResponse {
                customer_state: self.state_for(new),
                created: false,
            })
        }

        async fn create_alias(&self, _current: &str, _new: &str) -> EntitleResult<()> {
            Ok(())
        }
    }

    fn setup() -> (CustomerStateSynchronizer, Arc<CountingBackend>, Arc<ManualClock>) {
        let backend = Arc::new(CountingBackend::default());
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(DeviceCache::in_memory(clock.clone()));
        let sync = CustomerStateSynchronizer::new(
            backend.clone(),
            cache,
            Arc::new(StaticLifecycle::default()),
            &SyncConfig::default(),
        );
        (sync, backend, clock)
    }

    #[tokio::test]
    async fn test_from_cache_only_never_fetches() {
        let (sync, backend, _clock) = setup();
        let err = sync
            .get_customer_state("u1", CacheFetchPolicy::FromCacheOnly)
            .await
            .unwrap_err();
        assert!(matches!(err.error, EntitleError::CacheMiss { .. }));
        assert!(err.cached.is_none());
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_never_returns_stale_value_as_fallback() {
        let (sync, backend, clock) = setup();
        sync.cache_customer_state(backend.state_for("u1"));
        clock.advance(Duration::from_secs(301));

        let err = sync
            .get_customer_state("u1", CacheFetchPolicy::FetchNever)
            .await
            .unwrap_err();
        assert!(matches!(err.error, EntitleError::CacheMiss { .. }));
        assert!(err.cached.is_some());
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_stale_policy_serves_fresh_cache() {
        let (sync, backend, _clock) = setup();
        sync.get_customer_state("u1", CacheFetchPolicy::NotStaleCachedOrFetched)
            .await
            .unwrap();
        sync.get_customer_state("u1", CacheFetchPolicy::NotStaleCachedOrFetched)
            .await
            .unwrap();
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_current_always_fetches() {
        let (sync, backend, _clock) = setup();
        for _ in 0..3 {
            sync.get_customer_state("u1", CacheFetchPolicy::FetchCurrent)
                .await
                .unwrap();
        }
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_serves_stale_fallback() {
        let (sync, backend, _clock) = setup();
        sync.cache_customer_state(backend.state_for("u1"));
        *backend.fail_with.lock().unwrap() = Some(
            ResponseError::Malformed {
                reason: "truncated".to_string(),
            }
            .into(),
        );

        let err = sync
            .get_customer_state("u1", CacheFetchPolicy::FetchCurrent)
            .await
            .unwrap_err();
        assert!(err.cached.is_some());
        assert!(!err.is_finishable());
        assert!(sync.cache().customer_states().last_updated("u1").is_none());
    }

    #[tokio::test]
    async fn test_network_error_has_no_fallback() {
        let (sync, backend, _clock) = setup();
        sync.cache_customer_state(backend.state_for("u1"));
        *backend.fail_with.lock().unwrap() = Some(
            entitle_core::NetworkError::Timeout { elapsed_ms: 30_000 }.into(),
        );

        let err = sync
            .get_customer_state("u1", CacheFetchPolicy::FetchCurrent)
            .await
            .unwrap_err();
        assert!(err.error.is_network());
        assert!(err.cached.is_none());
        assert!(sync.cached_customer_state("u1").is_some());
    }

    #[tokio::test]
    async fn test_failed_post_leaves_cache_alone() {
        let (sync, backend, _clock) = setup();
        let before = backend.state_for("u1");
        sync.cache_customer_state(before.clone());
        *backend.fail_with.lock().unwrap() =
            Some(entitle_core::BackendError::from_status(422, Some(7226), "bad receipt").into());

        let params = PurchaseParams::new("u1", TransactionDescriptor::new(b"receipt".to_vec()));
        let err = sync.post_purchase(params).await.unwrap_err();
        assert!(err.is_finishable());
        assert!(sync.cache().customer_states().last_updated("u1").is_some());
        assert_eq!(backend.posts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_observers_skip_unchanged_states() {
        let (sync, backend, _clock) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _handle = sync.monitor_changes(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sync.get_customer_state("u1", CacheFetchPolicy::FetchCurrent).await.unwrap();
        sync.get_customer_state("u1", CacheFetchPolicy::FetchCurrent).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        *backend.entitlement.lock().unwrap() = Some("pro".to_string());
        sync.get_customer_state("u1", CacheFetchPolicy::FetchCurrent).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_unregisters_observer() {
        let (sync, backend, _clock) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = sync.monitor_changes(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.remove();

        sync.cache_customer_state(backend.state_for("u1"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identity_clear_resets_change_filter() {
        let (sync, backend, _clock) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _handle = sync.monitor_changes(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sync.cache_customer_state(backend.state_for("a"));
        sync.clear_for_identity_change("a", "b");
        assert!(sync.cached_customer_state("a").is_none());
        assert_eq!(sync.cache().cached_app_user_id().as_deref(), Some("b"));

        sync.cache_customer_state(backend.state_for("b"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_for_replaced_owner_is_not_cached_or_sent() {
        let (sync, backend, _clock) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _handle = sync.monitor_changes(move |state| {
            log.lock().unwrap().push(state.app_user_id.clone());
        });
        sync.set_current_owner("a");
        sync.clear_for_identity_change("a", "b");

        // A caller that read "a" just before the switch starts its fetch now.
        let state = sync
            .get_customer_state("a", CacheFetchPolicy::FetchCurrent)
            .await
            .unwrap();
        assert_eq!(state.app_user_id, "a");
        assert!(sync.cached_customer_state("a").is_none());
        assert!(seen.lock().unwrap().is_empty());

        sync.get_customer_state("b", CacheFetchPolicy::FetchCurrent)
            .await
            .unwrap();
        assert!(sync.cached_customer_state("b").is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["b".to_string()]);
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_write_from_earlier_epoch_is_dropped() {
        let (sync, backend, _clock) = setup();
        sync.set_current_owner("a");
        let epoch = sync.inner.epoch();

        // Logging in again as the same owner still starts a new epoch.
        sync.clear_for_identity_change("a", "a");

        assert!(!sync.inner.cache_if_current("a", epoch, &backend.state_for("a")));
        assert!(sync.cached_customer_state("a").is_none());
        assert!(sync
            .inner
            .cache_if_current("a", sync.inner.epoch(), &backend.state_for("a")));
        assert!(sync.cached_customer_state("a").is_some());
    }

    #[tokio::test]
    async fn test_observer_triggered_notifications_stay_ordered() {
        let (sync, backend, _clock) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let nested_sync = sync.clone();
        let nested = backend.state_for("b");
        let _handle = sync.monitor_changes(move |state| {
            log.lock().unwrap().push(state.app_user_id.clone());
            if state.app_user_id == "a" {
                nested_sync.cache_customer_state(nested.clone());
                log.lock().unwrap().push("after nested".to_string());
            }
        });

        sync.cache_customer_state(backend.state_for("a"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a".to_string(), "after nested".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_cached_if_available() {
        let (sync, backend, _clock) = setup();
        assert!(!sync.send_cached_if_available("u1"));
        sync.cache().customer_states().cache("u1", backend.state_for("u1"));
        assert!(sync.send_cached_if_available("u1"));
        assert!(!sync.send_cached_if_available("u1"));
    }
}
