//! Engine facade: one explicitly constructed instance wiring the cache, the
//! synchronizer and the identity manager to their collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use entitle_core::{
    AnonymousIdFormat, CacheFetchPolicy, Clock, ConfigError, CustomerState, EntitleError,
    EntitleResult, IdentityError, IdentityState, PurchaseParams, StorageError, SyncConfig,
    SyncFailure, SystemClock, TransactionDescriptor,
};
use entitle_storage::{DeviceCache, InMemoryStore, KeyValueStore, LmdbStore};
use tracing::{debug, info};

use crate::backend::{AppLifecycle, EntitlementBackend, StaticLifecycle};
use crate::identity::{IdentityManager, LogInOutcome};
use crate::synchronizer::{CustomerStateSynchronizer, ObserverHandle, SyncResult};

/// Where the engine keeps its durable state.
#[derive(Debug, Clone, Default)]
enum StoreChoice {
    #[default]
    InMemory,
    Lmdb(PathBuf),
    Custom(Arc<dyn KeyValueStore>),
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    backend: Option<Arc<dyn EntitlementBackend>>,
    store: StoreChoice,
    clock: Option<Arc<dyn Clock>>,
    lifecycle: Option<Arc<dyn AppLifecycle>>,
    config: Option<SyncConfig>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn EntitlementBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = StoreChoice::Custom(store);
        self
    }

    /// Persist to an LMDB environment at `path`, sized by
    /// `SyncConfig::lmdb_map_size_mb`.
    pub fn with_lmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = StoreChoice::Lmdb(path.into());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn AppLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> EntitleResult<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let backend = self.backend.ok_or_else(|| ConfigError::InvalidValue {
            field: "backend".to_string(),
            value: "none".to_string(),
            reason: "an entitlement backend is required".to_string(),
        })?;
        let store: Arc<dyn KeyValueStore> = match self.store {
            StoreChoice::InMemory => Arc::new(InMemoryStore::new()),
            StoreChoice::Lmdb(path) => Arc::new(
                LmdbStore::open(&path, config.lmdb_map_size_mb)
                    .map_err(StorageError::from)?,
            ),
            StoreChoice::Custom(store) => store,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let lifecycle = self
            .lifecycle
            .unwrap_or_else(|| Arc::new(StaticLifecycle::default()));
        let format = AnonymousIdFormat::new(&config.anonymous_id_prefix)?;

        let cache = Arc::new(DeviceCache::new(store, clock.clone()));
        let synchronizer =
            CustomerStateSynchronizer::new(backend.clone(), cache, lifecycle.clone(), &config);
        let identity = IdentityManager::new(synchronizer.clone(), backend, format);

        debug!(config = ?config, "Engine built");
        Ok(Engine {
            synchronizer,
            identity,
            lifecycle,
            clock,
            config,
        })
    }
}

/// The entitlement synchronization engine.
///
/// Customer state operations act on the current identity and fail with
/// `IdentityError::NotConfigured` until [`Engine::configure`] has run.
pub struct Engine {
    synchronizer: CustomerStateSynchronizer,
    identity: IdentityManager,
    lifecycle: Arc<dyn AppLifecycle>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &CustomerStateSynchronizer {
        &self.synchronizer
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn current_app_user_id(&self) -> Option<String> {
        self.identity.current_app_user_id()
    }

    /// Establish the identity, replay any cached state to observers and
    /// refresh it if stale.
    pub async fn configure(&self, app_user_id: Option<&str>) -> (IdentityState, SyncResult) {
        let identity = self.identity.configure(app_user_id).await;
        self.synchronizer.send_cached_if_available(&identity.app_user_id);
        let result = self
            .synchronizer
            .get_customer_state(&identity.app_user_id, CacheFetchPolicy::NotStaleCachedOrFetched)
            .await;
        (identity, result)
    }

    pub async fn get_customer_state(&self, policy: CacheFetchPolicy) -> SyncResult {
        let app_user_id = self.require_app_user_id()?;
        self.synchronizer.get_customer_state(&app_user_id, policy).await
    }

    /// Post a transaction on behalf of the current user.
    pub async fn post_purchase(&self, descriptor: TransactionDescriptor) -> SyncResult {
        let app_user_id = self.require_app_user_id()?;
        self.synchronizer
            .post_purchase(PurchaseParams::new(app_user_id, descriptor))
            .await
    }

    /// Refresh the current user's state if it is stale.
    pub async fn on_app_foregrounded(&self) -> SyncResult {
        let app_user_id = self.require_app_user_id()?;
        info!(app_user_id = %app_user_id, "App foregrounded");
        self.synchronizer
            .get_customer_state(&app_user_id, CacheFetchPolicy::NotStaleCachedOrFetched)
            .await
    }

    pub async fn log_in(&self, app_user_id: &str) -> Result<LogInOutcome, SyncFailure> {
        self.identity.log_in(app_user_id).await
    }

    pub async fn log_out(&self) -> SyncResult {
        self.identity.log_out().await
    }

    pub async fn create_alias(&self, app_user_id: &str) -> SyncResult {
        self.identity.create_alias(app_user_id).await
    }

    pub async fn reset(&self) -> SyncResult {
        self.identity.reset().await
    }

    /// Offerings cached for the current user, if any.
    pub fn cached_offerings(&self) -> Option<serde_json::Value> {
        let app_user_id = self.identity.current_app_user_id()?;
        self.synchronizer.cache().offerings().get(&app_user_id)
    }

    pub fn cache_offerings(&self, offerings: serde_json::Value) -> EntitleResult<()> {
        let app_user_id = self
            .identity
            .current_app_user_id()
            .ok_or(EntitleError::Identity(IdentityError::NotConfigured))?;
        self.synchronizer.cache().offerings().cache(&app_user_id, offerings);
        Ok(())
    }

    /// Whether cached offerings for the current user need refreshing.
    pub fn offerings_are_stale(&self) -> bool {
        match self.identity.current_app_user_id() {
            Some(app_user_id) => {
                let max_age = self
                    .config
                    .staleness_for(self.lifecycle.is_app_backgrounded(), false);
                self.synchronizer.cache().offerings().is_stale(&app_user_id, max_age)
            }
            None => true,
        }
    }

    pub fn monitor_changes<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&CustomerState) + Send + Sync + 'static,
    {
        self.synchronizer.monitor_changes(observer)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn require_app_user_id(&self) -> Result<String, SyncFailure> {
        self.identity
            .current_app_user_id()
            .ok_or_else(|| SyncFailure::new(IdentityError::NotConfigured))
    }
}
