//! Entitle Sync - Synchronization Engine
//!
//! Coalesces concurrent backend calls, serves customer state from the
//! staleness-aware cache and drives identity transitions:
//! - [`Coalescer`]: at most one in-flight call per request fingerprint
//! - [`CustomerStateSynchronizer`]: cache-or-fetch decisions and cache writes
//! - [`IdentityManager`]: serialized identity transitions
//! - [`Engine`]: the explicitly constructed facade wiring them together

pub mod backend;
pub mod coalescer;
pub mod engine;
pub mod identity;
pub mod synchronizer;
pub mod telemetry;

pub use backend::{AppLifecycle, EntitlementBackend, LogInResponse, StaticLifecycle};
pub use coalescer::{CallAbandoned, CallId, Coalescer, Completion, Registration};
pub use engine::{Engine, EngineBuilder};
pub use identity::{IdentityManager, LogInOutcome};
pub use synchronizer::{ChangeObserver, CustomerStateSynchronizer, ObserverHandle, SyncResult};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
