//! Entitle Core - Data Types
//!
//! Customer state snapshots, request fingerprints, identity helpers, fetch
//! policies, configuration and the error taxonomy shared by every other crate.
//! No I/O lives here.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod customer;
pub mod error;
pub mod fingerprint;
pub mod identity;
pub mod policy;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, DEFAULT_ANONYMOUS_ID_PREFIX, MAX_LMDB_MAP_SIZE_MB};
pub use customer::{
    CustomerState, CustomerStatePayload, CustomerStateResponse, EntitlementRecord, PeriodType,
    Store, SubscriptionRecord, COMPATIBLE_SCHEMA_VERSIONS, CURRENT_SCHEMA_VERSION,
};
pub use error::{
    BackendError, ConfigError, EntitleError, EntitleResult, IdentityError, NetworkError,
    ResponseError, StorageError, SyncFailure,
};
pub use fingerprint::{
    DiscountInfo, PaymentMode, ProductInfo, PurchaseParams, RequestFingerprint,
    TransactionDescriptor,
};
pub use identity::{normalize_app_user_id, AnonymousIdFormat, IdentityState};
pub use policy::CacheFetchPolicy;
