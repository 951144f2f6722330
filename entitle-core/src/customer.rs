//! Customer state snapshots

use crate::{ResponseError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written into newly persisted snapshots.
pub const CURRENT_SCHEMA_VERSION: &str = "3";

/// Schema versions that can still be decoded from durable storage.
pub const COMPATIBLE_SCHEMA_VERSIONS: &[&str] = &["2", "3"];

/// Billing period an entitlement or subscription is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    #[default]
    Normal,
    Intro,
    Trial,
}

/// Store a purchase was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Store {
    AppStore,
    MacAppStore,
    PlayStore,
    Stripe,
    Promotional,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A single entitlement granted to the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub product_identifier: String,
    /// `None` means the entitlement never expires (lifetime purchase).
    pub expires_at: Option<Timestamp>,
    pub purchased_at: Timestamp,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default)]
    pub period_type: PeriodType,
    #[serde(default)]
    pub store: Store,
}

impl EntitlementRecord {
    /// Whether the entitlement is active at `now`.
    pub fn is_active_at(&self, now: Timestamp) -> bool {
        !matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// A subscription product the customer has purchased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub expires_at: Option<Timestamp>,
    pub purchased_at: Timestamp,
    #[serde(default)]
    pub original_purchase_at: Option<Timestamp>,
    #[serde(default)]
    pub is_sandbox: bool,
    #[serde(default)]
    pub period_type: PeriodType,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub unsubscribe_detected_at: Option<Timestamp>,
    #[serde(default)]
    pub billing_issues_detected_at: Option<Timestamp>,
}

impl SubscriptionRecord {
    pub fn is_active_at(&self, now: Timestamp) -> bool {
        !matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Decoded subscriber body of a backend response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomerStatePayload {
    #[serde(default)]
    pub original_app_user_id: Option<String>,
    #[serde(default)]
    pub first_seen: Option<Timestamp>,
    #[serde(default)]
    pub management_url: Option<String>,
    #[serde(default)]
    pub entitlements: BTreeMap<String, EntitlementRecord>,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, SubscriptionRecord>,
}

/// Response shape of a customer state fetch or a transaction post.
///
/// Decoded once at the network boundary; everything past it works with
/// [`CustomerState`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomerStateResponse {
    #[serde(default)]
    pub request_date: Option<Timestamp>,
    #[serde(default)]
    pub subscriber: Option<CustomerStatePayload>,
}

impl CustomerStateResponse {
    /// Decode a raw response body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResponseError> {
        serde_json::from_slice(bytes).map_err(|e| ResponseError::Malformed {
            reason: e.to_string(),
        })
    }
}

/// Immutable snapshot of a customer's entitlements and subscriptions.
///
/// Equality is content-based: two snapshots are equal when their entitlement
/// and subscription maps are equal, whatever their request dates or owners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerState {
    pub app_user_id: String,
    /// Server-reported computation time, or the local clock when absent.
    pub request_date: Timestamp,
    pub payload: CustomerStatePayload,
    pub schema_version: String,
}

/// Header probed before decoding a persisted snapshot.
#[derive(Deserialize)]
struct SchemaProbe {
    #[serde(default)]
    schema_version: Option<String>,
}

impl CustomerState {
    pub fn new(app_user_id: impl Into<String>, request_date: Timestamp, payload: CustomerStatePayload) -> Self {
        Self {
            app_user_id: app_user_id.into(),
            request_date,
            payload,
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        }
    }

    /// Build a snapshot from a decoded backend response.
    ///
    /// `fallback_now` is used as the request date when the server omits it.
    pub fn from_response(
        app_user_id: impl Into<String>,
        response: CustomerStateResponse,
        fallback_now: Timestamp,
    ) -> Result<Self, ResponseError> {
        let payload = response.subscriber.ok_or_else(|| ResponseError::MissingField {
            field: "subscriber".to_string(),
        })?;
        Ok(Self::new(
            app_user_id,
            response.request_date.unwrap_or(fallback_now),
            payload,
        ))
    }

    /// Serialize for durable storage.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode persisted bytes, rejecting incompatible schema versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, ResponseError> {
        let probe: SchemaProbe = serde_json::from_slice(bytes).map_err(|e| ResponseError::Malformed {
            reason: e.to_string(),
        })?;
        match probe.schema_version.as_deref() {
            Some(version) if COMPATIBLE_SCHEMA_VERSIONS.contains(&version) => {}
            _ => {
                return Err(ResponseError::IncompatibleSchema {
                    found: probe.schema_version,
                })
            }
        }
        serde_json::from_slice(bytes).map_err(|e| ResponseError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Copy with a different request date.
    pub fn with_request_date(mut self, request_date: Timestamp) -> Self {
        self.request_date = request_date;
        self
    }

    /// Copy owned by a different app user id.
    pub fn with_app_user_id(mut self, app_user_id: impl Into<String>) -> Self {
        self.app_user_id = app_user_id.into();
        self
    }

    pub fn entitlement(&self, identifier: &str) -> Option<&EntitlementRecord> {
        self.payload.entitlements.get(identifier)
    }

    pub fn entitlements(&self) -> &BTreeMap<String, EntitlementRecord> {
        &self.payload.entitlements
    }

    pub fn subscriptions(&self) -> &BTreeMap<String, SubscriptionRecord> {
        &self.payload.subscriptions
    }

    /// Identifiers of entitlements active at `now`.
    pub fn active_entitlements(&self, now: Timestamp) -> impl Iterator<Item = &str> {
        self.payload
            .entitlements
            .iter()
            .filter(move |(_, record)| record.is_active_at(now))
            .map(|(id, _)| id.as_str())
    }

    /// Product identifiers of subscriptions active at `now`.
    pub fn active_subscriptions(&self, now: Timestamp) -> impl Iterator<Item = &str> {
        self.payload
            .subscriptions
            .iter()
            .filter(move |(_, record)| record.is_active_at(now))
            .map(|(id, _)| id.as_str())
    }

    /// Whether any entitlement or subscription was purchased in a sandbox
    /// environment.
    pub fn is_sandbox(&self) -> bool {
        self.payload.entitlements.values().any(|record| record.is_sandbox)
            || self.payload.subscriptions.values().any(|record| record.is_sandbox)
    }

    /// Latest expiration across all subscriptions.
    pub fn latest_expiration(&self) -> Option<Timestamp> {
        self.payload
            .subscriptions
            .values()
            .filter_map(|record| record.expires_at)
            .max()
    }
}

impl PartialEq for CustomerState {
    fn eq(&self, other: &Self) -> bool {
        self.payload.entitlements == other.payload.entitlements
            && self.payload.subscriptions == other.payload.subscriptions
    }
}

impl Eq for CustomerState {}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ts(year: i32) -> Timestamp {
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap()
    }

    fn pro_payload(expires: Option<Timestamp>) -> CustomerStatePayload {
        let mut payload = CustomerStatePayload::default();
        payload.entitlements.insert(
            "pro".to_string(),
            EntitlementRecord {
                product_identifier: "monthly".to_string(),
                expires_at: expires,
                purchased_at: ts(2020),
                is_sandbox: false,
                period_type: PeriodType::Normal,
                store: Store::AppStore,
            },
        );
        payload.subscriptions.insert(
            "monthly".to_string(),
            SubscriptionRecord {
                expires_at: expires,
                purchased_at: ts(2020),
                original_purchase_at: None,
                is_sandbox: false,
                period_type: PeriodType::Normal,
                store: Store::AppStore,
                unsubscribe_detected_at: None,
                billing_issues_detected_at: None,
            },
        );
        payload
    }

    #[test]
    fn test_is_sandbox_from_any_record() {
        let mut payload = pro_payload(Some(ts(2999)));
        assert!(!CustomerState::new("u1", ts(2021), payload.clone()).is_sandbox());

        if let Some(subscription) = payload.subscriptions.get_mut("monthly") {
            subscription.is_sandbox = true;
        }
        assert!(CustomerState::new("u1", ts(2021), payload).is_sandbox());
        assert!(!CustomerState::new("u1", ts(2021), CustomerStatePayload::default()).is_sandbox());
    }

    #[test]
    fn test_equality_ignores_request_date() {
        let a = CustomerState::new("u1", ts(2021), pro_payload(Some(ts(2999))));
        let b = a.clone().with_request_date(ts(2022));
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_detects_entitlement_change() {
        let a = CustomerState::new("u1", ts(2021), pro_payload(Some(ts(2999))));
        let b = CustomerState::new("u1", ts(2021), pro_payload(Some(ts(2998))));
        assert_ne!(a, b);
    }

    #[test]
    fn test_equality_ignores_management_url() {
        let a = CustomerState::new("u1", ts(2021), pro_payload(None));
        let mut payload = pro_payload(None);
        payload.management_url = Some("https://example.com/manage".to_string());
        let b = CustomerState::new("u1", ts(2021), payload);
        assert_eq!(a, b);
    }

    #[test]
    fn test_entitlement_activity() {
        let now = ts(2025);
        let state = CustomerState::new("u1", now, pro_payload(Some(ts(2999))));
        assert!(state.entitlement("pro").unwrap().is_active_at(now));
        assert_eq!(state.active_entitlements(now).collect::<Vec<_>>(), vec!["pro"]);
        assert_eq!(state.active_subscriptions(now).collect::<Vec<_>>(), vec!["monthly"]);

        let expired = CustomerState::new("u1", now, pro_payload(Some(now - Duration::seconds(1))));
        assert_eq!(expired.active_entitlements(now).count(), 0);

        let lifetime = CustomerState::new("u1", now, pro_payload(None));
        assert!(lifetime.entitlement("pro").unwrap().is_active_at(ts(3000)));
    }

    #[test]
    fn test_from_response_uses_fallback_date() {
        let response = CustomerStateResponse {
            request_date: None,
            subscriber: Some(pro_payload(None)),
        };
        let state = CustomerState::from_response("u1", response, ts(2024)).unwrap();
        assert_eq!(state.request_date, ts(2024));
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_from_response_prefers_server_date() {
        let response = CustomerStateResponse {
            request_date: Some(ts(2023)),
            subscriber: Some(pro_payload(None)),
        };
        let state = CustomerState::from_response("u1", response, ts(2024)).unwrap();
        assert_eq!(state.request_date, ts(2023));
    }

    #[test]
    fn test_from_response_requires_subscriber() {
        let response = CustomerStateResponse::default();
        let err = CustomerState::from_response("u1", response, ts(2024)).unwrap_err();
        assert!(matches!(err, ResponseError::MissingField { .. }));
    }

    #[test]
    fn test_response_from_bytes_malformed() {
        let err = CustomerStateResponse::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, ResponseError::Malformed { .. }));
    }

    #[test]
    fn test_encode_decode_keeps_content() {
        let state = CustomerState::new("u1", ts(2021), pro_payload(Some(ts(2999))));
        let bytes = state.encode().unwrap();
        let decoded = CustomerState::decode(&bytes).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.app_user_id, "u1");
        assert_eq!(decoded.request_date, ts(2021));
    }

    #[test]
    fn test_decode_accepts_previous_schema() {
        let mut state = CustomerState::new("u1", ts(2021), pro_payload(None));
        state.schema_version = "2".to_string();
        let bytes = state.encode().unwrap();
        assert!(CustomerState::decode(&bytes).is_ok());
    }

    #[test]
    fn test_decode_rejects_incompatible_schema() {
        let mut state = CustomerState::new("u1", ts(2021), pro_payload(None));
        state.schema_version = "1".to_string();
        let bytes = state.encode().unwrap();
        let err = CustomerState::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            ResponseError::IncompatibleSchema {
                found: Some("1".to_string())
            }
        );
    }

    #[test]
    fn test_decode_rejects_missing_schema() {
        let err = CustomerState::decode(br#"{"app_user_id":"u1"}"#).unwrap_err();
        assert_eq!(err, ResponseError::IncompatibleSchema { found: None });
    }

    #[test]
    fn test_unknown_store_decodes() {
        let store: Store = serde_json::from_str("\"amazon\"").unwrap();
        assert_eq!(store, Store::Unknown);
    }

    #[test]
    fn test_latest_expiration() {
        let state = CustomerState::new("u1", ts(2021), pro_payload(Some(ts(2999))));
        assert_eq!(state.latest_expiration(), Some(ts(2999)));
    }
}
