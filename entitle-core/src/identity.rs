//! App user identifiers and the anonymous identifier format

use crate::{config::DEFAULT_ANONYMOUS_ID_PREFIX, ConfigError, IdentityError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the random suffix of a generated anonymous identifier.
const ANONYMOUS_SUFFIX_LEN: usize = 32;

static DEFAULT_FORMAT: Lazy<AnonymousIdFormat> = Lazy::new(|| {
    AnonymousIdFormat::new(DEFAULT_ANONYMOUS_ID_PREFIX)
        .expect("static anonymous id pattern should compile")
});

/// The syntax of locally generated pseudo-identities.
///
/// An anonymous identifier is the namespace prefix followed by 32 lowercase
/// alphanumeric characters. Generated ones use a v4 UUID without separators,
/// but any lowercase alphanumeric suffix is recognized.
#[derive(Debug, Clone)]
pub struct AnonymousIdFormat {
    prefix: String,
    pattern: Regex,
}

impl AnonymousIdFormat {
    /// Build a format for the given namespace prefix.
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        if prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "anonymous_id_prefix".to_string(),
                value: prefix.to_string(),
                reason: "anonymous_id_prefix must not be empty".to_string(),
            });
        }
        let source = format!(
            "^{}[a-z0-9]{{{}}}$",
            regex::escape(prefix),
            ANONYMOUS_SUFFIX_LEN
        );
        let pattern = Regex::new(&source).map_err(|e| ConfigError::InvalidValue {
            field: "anonymous_id_prefix".to_string(),
            value: prefix.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            prefix: prefix.to_string(),
            pattern,
        })
    }

    /// The format using the default namespace prefix.
    pub fn default_format() -> &'static AnonymousIdFormat {
        &DEFAULT_FORMAT
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generate a fresh anonymous identifier.
    pub fn generate(&self) -> String {
        format!("{}{}", self.prefix, Uuid::new_v4().simple())
    }

    /// Whether `app_user_id` has the anonymous identifier syntax.
    pub fn matches(&self, app_user_id: &str) -> bool {
        self.pattern.is_match(app_user_id)
    }
}

/// Trim an app user id and reject it if nothing is left.
pub fn normalize_app_user_id(app_user_id: &str) -> Result<String, IdentityError> {
    let trimmed = app_user_id.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::EmptyAppUserId);
    }
    Ok(trimmed.to_string())
}

/// The current user identifier and whether it is a generated pseudo-identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityState {
    pub app_user_id: String,
    pub is_anonymous: bool,
}

impl IdentityState {
    pub fn known(app_user_id: impl Into<String>) -> Self {
        Self {
            app_user_id: app_user_id.into(),
            is_anonymous: false,
        }
    }

    pub fn anonymous(app_user_id: impl Into<String>) -> Self {
        Self {
            app_user_id: app_user_id.into(),
            is_anonymous: true,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
