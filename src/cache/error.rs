use std::fmt;

use thiserror::Error;

use crate::domain::StoreError;

/// Which external store an operation was talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Cache,
    Entity,
}

impl StoreKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::Cache => "cache",
            StoreKind::Entity => "entity",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("namespace `{reference}` rule #{rule} is misconfigured: {reason}")]
    MisconfiguredRule {
        reference: String,
        rule: usize,
        reason: String,
    },
    #[error("namespace `{reference}` is misconfigured: {reason}")]
    MisconfiguredNamespace { reference: String, reason: String },
    #[error("{store} store unavailable")]
    StoreUnavailable {
        store: StoreKind,
        #[source]
        source: StoreError,
    },
    #[error("cached view invoked outside a valid request context: {reason}")]
    InvalidRequestContext { reason: String },
}

impl CacheError {
    pub fn misconfigured_rule(
        reference: impl Into<String>,
        rule: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self::MisconfiguredRule {
            reference: reference.into(),
            rule,
            reason: reason.into(),
        }
    }

    pub fn misconfigured_namespace(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MisconfiguredNamespace {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn cache_store(source: StoreError) -> Self {
        Self::StoreUnavailable {
            store: StoreKind::Cache,
            source,
        }
    }

    pub fn entity_store(source: StoreError) -> Self {
        Self::StoreUnavailable {
            store: StoreKind::Entity,
            source,
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequestContext {
            reason: reason.into(),
        }
    }

    /// Configuration errors are fatal at wiring time; everything else is a runtime error.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MisconfiguredRule { .. } | Self::MisconfiguredNamespace { .. }
        )
    }
}
