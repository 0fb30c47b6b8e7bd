//! Cache configuration.
//!
//! Runtime knobs for the read path and the bundled in-memory store, normally
//! resolved from the `[cache]` section of the settings file.

use std::num::NonZeroUsize;

use serde::Deserialize;

pub(crate) const DEFAULT_LOCALE: &str = "en-us";
pub(crate) const DEFAULT_MEMORY_RESPONSE_LIMIT: usize = 1000;
pub(crate) const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve and commit cached responses. Invalidation keeps running when disabled.
    pub enable_response_cache: bool,
    /// Locale used when the request carries no negotiated locale.
    pub default_locale: String,
    /// Maximum responses held by `MemoryCacheStore`.
    pub memory_response_limit: usize,
    /// Responses with a larger body are served but never committed.
    pub response_body_limit_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_response_cache: true,
            default_locale: DEFAULT_LOCALE.to_string(),
            memory_response_limit: DEFAULT_MEMORY_RESPONSE_LIMIT,
            response_body_limit_bytes: DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_response_cache: settings.enable_response_cache,
            default_locale: settings.default_locale.clone(),
            memory_response_limit: settings.memory_response_limit.get(),
            response_body_limit_bytes: settings.response_body_limit_bytes.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the memory store capacity, clamping to 1 if zero.
    pub fn memory_response_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_response_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enable_response_cache);
        assert_eq!(config.default_locale, "en-us");
        assert_eq!(config.memory_response_limit, 1000);
        assert_eq!(config.response_body_limit_bytes, 1024 * 1024);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_response_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_response_limit_non_zero().get(), 1);
    }
}
