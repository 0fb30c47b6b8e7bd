//! Configuration layer: typed settings with layered precedence (file → env).

use std::{num::NonZeroUsize, path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    CacheConfig, DEFAULT_LOCALE, DEFAULT_MEMORY_RESPONSE_LIMIT, DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "viewcache";
const ENV_PREFIX: &str = "VIEWCACHE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_response_cache: bool,
    pub default_locale: String,
    pub memory_response_limit: NonZeroUsize,
    pub response_body_limit_bytes: NonZeroUsize,
}

impl CacheSettings {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig::from(self)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (defaults file → local file →
/// explicit file → environment).
///
/// Environment variables use the `VIEWCACHE__SECTION__KEY` form, e.g.
/// `VIEWCACHE__CACHE__DEFAULT_LOCALE=fr`.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_locale = cache
        .default_locale
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
        .trim()
        .to_ascii_lowercase();
    if default_locale.is_empty() {
        return Err(LoadError::invalid("cache.default_locale", "cannot be empty"));
    }

    Ok(CacheSettings {
        enable_response_cache: cache.enable_response_cache.unwrap_or(true),
        default_locale,
        memory_response_limit: non_zero_usize(
            cache
                .memory_response_limit
                .unwrap_or(DEFAULT_MEMORY_RESPONSE_LIMIT),
            "cache.memory_response_limit",
        )?,
        response_body_limit_bytes: non_zero_usize(
            cache
                .response_body_limit_bytes
                .unwrap_or(DEFAULT_RESPONSE_BODY_LIMIT_BYTES),
            "cache.response_body_limit_bytes",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_response_cache: Option<bool>,
    default_locale: Option<String>,
    memory_response_limit: Option<usize>,
    response_body_limit_bytes: Option<usize>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
