//! Response caching for read endpoints with declarative, event-driven invalidation.
//!
//! A cached endpoint is described by a [`cache::Namespace`] and a list of
//! [`cache::Rule`]s. Wiring them with [`cache::CachedView::wire`] builds the
//! invalidation registry, subscribes one receiver per (rule, event kind) to the
//! change notifier, and returns the read-path handle used by the
//! [`cache::response_cache_layer`] middleware.

pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
mod util;
