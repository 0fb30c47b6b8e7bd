//! Response cache with declarative, event-driven invalidation.
//!
//! A cached endpoint is declared as a [`Namespace`] plus a list of [`Rule`]s naming
//! the entity changes that make its responses stale:
//!
//! - **Read path**: [`build_key`] derives a structured key from the request, and
//!   [`CachedView`] (or the axum [`response_cache_layer`]) serves hits and commits
//!   successful misses.
//! - **Invalidation path**: [`InvalidationRegistry`] compiles the rules once,
//!   [`InvalidationDispatcher`] subscribes to a [`ChangeNotifier`] and purges the
//!   narrowest key prefix each change allows, using [`RouteResolver`] to walk from a
//!   related entity back to the primary instances that embed it.
//!
//! ## Configuration
//!
//! Runtime behaviour is controlled via the `[cache]` settings section:
//!
//! ```toml
//! [cache]
//! enable_response_cache = true
//! default_locale = "en-us"
//! memory_response_limit = 1000
//! # ... see config.rs for all options
//! ```

mod config;
mod dispatcher;
mod error;
mod events;
mod keys;
mod middleware;
mod namespace;
mod registry;
mod resolver;
mod rules;
mod store;
mod view;

pub use config::CacheConfig;
pub(crate) use config::{
    DEFAULT_LOCALE, DEFAULT_MEMORY_RESPONSE_LIMIT, DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
};
pub use dispatcher::{InvalidationDispatcher, InvalidationOutcome};
pub use error::{CacheError, StoreKind};
pub use events::{
    ChangeBus, ChangeEvent, ChangeHandler, ChangeNotifier, Epoch, SubscriptionId,
};
pub use keys::{
    CacheKey, KeyPrefix, NegotiatedLocale, Principal, RequestContext, build_key,
    escape_component, fingerprint,
};
pub use middleware::{CacheState, request_context, response_cache_layer};
pub use namespace::{Namespace, NamespaceBuilder};
pub use registry::{CompiledRule, InvalidationRegistry, RouteIndex, RuleScope};
pub use resolver::RouteResolver;
pub use rules::{Route, Rule};
pub use store::{CacheStore, CachedResponse, MemoryCacheStore};
pub use view::{CachedView, Lookup};
