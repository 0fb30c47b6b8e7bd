//! Helpers shared by the cache and domain layers.

pub(crate) mod lock;
