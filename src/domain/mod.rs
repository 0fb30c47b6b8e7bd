//! Entity model shared by the key builder and the invalidation engine.
//!
//! The crate never owns entities. It only needs their type, their identity, and a
//! capability to look up "all entities of type T whose field F matches V".

pub mod entities;
pub mod error;
pub mod memory;

pub use entities::{ChangeKind, EntityInstance, EntityStore, EntityType, FieldLookup};
pub use error::StoreError;
pub use memory::MemoryEntityStore;
