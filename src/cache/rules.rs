//! Declared invalidation triggers.

use std::collections::BTreeSet;

use crate::domain::{ChangeKind, EntityType};

/// One relationship-traversal step: a field on the primary type that, filtered by a
/// changed related instance, yields the primary instances to invalidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    relationship_field: String,
}

impl Route {
    pub fn new(relationship_field: impl Into<String>) -> Self {
        Self {
            relationship_field: relationship_field.into(),
        }
    }

    pub fn relationship_field(&self) -> &str {
        &self.relationship_field
    }
}

/// A declared invalidation trigger for one namespace.
///
/// ```ignore
/// // Invalidate cached posts when one of their comments is created.
/// Rule::new(comment, [ChangeKind::Created]).route("comments");
/// ```
#[derive(Debug, Clone)]
pub struct Rule {
    source: EntityType,
    event_kinds: BTreeSet<ChangeKind>,
    routes: Vec<Route>,
}

impl Rule {
    pub fn new(source: EntityType, event_kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        Self {
            source,
            event_kinds: event_kinds.into_iter().collect(),
            routes: Vec::new(),
        }
    }

    /// Rule firing on created, updated, and deleted events.
    pub fn on_any_change(source: EntityType) -> Self {
        Self::new(source, ChangeKind::ALL)
    }

    /// Append a route through `relationship_field` on the primary type.
    pub fn route(mut self, relationship_field: impl Into<String>) -> Self {
        self.routes.push(Route::new(relationship_field));
        self
    }

    pub fn with_routes(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn source(&self) -> &EntityType {
        &self.source
    }

    pub fn event_kinds(&self) -> &BTreeSet<ChangeKind> {
        &self.event_kinds
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_routed(&self) -> bool {
        !self.routes.is_empty()
    }
}
