//! Invalidation registry.
//!
//! Compiles a namespace's declared rules once at wiring time: every rule is
//! validated and tagged with the eviction scope it will use, and all declared routes
//! are flattened into a route index keyed by the related entity's tag. Nothing here
//! changes after `build` returns, so the registry is shared freely across tasks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::{info, warn};

use crate::domain::{ChangeKind, EntityType};

use super::error::CacheError;
use super::namespace::Namespace;
use super::rules::{Route, Rule};

/// Eviction granularity of a compiled rule, resolved at build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    /// Evict `{reference}:`. The namespace has no primary type.
    Namespace,
    /// Evict `{reference}:{entityTypeTag}:`.
    EntityType,
    /// Evict `{reference}:{entityTypeTag}:{value of field}:` for the changed instance.
    Instance { field: String },
    /// Resolve the related primary instances through the route index, then evict each
    /// one as `Instance` does.
    Routed { field: String },
}

impl RuleScope {
    pub fn label(&self) -> &'static str {
        match self {
            RuleScope::Namespace => "namespace",
            RuleScope::EntityType => "entity_type",
            RuleScope::Instance { .. } => "instance",
            RuleScope::Routed { .. } => "routed",
        }
    }
}

impl fmt::Display for RuleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A validated rule with its scope decided.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    index: usize,
    source: EntityType,
    event_kinds: BTreeSet<ChangeKind>,
    declared_routes: usize,
    scope: RuleScope,
}

impl CompiledRule {
    /// Position of the rule in its declaration list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &EntityType {
        &self.source
    }

    pub fn event_kinds(&self) -> &BTreeSet<ChangeKind> {
        &self.event_kinds
    }

    pub fn scope(&self) -> &RuleScope {
        &self.scope
    }

    /// True when the rule was declared without routes.
    pub fn is_direct(&self) -> bool {
        self.declared_routes == 0
    }
}

/// Related-entity tag → routes declared for it, flattened across rules.
#[derive(Debug, Clone, Default)]
pub struct RouteIndex {
    routes: HashMap<String, Vec<Route>>,
}

impl RouteIndex {
    fn insert(&mut self, entity_tag: &str, routes: &[Route]) {
        let entry = self.routes.entry(entity_tag.to_string()).or_default();
        for route in routes {
            if !entry.contains(route) {
                entry.push(route.clone());
            }
        }
    }

    pub fn routes_for(&self, entity_tag: &str) -> &[Route] {
        self.routes.get(entity_tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of related entity types with at least one route.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct InvalidationRegistry {
    namespace: Namespace,
    rules: Vec<CompiledRule>,
    routes: RouteIndex,
}

impl InvalidationRegistry {
    /// Validate and compile `rules` for `namespace`.
    ///
    /// Fails on the first misconfigured rule so a namespace never accepts traffic
    /// with a partially built registry.
    pub fn build(
        namespace: Namespace,
        rules: impl IntoIterator<Item = Rule>,
    ) -> Result<Self, CacheError> {
        let mut compiled = Vec::new();
        let mut routes = RouteIndex::default();

        for (index, rule) in rules.into_iter().enumerate() {
            validate(&namespace, index, &rule)?;
            let scope = compile_scope(&namespace, index, &rule);

            if rule.is_routed() && namespace.primary().is_some() {
                routes.insert(rule.source().tag(), rule.routes());
            }

            compiled.push(CompiledRule {
                index,
                source: rule.source().clone(),
                event_kinds: rule.event_kinds().clone(),
                declared_routes: rule.routes().len(),
                scope,
            });
        }

        info!(
            reference = namespace.reference(),
            rules = compiled.len(),
            routed_types = routes.len(),
            "Invalidation registry built"
        );

        Ok(Self {
            namespace,
            rules: compiled,
            routes,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn rule(&self, index: usize) -> Option<&CompiledRule> {
        self.rules.get(index)
    }

    /// Rules declared without routes.
    pub fn direct_rules(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|rule| rule.is_direct())
    }

    /// Routes declared for changes on the entity tagged `entity_tag`; empty if none.
    pub fn routes_for(&self, entity_tag: &str) -> &[Route] {
        self.routes.routes_for(entity_tag)
    }

    pub fn route_index(&self) -> &RouteIndex {
        &self.routes
    }
}

fn validate(namespace: &Namespace, index: usize, rule: &Rule) -> Result<(), CacheError> {
    let reference = namespace.reference();

    if rule.event_kinds().is_empty() {
        return Err(CacheError::misconfigured_rule(
            reference,
            index,
            format!("rule on `{}` declares no event kinds", rule.source()),
        ));
    }

    let Some(primary) = namespace.primary() else {
        return Ok(());
    };
    if !rule.is_routed() {
        return Ok(());
    }

    if rule.source() == primary {
        return Err(CacheError::misconfigured_rule(
            reference,
            index,
            format!("routes must bridge a related type, but the source is the primary type `{primary}`"),
        ));
    }

    for route in rule.routes() {
        if !primary.has_field(route.relationship_field()) {
            return Err(CacheError::misconfigured_rule(
                reference,
                index,
                format!(
                    "route field `{}` does not exist on `{primary}`",
                    route.relationship_field()
                ),
            ));
        }
    }

    Ok(())
}

fn compile_scope(namespace: &Namespace, index: usize, rule: &Rule) -> RuleScope {
    let Some(primary) = namespace.primary() else {
        return RuleScope::Namespace;
    };
    let instance_field = namespace.instance_field();

    match (rule.is_routed(), instance_field) {
        (true, Some(field)) => RuleScope::Routed {
            field: field.to_string(),
        },
        (true, None) => {
            warn!(
                reference = namespace.reference(),
                rule = index,
                source_entity = rule.source().name(),
                "Routed rule without an instance field resets the whole entity type"
            );
            RuleScope::EntityType
        }
        (false, Some(field)) if rule.source() == primary => RuleScope::Instance {
            field: field.to_string(),
        },
        (false, _) => RuleScope::EntityType,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> EntityType {
        EntityType::new("Post").with_fields(["id", "comments", "tags"])
    }

    fn comment() -> EntityType {
        EntityType::new("Comment").with_fields(["id"])
    }

    fn namespace(instance_field: Option<&str>) -> Namespace {
        let mut builder = Namespace::builder("posts").primary(post());
        if let Some(field) = instance_field {
            builder = builder.instance_field(field);
        }
        builder.build().expect("valid namespace")
    }

    #[test]
    fn scopes_follow_namespace_shape() {
        let registry = InvalidationRegistry::build(
            namespace(Some("id")),
            [
                Rule::new(post(), [ChangeKind::Updated]),
                Rule::new(comment(), [ChangeKind::Created]).route("comments"),
                Rule::new(EntityType::new("Tag"), [ChangeKind::Deleted]),
            ],
        )
        .expect("valid registry");

        let scopes: Vec<_> = registry.rules().iter().map(|rule| rule.scope().clone()).collect();
        assert_eq!(
            scopes,
            vec![
                RuleScope::Instance {
                    field: "id".to_string()
                },
                RuleScope::Routed {
                    field: "id".to_string()
                },
                RuleScope::EntityType,
            ]
        );
        assert_eq!(registry.direct_rules().count(), 2);
    }

    #[test]
    fn no_primary_means_namespace_scope() {
        let namespace = Namespace::builder("home").build().expect("valid namespace");
        let registry = InvalidationRegistry::build(
            namespace,
            [
                Rule::new(post(), [ChangeKind::Updated]),
                Rule::new(comment(), [ChangeKind::Created]).route("comments"),
            ],
        )
        .expect("valid registry");

        assert!(
            registry
                .rules()
                .iter()
                .all(|rule| *rule.scope() == RuleScope::Namespace)
        );
        assert!(registry.route_index().is_empty());
    }

    #[test]
    fn routed_rule_without_instance_field_degrades_to_entity_type() {
        let registry = InvalidationRegistry::build(
            namespace(None),
            [Rule::new(comment(), [ChangeKind::Created]).route("comments")],
        )
        .expect("valid registry");

        assert_eq!(*registry.rules()[0].scope(), RuleScope::EntityType);
        assert!(!registry.rules()[0].is_direct());
        assert_eq!(registry.routes_for("comment").len(), 1);
    }

    #[test]
    fn routes_are_flattened_per_source_type() {
        let registry = InvalidationRegistry::build(
            namespace(Some("id")),
            [
                Rule::new(comment(), [ChangeKind::Created]).route("comments"),
                Rule::new(comment(), [ChangeKind::Deleted])
                    .route("comments")
                    .route("tags"),
            ],
        )
        .expect("valid registry");

        let fields: Vec<_> = registry
            .routes_for("comment")
            .iter()
            .map(Route::relationship_field)
            .collect();
        assert_eq!(fields, ["comments", "tags"]);
        assert!(registry.routes_for("post").is_empty());
    }

    #[test]
    fn routes_on_primary_type_are_rejected() {
        let error = InvalidationRegistry::build(
            namespace(Some("id")),
            [Rule::new(post(), [ChangeKind::Updated]).route("comments")],
        )
        .unwrap_err();

        assert!(matches!(error, CacheError::MisconfiguredRule { rule: 0, .. }));
    }

    #[test]
    fn unknown_route_field_is_rejected() {
        let error = InvalidationRegistry::build(
            namespace(Some("id")),
            [
                Rule::new(post(), [ChangeKind::Updated]),
                Rule::new(comment(), [ChangeKind::Created]).route("replies"),
            ],
        )
        .unwrap_err();

        match error {
            CacheError::MisconfiguredRule { rule, reason, .. } => {
                assert_eq!(rule, 1);
                assert!(reason.contains("replies"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rule_without_event_kinds_is_rejected() {
        let error = InvalidationRegistry::build(
            namespace(Some("id")),
            [Rule::new(post(), Vec::<ChangeKind>::new())],
        )
        .unwrap_err();
        assert!(error.is_configuration());
    }

    #[test]
    fn building_twice_is_equivalent() {
        let rules = vec![
            Rule::new(post(), [ChangeKind::Updated]),
            Rule::new(comment(), [ChangeKind::Created]).route("comments"),
        ];
        let first = InvalidationRegistry::build(namespace(Some("id")), rules.clone()).unwrap();
        let second = InvalidationRegistry::build(namespace(Some("id")), rules).unwrap();

        assert_eq!(first.rules().len(), second.rules().len());
        for (a, b) in first.rules().iter().zip(second.rules()) {
            assert_eq!(a.scope(), b.scope());
        }
        assert_eq!(first.routes_for("comment"), second.routes_for("comment"));
    }
}
