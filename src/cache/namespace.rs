//! Cached endpoint identity and scoping rules.

use crate::domain::EntityType;

use super::error::CacheError;

/// Identity of one cached endpoint.
///
/// Built once at wiring time and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Namespace {
    reference: String,
    primary: Option<EntityType>,
    instance_field: Option<String>,
    private: bool,
}

impl Namespace {
    pub fn builder(reference: impl Into<String>) -> NamespaceBuilder {
        NamespaceBuilder {
            reference: reference.into(),
            primary: None,
            instance_field: None,
            private: false,
        }
    }

    /// Stable string id of the endpoint, e.g. `posts-list`.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn primary(&self) -> Option<&EntityType> {
        self.primary.as_ref()
    }

    /// Lowercased primary type name, or empty when the namespace has no primary type.
    pub fn entity_tag(&self) -> &str {
        self.primary.as_ref().map(EntityType::tag).unwrap_or("")
    }

    /// Field identifying one primary instance. Only meaningful with a primary type.
    pub fn instance_field(&self) -> Option<&str> {
        self.primary.as_ref()?;
        self.instance_field.as_deref()
    }

    /// Whether keys are scoped per authenticated principal.
    pub fn is_private(&self) -> bool {
        self.private
    }
}

#[derive(Debug, Clone)]
pub struct NamespaceBuilder {
    reference: String,
    primary: Option<EntityType>,
    instance_field: Option<String>,
    private: bool,
}

impl NamespaceBuilder {
    pub fn primary(mut self, entity_type: EntityType) -> Self {
        self.primary = Some(entity_type);
        self
    }

    pub fn instance_field(mut self, field: impl Into<String>) -> Self {
        self.instance_field = Some(field.into());
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn build(self) -> Result<Namespace, CacheError> {
        let reference = self.reference.trim().to_string();
        if reference.is_empty() {
            return Err(CacheError::misconfigured_namespace(
                self.reference,
                "reference must not be empty",
            ));
        }

        if let (Some(primary), Some(field)) = (self.primary.as_ref(), self.instance_field.as_ref())
            && !primary.has_field(field)
        {
            return Err(CacheError::misconfigured_namespace(
                reference,
                format!("instance field `{field}` is not declared on `{primary}`"),
            ));
        }

        Ok(Namespace {
            reference,
            primary: self.primary,
            instance_field: self.instance_field,
            private: self.private,
        })
    }
}
