//! Cache key definitions.
//!
//! A serialized key reads `{reference}:{entityTypeTag}:{instanceTag}:{fingerprint}:{locale}`.
//! The first three components form the eviction prefix; the fingerprint and locale
//! are excluded so every variant of a cached resource is purged together.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use url::Url;

use super::error::CacheError;
use super::namespace::Namespace;

const SEPARATOR: char = ':';

/// Authenticated identity of the caller, inserted as a request extension by the
/// host's authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Response locale chosen by the host's locale negotiation, inserted as a request
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedLocale(pub String);

/// Everything the key builder needs to know about one read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    target: Url,
    params: BTreeMap<String, String>,
    principal: Option<String>,
    locale: String,
}

impl RequestContext {
    /// Build a context from an absolute request target such as
    /// `https://example.com/posts/7?page=2`.
    pub fn new(target: &str, locale: impl Into<String>) -> Result<Self, CacheError> {
        let url = Url::parse(target)
            .map_err(|err| CacheError::invalid_request(format!("unparseable target `{target}`: {err}")))?;
        Self::from_url(url, locale)
    }

    pub fn from_url(mut target: Url, locale: impl Into<String>) -> Result<Self, CacheError> {
        if target.cannot_be_a_base() || target.host_str().is_none() {
            return Err(CacheError::invalid_request(format!(
                "target `{target}` is not an absolute http target"
            )));
        }
        target.set_fragment(None);

        Ok(Self {
            target,
            params: BTreeMap::new(),
            principal: None,
            locale: locale.into(),
        })
    }

    /// Add a path or query parameter. The first value recorded for a name wins, so
    /// path parameters should be added before query parameters.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.entry(name.into()).or_insert_with(|| value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in params {
            self = self.with_param(name, value);
        }
        self
    }

    pub fn with_principal(mut self, principal: Option<impl Into<String>>) -> Self {
        self.principal = principal.map(Into::into);
        self
    }

    /// Normalized absolute target.
    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }
}

/// Structured cache key for one read request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    reference: String,
    entity_tag: String,
    instance_tag: String,
    fingerprint: String,
    locale: String,
}

impl CacheKey {
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn entity_tag(&self) -> &str {
        &self.entity_tag
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    /// Eviction-addressable portion of this key.
    pub fn prefix(&self) -> KeyPrefix {
        KeyPrefix::instance(&self.reference, &self.entity_tag, &self.instance_tag)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{SEPARATOR}{}",
            self.prefix(),
            escape_component(&self.fingerprint),
            escape_component(&self.locale)
        )
    }
}

/// Serialized key prefix handed to the store's prefix delete.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// `{reference}:` covers the whole namespace.
    pub fn namespace(reference: &str) -> Self {
        Self(format!("{}{SEPARATOR}", escape_component(reference)))
    }

    /// `{reference}:{entityTypeTag}:` covers every instance of the primary type.
    pub fn entity_type(reference: &str, entity_tag: &str) -> Self {
        Self(format!(
            "{}{}{SEPARATOR}",
            Self::namespace(reference),
            escape_component(entity_tag)
        ))
    }

    /// `{reference}:{entityTypeTag}:{instanceTag}:` covers one primary instance.
    pub fn instance(reference: &str, entity_tag: &str, instance_tag: &str) -> Self {
        Self(format!(
            "{}{}{SEPARATOR}",
            Self::entity_type(reference, entity_tag),
            escape_component(instance_tag)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&self.0)
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Key construction
// ============================================================================

/// Derive the cache key for `request` against `namespace`.
pub fn build_key(namespace: &Namespace, request: &RequestContext) -> CacheKey {
    let instance_tag = namespace
        .instance_field()
        .and_then(|field| request.param(field))
        .unwrap_or("");

    let salt = if namespace.is_private() {
        request.principal().unwrap_or("")
    } else {
        ""
    };

    CacheKey {
        reference: namespace.reference().to_string(),
        entity_tag: namespace.entity_tag().to_string(),
        instance_tag: instance_tag.to_string(),
        fingerprint: fingerprint(request.target(), salt),
        locale: request.locale().to_string(),
    }
}

/// Hex SHA-256 over the length-prefixed normalized target followed by the
/// principal salt. The prefix keeps `(target, salt)` pairs from sharing a digest
/// when their concatenations coincide.
pub fn fingerprint(target: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((target.len() as u64).to_be_bytes());
    hasher.update(target.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Escape `%` and the `:` separator so no component can forge another's boundary.
pub fn escape_component(value: &str) -> Cow<'_, str> {
    if !value.contains(['%', SEPARATOR]) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(value.replace('%', "%25").replace(SEPARATOR, "%3A"))
}
