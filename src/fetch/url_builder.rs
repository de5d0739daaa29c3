/// Request URL construction for per-query fetches
use crate::{criteria::CriteriaSet, index::saml2_source_id};
use std::sync::Arc;

/// Builds the request URL for a set of criteria, or `None` if the criteria
/// cannot be mapped to a URL
pub trait UrlBuilder: Send + Sync {
    fn build(&self, criteria: &CriteriaSet) -> Option<String>;

    /// Whether URLs can be built from criteria without an entity ID
    fn supports_secondary(&self) -> bool {
        false
    }
}

/// Well-known location: the entity ID itself is the metadata URL
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityIdAsUrl;

impl UrlBuilder for EntityIdAsUrl {
    fn build(&self, criteria: &CriteriaSet) -> Option<String> {
        let id = criteria.entity_id()?;
        let lower = id.to_ascii_lowercase();
        (lower.starts_with("https://") || lower.starts_with("http://")).then(|| id.to_string())
    }
}

/// Encoding applied to the entity ID before template substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateEncoding {
    /// Substitute verbatim
    None,
    /// application/x-www-form-urlencoded: spaces become '+'
    #[default]
    Form,
    /// Percent-encode everything except path separators
    Path,
}

impl std::str::FromStr for TemplateEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(TemplateEncoding::None),
            "form" => Ok(TemplateEncoding::Form),
            "path" => Ok(TemplateEncoding::Path),
            other => Err(format!("Unknown template encoding: {}", other)),
        }
    }
}

impl TemplateEncoding {
    pub fn encode(&self, value: &str) -> String {
        match self {
            TemplateEncoding::None => value.to_string(),
            TemplateEncoding::Form => urlencoding::encode(value).replace("%20", "+"),
            TemplateEncoding::Path => urlencoding::encode(value).replace("%2F", "/"),
        }
    }
}

/// Placeholder replaced by the encoded entity ID
pub const ENTITY_ID_PLACEHOLDER: &str = "{entityID}";

/// Substitutes the entity ID into a URL template
#[derive(Debug, Clone)]
pub struct TemplateUrlBuilder {
    template: String,
    encoding: TemplateEncoding,
}

impl TemplateUrlBuilder {
    pub fn new(template: impl Into<String>, encoding: TemplateEncoding) -> Self {
        Self {
            template: template.into(),
            encoding,
        }
    }
}

impl UrlBuilder for TemplateUrlBuilder {
    fn build(&self, criteria: &CriteriaSet) -> Option<String> {
        let id = criteria.entity_id()?;
        Some(
            self.template
                .replace(ENTITY_ID_PLACEHOLDER, &self.encoding.encode(id)),
        )
    }
}

/// Metadata query protocol: `{base}/entities/{id}`
///
/// Artifacts carrying a SourceID are looked up as `{sha1}<hex>`.
#[derive(Debug, Clone)]
pub struct MdqUrlBuilder {
    base_url: String,
}

impl MdqUrlBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn entities_url(&self, identifier: &str) -> String {
        format!("{}/entities/{}", self.base_url, urlencoding::encode(identifier))
    }
}

impl UrlBuilder for MdqUrlBuilder {
    fn build(&self, criteria: &CriteriaSet) -> Option<String> {
        if let Some(id) = criteria.entity_id() {
            return Some(self.entities_url(id));
        }
        let source_id = saml2_source_id(criteria.artifact()?)?;
        Some(self.entities_url(&format!("{{sha1}}{}", source_id)))
    }

    fn supports_secondary(&self) -> bool {
        true
    }
}

type BuildFn = dyn Fn(&CriteriaSet) -> Option<String> + Send + Sync;

/// URL builder from a closure
#[derive(Clone)]
pub struct FunctionUrlBuilder {
    build_fn: Arc<BuildFn>,
    secondary: bool,
}

impl FunctionUrlBuilder {
    pub fn new<F>(build_fn: F) -> Self
    where
        F: Fn(&CriteriaSet) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            build_fn: Arc::new(build_fn),
            secondary: false,
        }
    }

    pub fn with_secondary_lookup(mut self) -> Self {
        self.secondary = true;
        self
    }
}

impl UrlBuilder for FunctionUrlBuilder {
    fn build(&self, criteria: &CriteriaSet) -> Option<String> {
        (self.build_fn)(criteria)
    }

    fn supports_secondary(&self) -> bool {
        self.secondary
    }
}
