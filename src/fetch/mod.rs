/// Origin source fetchers
///
/// A fetcher hides where metadata comes from. Snapshot sources (a static
/// document, a periodically pulled HTTP document) load everything during
/// `refresh` and answer `fetch` from the last good snapshot; dynamic sources
/// issue one HTTP request per `fetch`.

pub mod dynamic;
pub mod http_document;
pub mod static_source;
pub mod url_builder;

pub use dynamic::DynamicHttpSource;
pub use http_document::{HttpDocumentSource, RefreshDelays};
pub use static_source::StaticDocumentSource;
pub use url_builder::{
    EntityIdAsUrl, FunctionUrlBuilder, MdqUrlBuilder, TemplateEncoding, TemplateUrlBuilder,
    UrlBuilder, ENTITY_ID_PLACEHOLDER,
};

use crate::{
    criteria::CriteriaSet,
    error::{MetadataError, MetadataResult},
    filter::{FilterChain, FilterContext},
    metadata::{EntityDescriptor, MetadataDocument},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of a snapshot refresh
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New data was loaded and filtered
    Updated {
        descriptors: Vec<EntityDescriptor>,
        next_refresh: Option<Duration>,
    },
    /// The origin reported no change since the last pull
    Unchanged { next_refresh: Option<Duration> },
    /// The source has nothing to refresh
    NotApplicable,
}

impl RefreshOutcome {
    pub fn next_refresh(&self) -> Option<Duration> {
        match self {
            RefreshOutcome::Updated { next_refresh, .. }
            | RefreshOutcome::Unchanged { next_refresh } => *next_refresh,
            RefreshOutcome::NotApplicable => None,
        }
    }
}

/// Strategy for reading metadata from its origin
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Fetch the document answering `criteria`, or `None` when the origin
    /// has nothing for it
    async fn fetch(&self, criteria: &CriteriaSet) -> MetadataResult<Option<MetadataDocument>>;

    /// Reload a snapshot source, running the filter chain over the whole
    /// document
    async fn refresh(
        &self,
        _filters: &FilterChain,
        _context: &FilterContext,
    ) -> MetadataResult<RefreshOutcome> {
        Ok(RefreshOutcome::NotApplicable)
    }

    /// Documents returned by `fetch` already went through the filter chain
    fn prefiltered(&self) -> bool {
        false
    }

    /// `fetch` can answer criteria without an entity ID
    fn supports_secondary_lookup(&self) -> bool {
        false
    }

    /// Delay before retrying a failed refresh
    fn retry_delay(&self) -> Option<Duration> {
        None
    }
}

/// Filtered descriptors of a snapshot source, keyed by entity ID
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    entities: HashMap<String, Vec<EntityDescriptor>>,
}

impl Snapshot {
    pub(crate) fn from_descriptors(descriptors: &[EntityDescriptor]) -> Self {
        let mut entities: HashMap<String, Vec<EntityDescriptor>> = HashMap::new();
        for descriptor in descriptors {
            entities
                .entry(descriptor.entity_id.clone())
                .or_default()
                .push(descriptor.clone());
        }
        Self { entities }
    }

    pub(crate) fn lookup(&self, criteria: &CriteriaSet) -> Option<MetadataDocument> {
        let found = self.entities.get(criteria.entity_id()?)?;
        match found.as_slice() {
            [single] => Some(MetadataDocument::Entity(single.clone())),
            many => Some(MetadataDocument::Entities(
                crate::metadata::EntitiesDescriptor::new(many.to_vec()),
            )),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }
}

/// Run the filter chain over freshly loaded documents and flatten the survivors
pub(crate) fn filter_documents(
    documents: Vec<MetadataDocument>,
    filters: &FilterChain,
    context: &FilterContext,
) -> MetadataResult<Vec<EntityDescriptor>> {
    let mut descriptors = Vec::new();
    for document in documents {
        if let Some(filtered) = filters.apply(document, context)? {
            descriptors.extend(filtered.into_descriptors());
        }
    }
    Ok(descriptors)
}

/// Shared HTTP client construction
pub(crate) fn http_client(timeout: Duration) -> MetadataResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("federation-metadata/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .map_err(|e| MetadataError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// True for the JSON media types metadata is served as
pub(crate) fn is_metadata_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Shared handle to a fetcher
pub type SharedFetcher = Arc<dyn OriginFetcher>;
