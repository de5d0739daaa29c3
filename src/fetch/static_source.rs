/// Pre-loaded metadata with no network access
use super::{filter_documents, OriginFetcher, RefreshOutcome, Snapshot};
use crate::{
    criteria::CriteriaSet,
    error::MetadataResult,
    filter::{FilterChain, FilterContext},
    metadata::MetadataDocument,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

pub struct StaticDocumentSource {
    name: String,
    documents: Vec<MetadataDocument>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl StaticDocumentSource {
    pub fn new(name: impl Into<String>, documents: Vec<MetadataDocument>) -> Self {
        Self {
            name: name.into(),
            documents,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Load a JSON metadata document from disk
    pub async fn from_file(name: impl Into<String>, path: impl AsRef<Path>) -> MetadataResult<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let document = MetadataDocument::parse(&bytes)?;
        Ok(Self::new(name, vec![document]))
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl OriginFetcher for StaticDocumentSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, criteria: &CriteriaSet) -> MetadataResult<Option<MetadataDocument>> {
        Ok(self.current().lookup(criteria))
    }

    async fn refresh(
        &self,
        filters: &FilterChain,
        context: &FilterContext,
    ) -> MetadataResult<RefreshOutcome> {
        let descriptors = filter_documents(self.documents.clone(), filters, context)?;
        let snapshot = Arc::new(Snapshot::from_descriptors(&descriptors));
        info!("{}: loaded {} static entities", self.name, snapshot.len());

        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }

        Ok(RefreshOutcome::Updated {
            descriptors,
            next_refresh: None,
        })
    }

    fn prefiltered(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::EntityIdPredicateFilter;
    use crate::filter::PredicateMode;
    use crate::metadata::{EntitiesDescriptor, EntityDescriptor};
    use chrono::Utc;

    fn source() -> StaticDocumentSource {
        StaticDocumentSource::new(
            "static",
            vec![MetadataDocument::Entities(EntitiesDescriptor::new(vec![
                EntityDescriptor::new("https://id1.example.org"),
                EntityDescriptor::new("https://id2.example.org"),
            ]))],
        )
    }

    #[tokio::test]
    async fn test_fetch_before_refresh_is_empty() {
        let src = source();
        let criteria = CriteriaSet::for_entity_id("https://id1.example.org").unwrap();
        assert!(src.fetch(&criteria).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_applies_filters() {
        let src = source();
        let filters = FilterChain::default().with(EntityIdPredicateFilter::new(
            PredicateMode::Exclude,
            ["https://id2.example.org"],
        ));
        let outcome = src
            .refresh(&filters, &FilterContext::new("static", Utc::now()))
            .await
            .unwrap();

        match outcome {
            RefreshOutcome::Updated { descriptors, next_refresh } => {
                assert_eq!(descriptors.len(), 1);
                assert!(next_refresh.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let id1 = CriteriaSet::for_entity_id("https://id1.example.org").unwrap();
        let id2 = CriteriaSet::for_entity_id("https://id2.example.org").unwrap();
        assert!(src.fetch(&id1).await.unwrap().is_some());
        assert!(src.fetch(&id2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        tokio::fs::write(&path, br#"{"entityID":"https://sp.example.org"}"#)
            .await
            .unwrap();

        let src = StaticDocumentSource::from_file("file", &path).await.unwrap();
        src.refresh(&FilterChain::default(), &FilterContext::new("file", Utc::now()))
            .await
            .unwrap();
        let criteria = CriteriaSet::for_entity_id("https://sp.example.org").unwrap();
        assert!(src.fetch(&criteria).await.unwrap().is_some());
    }
}
