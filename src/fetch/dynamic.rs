/// Per-query HTTP fetch
use super::{http_client, is_metadata_content_type, OriginFetcher, UrlBuilder};
use crate::{
    criteria::CriteriaSet,
    error::{MetadataError, MetadataResult},
    metadata::MetadataDocument,
    metrics,
};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Accept header sent with every request
pub const METADATA_ACCEPT: &str = "application/samlmetadata+json, application/json;q=0.9";

/// Issues exactly one GET per fetch, to a URL built from the criteria
pub struct DynamicHttpSource {
    name: String,
    client: reqwest::Client,
    url_builder: Arc<dyn UrlBuilder>,
    /// Treat non-2xx responses and unexpected content types as failures
    strict: bool,
}

impl DynamicHttpSource {
    pub fn new(
        name: impl Into<String>,
        url_builder: Arc<dyn UrlBuilder>,
        timeout: Duration,
    ) -> MetadataResult<Self> {
        Ok(Self {
            name: name.into(),
            client: http_client(timeout)?,
            url_builder,
            strict: false,
        })
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    async fn get(&self, url: &str) -> MetadataResult<Option<MetadataDocument>> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, METADATA_ACCEPT)
            .send()
            .await
            .map_err(|e| MetadataError::FetchFailed(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            if self.strict {
                return Err(MetadataError::FetchFailed(format!(
                    "GET {} returned {}",
                    url, status
                )));
            }
            debug!("{}: GET {} returned {}, treating as not found", self.name, url, status);
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_metadata_content_type(&content_type) {
            if self.strict {
                return Err(MetadataError::FetchFailed(format!(
                    "GET {} returned unsupported content type '{}'",
                    url, content_type
                )));
            }
            warn!(
                "{}: GET {} returned unsupported content type '{}'",
                self.name, url, content_type
            );
            return Ok(None);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| MetadataError::FetchFailed(format!("Reading {} failed: {}", url, e)))?;
        MetadataDocument::parse(&body)
            .map(Some)
            .map_err(|e| MetadataError::FetchFailed(format!("Malformed metadata from {}: {}", url, e)))
    }
}

#[async_trait]
impl OriginFetcher for DynamicHttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, criteria: &CriteriaSet) -> MetadataResult<Option<MetadataDocument>> {
        let Some(url) = self.url_builder.build(criteria) else {
            debug!("{}: no request URL for {}", self.name, criteria);
            return Ok(None);
        };

        let started = Instant::now();
        let result = self.get(&url).await;
        let outcome = match &result {
            Ok(Some(_)) => "success",
            Ok(None) => "not_found",
            Err(_) => "failure",
        };
        metrics::record_origin_fetch(&self.name, outcome, started.elapsed().as_secs_f64());
        result
    }

    fn supports_secondary_lookup(&self) -> bool {
        self.url_builder.supports_secondary()
    }
}
