/// Full-document HTTP pull
use super::{filter_documents, http_client, OriginFetcher, RefreshOutcome, Snapshot};
use crate::{
    criteria::CriteriaSet,
    error::{MetadataError, MetadataResult},
    filter::{FilterChain, FilterContext},
    metadata::MetadataDocument,
    metrics,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bounds for scheduling the next pull
#[derive(Debug, Clone, Copy)]
pub struct RefreshDelays {
    pub min: Duration,
    pub max: Duration,
    /// Fraction of the document's cache lifetime to wait before pulling again
    pub factor: f64,
}

impl Default for RefreshDelays {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5 * 60),
            max: Duration::from_secs(4 * 60 * 60),
            factor: 0.75,
        }
    }
}

impl RefreshDelays {
    /// clamp(min(cacheDuration, validUntil - now) * factor, min, max)
    ///
    /// Falls back to `max` when the document states neither.
    pub fn next_delay(
        &self,
        cache_duration: Option<u64>,
        valid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        let cache = cache_duration.map(Duration::from_secs);
        let until = valid_until.map(|until| (until - now).to_std().unwrap_or(Duration::ZERO));

        let lifetime = match (cache, until) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return self.max,
        };

        lifetime.mul_f64(self.factor.max(0.0)).clamp(self.min, self.max)
    }
}

#[derive(Debug, Default)]
struct Validators {
    etag: Option<String>,
    last_modified: Option<String>,
    last_delay: Option<Duration>,
}

/// Pulls one metadata document and serves entities from the last good copy
pub struct HttpDocumentSource {
    name: String,
    url: String,
    client: reqwest::Client,
    delays: RefreshDelays,
    validators: Mutex<Validators>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl HttpDocumentSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        delays: RefreshDelays,
        timeout: Duration,
    ) -> MetadataResult<Self> {
        if delays.min > delays.max {
            return Err(MetadataError::Configuration(
                "minimum refresh delay exceeds maximum refresh delay".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client: http_client(timeout)?,
            delays,
            validators: Mutex::new(Validators::default()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn validators(&self) -> std::sync::MutexGuard<'_, Validators> {
        self.validators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn pull(&self) -> MetadataResult<Option<(Vec<u8>, Option<String>, Option<String>)>> {
        let mut request = self.client.get(&self.url);
        {
            let validators = self.validators();
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified.as_str());
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| MetadataError::FetchFailed(format!("GET {} failed: {}", self.url, e)))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MetadataError::FetchFailed(format!(
                "GET {} returned {}",
                self.url,
                response.status()
            )));
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = response.bytes().await.map_err(|e| {
            MetadataError::FetchFailed(format!("Reading {} failed: {}", self.url, e))
        })?;
        Ok(Some((body.to_vec(), etag, last_modified)))
    }
}

#[async_trait]
impl OriginFetcher for HttpDocumentSource {
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
        let started = Instant::now();
        let pulled = self.pull().await;
        let elapsed = started.elapsed().as_secs_f64();

        let (body, etag, last_modified) = match pulled {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                metrics::record_origin_fetch(&self.name, "not_modified", elapsed);
                debug!("{}: {} not modified", self.name, self.url);
                let next_refresh = self.validators().last_delay.or(Some(self.delays.max));
                return Ok(RefreshOutcome::Unchanged { next_refresh });
            }
            Err(e) => {
                metrics::record_origin_fetch(&self.name, "failure", elapsed);
                return Err(e);
            }
        };

        let document = MetadataDocument::parse(&body).map_err(|e| {
            metrics::record_origin_fetch(&self.name, "failure", elapsed);
            MetadataError::FetchFailed(format!("Malformed metadata from {}: {}", self.url, e))
        })?;
        let delay = self.delays.next_delay(
            document.root_cache_duration(),
            document.root_valid_until(),
            context.now,
        );

        let descriptors = filter_documents(vec![document], filters, context)?;
        if descriptors.is_empty() {
            metrics::record_origin_fetch(&self.name, "failure", elapsed);
            return Err(MetadataError::FetchFailed(format!(
                "No entities left in {} after filtering",
                self.url
            )));
        }
        metrics::record_origin_fetch(&self.name, "success", elapsed);

        let snapshot = Arc::new(Snapshot::from_descriptors(&descriptors));
        info!(
            "{}: pulled {} entities from {}, next refresh in {:?}",
            self.name,
            snapshot.len(),
            self.url,
            delay
        );
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        {
            let mut validators = self.validators();
            validators.etag = etag;
            validators.last_modified = last_modified;
            validators.last_delay = Some(delay);
        }

        Ok(RefreshOutcome::Updated {
            descriptors,
            next_refresh: Some(delay),
        })
    }

    fn prefiltered(&self) -> bool {
        true
    }

    fn retry_delay(&self) -> Option<Duration> {
        Some(self.delays.min)
    }
}
