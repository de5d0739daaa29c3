/// Validity window enforcement
use super::{FilterContext, MetadataFilter};
use crate::{
    error::{MetadataError, MetadataResult},
    metadata::MetadataDocument,
};
use chrono::Duration;

/// Requires a validUntil on the document root, in the future and no further
/// out than the configured maximum
#[derive(Debug, Clone, Default)]
pub struct RequiredValidUntilFilter {
    max_validity_interval: Option<Duration>,
}

impl RequiredValidUntilFilter {
    pub fn new(max_validity_interval: Option<Duration>) -> Self {
        Self {
            max_validity_interval: max_validity_interval.filter(|d| *d > Duration::zero()),
        }
    }
}

impl MetadataFilter for RequiredValidUntilFilter {
    fn name(&self) -> &str {
        "RequiredValidUntil"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        let valid_until = document.root_valid_until().ok_or_else(|| {
            MetadataError::filter_failed(self.name(), "metadata root has no validUntil")
        })?;

        if valid_until <= context.now {
            return Err(MetadataError::filter_failed(
                self.name(),
                format!("metadata expired at {}", valid_until.to_rfc3339()),
            ));
        }

        if let Some(max) = self.max_validity_interval {
            if valid_until - context.now > max {
                return Err(MetadataError::filter_failed(
                    self.name(),
                    format!(
                        "validUntil {} is more than {}s in the future",
                        valid_until.to_rfc3339(),
                        max.num_seconds()
                    ),
                ));
            }
        }

        Ok(Some(document))
    }
}
