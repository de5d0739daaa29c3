/// Federation metadata resolver
///
/// A caching resolver for identity-federation entity metadata: origin
/// fetchers, a filter pipeline, secondary indexes, a concurrent backing
/// store with persistent warm-start, background refresh and cleanup, and a
/// short-lived artifact map.

pub mod api;
pub mod artifact;
pub mod clock;
pub mod config;
pub mod context;
pub mod criteria;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod index;
pub mod jobs;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod store;

pub use criteria::{CriteriaSet, Criterion};
pub use error::{MetadataError, MetadataResult};
pub use metadata::{EntityDescriptor, MetadataDocument, RoleType};
pub use store::MetadataResolver;
