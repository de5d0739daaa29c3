/// HTTP origin tests against a local axum server
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use federation_metadata::{
    criteria::{CriteriaSet, Criterion},
    error::MetadataError,
    fetch::{
        DynamicHttpSource, HttpDocumentSource, MdqUrlBuilder, RefreshDelays, TemplateEncoding,
        TemplateUrlBuilder,
    },
    index::builtin::entity_id_source_id,
    store::MetadataResolver,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);
const FEDERATION_ETAG: &str = "\"federation-v1\"";

#[derive(Default)]
struct OriginState {
    entities: HashMap<String, serde_json::Value>,
    entity_requests: AtomicUsize,
    document_requests: AtomicUsize,
    not_modified: AtomicUsize,
}

fn entity_json(entity_id: &str) -> serde_json::Value {
    json!({
        "entityID": entity_id,
        "roles": [{
            "role": "idpSso",
            "protocolSupport": ["urn:oasis:names:tc:SAML:2.0:protocol"]
        }]
    })
}

async fn entity(State(state): State<Arc<OriginState>>, Path(identifier): Path<String>) -> Response {
    state.entity_requests.fetch_add(1, Ordering::SeqCst);

    let found = match identifier.strip_prefix("{sha1}") {
        Some(source_id) => state
            .entities
            .iter()
            .find(|(id, _)| entity_id_source_id(id) == source_id)
            .map(|(_, body)| body.clone()),
        None => state.entities.get(&identifier).cloned(),
    };

    match found {
        Some(body) => (
            [(header::CONTENT_TYPE, "application/samlmetadata+json")],
            body.to_string(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn federation(State(state): State<Arc<OriginState>>, headers: HeaderMap) -> Response {
    state.document_requests.fetch_add(1, Ordering::SeqCst);

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        == Some(FEDERATION_ETAG)
    {
        state.not_modified.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let entities: Vec<serde_json::Value> = state.entities.values().cloned().collect();
    let body = json!({
        "name": "test-federation",
        "cacheDuration": 3600,
        "entities": entities,
    });
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ETAG, FEDERATION_ETAG),
        ],
        body.to_string(),
    )
        .into_response()
}

async fn html_page() -> Response {
    ([(header::CONTENT_TYPE, "text/html")], "<html></html>").into_response()
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Start the origin and return its base URL
async fn start_origin(entity_ids: &[&str]) -> (String, Arc<OriginState>) {
    let state = Arc::new(OriginState {
        entities: entity_ids
            .iter()
            .map(|id| (id.to_string(), entity_json(id)))
            .collect(),
        ..Default::default()
    });

    let app = Router::new()
        .route("/entities/:identifier", get(entity))
        .route("/federation.json", get(federation))
        .route("/page/:identifier", get(html_page))
        .route("/broken.json", get(broken))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

fn by_id(entity_id: &str) -> CriteriaSet {
    CriteriaSet::for_entity_id(entity_id).unwrap()
}

#[tokio::test]
async fn test_mdq_lookup_and_not_found() {
    let (base, state) = start_origin(&["https://idp.example.org/idp"]).await;
    let source = DynamicHttpSource::new("mdq", Arc::new(MdqUrlBuilder::new(base)), TIMEOUT).unwrap();
    let resolver = MetadataResolver::builder("mdq", Arc::new(source)).build().unwrap();
    resolver.initialize().await.unwrap();

    let found = resolver
        .resolve(&by_id("https://idp.example.org/idp"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "https://idp.example.org/idp");

    // Served from cache the second time
    resolver
        .resolve(&by_id("https://idp.example.org/idp"))
        .await
        .unwrap();
    assert_eq!(state.entity_requests.load(Ordering::SeqCst), 1);

    // 404 is "not found", not a failure
    assert!(resolver
        .resolve(&by_id("https://unknown.example.org"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_mdq_artifact_lookup_fetches_by_source_id() {
    let (base, state) = start_origin(&["https://idp.example.org/idp"]).await;
    let source = DynamicHttpSource::new("mdq", Arc::new(MdqUrlBuilder::new(base)), TIMEOUT).unwrap();
    let resolver = MetadataResolver::builder("mdq", Arc::new(source)).build().unwrap();
    resolver.initialize().await.unwrap();

    let mut artifact = vec![0x00, 0x04, 0x00, 0x01];
    artifact.extend(hex::decode(entity_id_source_id("https://idp.example.org/idp")).unwrap());
    artifact.extend([7u8; 20]);
    let criteria = CriteriaSet::new().with(Criterion::artifact(artifact).unwrap());

    let found = resolver.resolve(&criteria).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].entity_id, "https://idp.example.org/idp");

    // Now indexed, the entity ID lookup is a cache hit
    resolver
        .resolve(&by_id("https://idp.example.org/idp"))
        .await
        .unwrap();
    assert_eq!(state.entity_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_template_url_builder() {
    let (base, _state) = start_origin(&["urn:example:idp"]).await;
    let builder = TemplateUrlBuilder::new(
        format!("{}/entities/{{entityID}}", base),
        TemplateEncoding::Form,
    );
    let source = DynamicHttpSource::new("template", Arc::new(builder), TIMEOUT).unwrap();
    let resolver = MetadataResolver::builder("template", Arc::new(source))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();

    let found = resolver.resolve(&by_id("urn:example:idp")).await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_strict_mode_turns_bad_responses_into_failures() {
    let (base, _state) = start_origin(&[]).await;
    let template = format!("{}/page/{{entityID}}", base);

    let lenient = DynamicHttpSource::new(
        "lenient",
        Arc::new(TemplateUrlBuilder::new(template.clone(), TemplateEncoding::Form)),
        TIMEOUT,
    )
    .unwrap();
    let resolver = MetadataResolver::builder("lenient", Arc::new(lenient))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    assert!(resolver
        .resolve(&by_id("urn:example:idp"))
        .await
        .unwrap()
        .is_empty());

    let strict = DynamicHttpSource::new(
        "strict",
        Arc::new(TemplateUrlBuilder::new(template, TemplateEncoding::Form)),
        TIMEOUT,
    )
    .unwrap()
    .strict(true);
    let resolver = MetadataResolver::builder("strict", Arc::new(strict))
        .build()
        .unwrap();
    resolver.initialize().await.unwrap();
    assert!(matches!(
        resolver.resolve(&by_id("urn:example:idp")).await,
        Err(MetadataError::ResolutionFailed { .. })
    ));
}

#[tokio::test]
async fn test_full_pull_with_conditional_refresh() {
    let (base, state) = start_origin(&["https://a.example.org", "https://b.example.org"]).await;
    let delays = RefreshDelays {
        min: Duration::from_secs(60),
        max: Duration::from_secs(4 * 3600),
        factor: 0.75,
    };
    let source =
        HttpDocumentSource::new("pull", format!("{}/federation.json", base), delays, TIMEOUT)
            .unwrap();
    let resolver = MetadataResolver::builder("pull", Arc::new(source)).build().unwrap();
    resolver.initialize().await.unwrap();

    assert_eq!(resolver.store().len(), 2);
    let first = resolver.refresh_status();
    assert!(first.last_update.is_some());
    assert!(first.last_error.is_none());

    // 0.75 of the one-hour cacheDuration
    let next = resolver.next_refresh_delay().unwrap();
    assert!(next <= Duration::from_secs(2700));
    assert!(next > Duration::from_secs(2600));

    let delay = resolver.refresh().await.unwrap();
    assert_eq!(delay, Some(Duration::from_secs(2700)));
    assert_eq!(state.document_requests.load(Ordering::SeqCst), 2);
    assert_eq!(state.not_modified.load(Ordering::SeqCst), 1);

    // 304 advances lastRefresh only
    let second = resolver.refresh_status();
    assert_eq!(second.last_update, first.last_update);
    assert!(second.last_refresh >= first.last_refresh);

    let found = resolver.resolve(&by_id("https://b.example.org")).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(state.entity_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_full_pull_schedules_retry() {
    let (base, _state) = start_origin(&[]).await;
    let delays = RefreshDelays {
        min: Duration::from_secs(90),
        ..RefreshDelays::default()
    };
    let source =
        HttpDocumentSource::new("pull", format!("{}/broken.json", base), delays, TIMEOUT).unwrap();
    let resolver = MetadataResolver::builder("pull", Arc::new(source)).build().unwrap();

    // Initialization survives the failed first pull
    resolver.initialize().await.unwrap();
    assert!(resolver.is_initialized());
    assert!(resolver.store().is_empty());

    let status = resolver.refresh_status();
    assert!(status.last_error.is_some());
    assert!(status.last_update.is_none());
    assert_eq!(resolver.retry_delay(), Some(Duration::from_secs(90)));
    assert!(resolver.next_refresh_delay().unwrap() <= Duration::from_secs(90));

    assert!(matches!(
        resolver.refresh().await,
        Err(MetadataError::FetchFailed(_))
    ));
}
