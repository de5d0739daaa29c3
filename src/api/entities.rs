/// Metadata query endpoints
///
/// - `GET /entities/:entityID` resolves one entity
/// - `GET /entities?role=&value=&artifact=` resolves through secondary criteria
/// - `DELETE /entities/:entityID` and `DELETE /entities` drop cached data
use crate::{
    context::AppContext,
    criteria::{CriteriaSet, Criterion},
    error::{MetadataError, MetadataResult},
    metadata::{EntityDescriptor, RoleType},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

/// Build entity routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/entities", get(query_entities).delete(clear_all))
        .route("/entities/:entity_id", get(get_entity).delete(clear_entity))
}

#[derive(Debug, Default, Deserialize)]
pub struct EntityQuery {
    pub role: Option<String>,
    pub value: Option<String>,
    /// Base64 artifact
    pub artifact: Option<String>,
}

/// Response listing resolved descriptors
#[derive(Debug, Serialize, Deserialize)]
pub struct EntitiesResponse {
    pub entities: Vec<EntityDescriptor>,
}

fn role_criterion(role: &str) -> MetadataResult<Criterion> {
    RoleType::from_str(role)
        .map(Criterion::role)
        .map_err(MetadataError::InvalidArgument)
}

fn into_owned(descriptors: Vec<Arc<EntityDescriptor>>) -> Vec<EntityDescriptor> {
    descriptors.into_iter().map(|d| d.as_ref().clone()).collect()
}

/// Resolve a single entity; several descriptors for the same ID are all returned
async fn get_entity(
    State(ctx): State<AppContext>,
    Path(entity_id): Path<String>,
    Query(query): Query<EntityQuery>,
) -> MetadataResult<Json<EntitiesResponse>> {
    let mut criteria = CriteriaSet::for_entity_id(entity_id.clone())?;
    if let Some(role) = query.role.as_deref() {
        criteria.add(role_criterion(role)?);
    }

    let descriptors = ctx.resolver.resolve(&criteria).await?;
    if descriptors.is_empty() {
        return Err(MetadataError::NotFound(entity_id));
    }
    Ok(Json(EntitiesResponse {
        entities: into_owned(descriptors),
    }))
}

/// Resolve by role, indexed value or artifact; no match is an empty list
async fn query_entities(
    State(ctx): State<AppContext>,
    Query(query): Query<EntityQuery>,
) -> MetadataResult<Json<EntitiesResponse>> {
    let mut criteria = CriteriaSet::new();
    if let Some(role) = query.role.as_deref() {
        criteria.add(role_criterion(role)?);
    }
    if let Some(value) = query.value {
        criteria.add(Criterion::string(value)?);
    }
    if let Some(artifact) = query.artifact.as_deref() {
        criteria.add(Criterion::artifact_base64(artifact)?);
    }
    if criteria.is_empty() {
        return Err(MetadataError::InvalidArgument(
            "at least one of role, value or artifact is required".to_string(),
        ));
    }

    let descriptors = ctx.resolver.resolve(&criteria).await?;
    Ok(Json(EntitiesResponse {
        entities: into_owned(descriptors),
    }))
}

async fn clear_entity(
    State(ctx): State<AppContext>,
    Path(entity_id): Path<String>,
) -> MetadataResult<StatusCode> {
    ctx.resolver.clear_entity(&entity_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_all(State(ctx): State<AppContext>) -> MetadataResult<StatusCode> {
    ctx.resolver.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}
