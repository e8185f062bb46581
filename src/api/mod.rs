pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{Config, TagVocabulary};
use crate::models::{BoundingBox, TagFilter, TemporalSelector};
use crate::pipeline::{FeatureRequest, Pipeline};
use crate::region::RegionRequest;
use crate::OverpassError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub config: Config,
    /// When set, tag choices are checked against it
    pub vocabulary: Option<TagVocabulary>,
}

/// JSON body accepted by the query endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureRequestBody {
    pub key: String,
    /// Empty means "any value"
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub region: Option<String>,
    /// `YYYY-MM-DD` or RFC 3339
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub layer_prefix: Option<String>,
}

impl FeatureRequestBody {
    /// Turn the loosely shaped body into a [`FeatureRequest`].
    ///
    /// The pipeline validates it before any I/O.
    pub fn into_request(
        self,
        vocabulary: Option<&TagVocabulary>,
    ) -> Result<FeatureRequest, OverpassError> {
        let tag = match vocabulary {
            Some(vocabulary) => vocabulary.filter_for(&self.key, &self.values)?,
            None if self.values.is_empty() => TagFilter::wildcard(self.key),
            None => TagFilter::any_of(self.key, self.values)?,
        };

        let region = match (self.bbox, self.region) {
            (Some(bbox), None) => RegionRequest::BoundingBox(bbox),
            (None, Some(name)) => RegionRequest::Named(name),
            _ => {
                return Err(OverpassError::InvalidRequest(
                    "exactly one of 'bbox' and 'region' is required".to_string(),
                ))
            }
        };

        let mut request = FeatureRequest::new(tag, region);
        if let Some(date) = self.date {
            request = request.as_of(TemporalSelector::parse(&date)?);
        }
        if let Some(prefix) = self.layer_prefix {
            request = request.with_layer_prefix(prefix);
        }

        Ok(request)
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/servers", get(handlers::get_servers))
        .route("/vocabulary", get(handlers::get_vocabulary))
        .route("/query", post(handlers::compile_query))
        .route("/features", post(handlers::fetch_features));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
