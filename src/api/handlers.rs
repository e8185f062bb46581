use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::error;

use super::{AppState, FeatureRequestBody};
use crate::sink::CollectingSink;
use crate::OverpassError;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Configured Overpass endpoints and the one in use
pub async fn get_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "servers": state.config.overpass.servers,
        "active": state.config.overpass.endpoint(),
    }))
}

/// Tag keys and values offered to users
pub async fn get_vocabulary(State(state): State<AppState>) -> Response {
    match &state.vocabulary {
        Some(vocabulary) => Json(vocabulary).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Compile a request into Overpass QL without running it
pub async fn compile_query(
    State(state): State<AppState>,
    Json(body): Json<FeatureRequestBody>,
) -> Response {
    let request = match body.into_request(state.vocabulary.as_ref()) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    match state.pipeline.compile(&request).await {
        Ok(query) => Json(json!({ "query": query })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Run a request and return its layers as GeoJSON
pub async fn fetch_features(
    State(state): State<AppState>,
    Json(body): Json<FeatureRequestBody>,
) -> Response {
    let request = match body.into_request(state.vocabulary.as_ref()) {
        Ok(request) => request,
        Err(e) => return error_response(e),
    };

    let mut sink = CollectingSink::new();
    match state.pipeline.run(&request, &mut sink).await {
        Ok(report) => {
            let layers: Vec<_> = sink
                .into_collections()
                .into_iter()
                .map(|(spec, collection)| {
                    json!({
                        "name": spec.name,
                        "class": spec.class,
                        "fields": spec.fields,
                        "features": collection,
                    })
                })
                .collect();
            Json(json!({ "report": report, "layers": layers })).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(e: OverpassError) -> Response {
    let (status, kind) = match &e {
        OverpassError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        OverpassError::RegionNotFound { .. } => (StatusCode::NOT_FOUND, "region_not_found"),
        OverpassError::EmptyResultSet => (StatusCode::NOT_FOUND, "empty_result_set"),
        OverpassError::GeocodingUnavailable(_) => {
            (StatusCode::BAD_GATEWAY, "geocoding_unavailable")
        }
        OverpassError::QueryServiceUnavailable { .. } => {
            (StatusCode::BAD_GATEWAY, "query_service_unavailable")
        }
        OverpassError::MalformedResponse { .. } => (StatusCode::BAD_GATEWAY, "malformed_response"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    if status.is_server_error() {
        error!("Request failed: {}", e);
    }

    (status, Json(json!({ "error": kind, "message": e.to_string() }))).into_response()
}
