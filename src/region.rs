//! Spatial extent resolution.
//!
//! Explicit bounding boxes pass straight through after validation. Named
//! regions are geocoded and mapped onto the Overpass area derived from the
//! first administrative boundary relation among the candidates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GeocoderConfig;
use crate::models::{BoundingBox, ElementKind, SpatialSelector};
use crate::OverpassError;

/// Spatial part of a user request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RegionRequest {
    BoundingBox(BoundingBox),
    Named(String),
}

/// One geocoding hit, in service order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeocodeCandidate {
    pub osm_type: ElementKind,
    pub osm_id: i64,
    pub display_name: String,
}

/// Free-text place lookup
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Candidates in the order the service ranked them
    async fn lookup(&self, name: &str) -> Result<Vec<GeocodeCandidate>, OverpassError>;
}

/// [`Geocoder`] backed by a Nominatim `/search` endpoint
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    config: GeocoderConfig,
}

impl NominatimGeocoder {
    pub fn new(config: GeocoderConfig) -> Result<Self, OverpassError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OverpassError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn lookup(&self, name: &str) -> Result<Vec<GeocodeCandidate>, OverpassError> {
        let url = self.search_url();
        debug!("Geocoding '{}' via {}", name, url);

        let limit = self.config.limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("q", name), ("format", "jsonv2"), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| OverpassError::GeocodingUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OverpassError::GeocodingUnavailable(format!(
                "{} returned status {}",
                url, status
            )));
        }

        let entries = response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| {
                OverpassError::GeocodingUnavailable(format!("unreadable geocoding response: {}", e))
            })?;

        // Postcode and similar results carry no OSM object
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<GeocodeCandidate>(entry) {
                Ok(candidate) => Some(candidate),
                Err(e) => {
                    debug!("Skipping geocoding result without OSM object: {}", e);
                    None
                }
            })
            .collect())
    }
}

/// Turns a [`RegionRequest`] into a [`SpatialSelector`]
#[derive(Clone)]
pub struct RegionResolver {
    geocoder: Arc<dyn Geocoder>,
}

impl RegionResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }

    /// Resolve a request, issuing at most one geocoding call.
    pub async fn resolve(&self, request: &RegionRequest) -> Result<SpatialSelector, OverpassError> {
        match request {
            RegionRequest::BoundingBox(bbox) => {
                bbox.validate()?;
                Ok(SpatialSelector::BoundingBox(*bbox))
            }
            RegionRequest::Named(name) => {
                let candidates = self.geocoder.lookup(name).await?;
                let relation = select_boundary(&candidates).ok_or_else(|| {
                    warn!(
                        "No relation among {} geocoding candidates for '{}'",
                        candidates.len(),
                        name
                    );
                    OverpassError::RegionNotFound { name: name.clone() }
                })?;

                let selector = SpatialSelector::from_relation(relation.osm_id).ok_or_else(|| {
                    warn!("Relation id {} for '{}' is out of range", relation.osm_id, name);
                    OverpassError::RegionNotFound { name: name.clone() }
                })?;

                info!(
                    "Resolved '{}' to relation {} ({})",
                    name, relation.osm_id, relation.display_name
                );
                Ok(selector)
            }
        }
    }
}

/// First relation-typed candidate; nodes and ways cannot back an area.
fn select_boundary(candidates: &[GeocodeCandidate]) -> Option<&GeocodeCandidate> {
    candidates
        .iter()
        .find(|c| c.osm_type == ElementKind::Relation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve, StubGeocoder};
    use axum::{extract::Query, routing::get, Json, Router};
    use rstest::rstest;
    use std::collections::HashMap;

    fn candidate(osm_type: ElementKind, osm_id: i64, name: &str) -> GeocodeCandidate {
        GeocodeCandidate {
            osm_type,
            osm_id,
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn bounding_box_needs_no_lookup() {
        let geocoder = Arc::new(StubGeocoder::with_candidates(vec![]));
        let resolver = RegionResolver::new(geocoder.clone());
        let bbox = BoundingBox::new(47.0, 10.0, 47.1, 10.1);

        let selector = resolver
            .resolve(&RegionRequest::BoundingBox(bbox))
            .await
            .expect("bbox should resolve");

        assert_eq!(selector, SpatialSelector::BoundingBox(bbox));
        assert_eq!(geocoder.calls(), 0);
    }

    #[tokio::test]
    async fn degenerate_bounding_box_is_rejected() {
        let resolver = RegionResolver::new(Arc::new(StubGeocoder::with_candidates(vec![])));
        let bbox = BoundingBox::new(47.1, 10.0, 47.0, 10.1);

        let outcome = resolver.resolve(&RegionRequest::BoundingBox(bbox)).await;

        assert!(matches!(outcome, Err(OverpassError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn picks_first_relation_candidate() {
        let geocoder = Arc::new(StubGeocoder::with_candidates(vec![
            candidate(ElementKind::Node, 1, "Vaduz, bus stop"),
            candidate(ElementKind::Relation, 1155955, "Vaduz"),
            candidate(ElementKind::Relation, 1155956, "Vaduz (other)"),
        ]));
        let resolver = RegionResolver::new(geocoder.clone());

        let selector = resolver
            .resolve(&RegionRequest::Named("Vaduz".to_string()))
            .await
            .expect("region should resolve");

        assert_eq!(
            selector,
            SpatialSelector::NamedArea {
                area_id: 3_601_155_955
            }
        );
        assert_eq!(geocoder.calls(), 1);
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![candidate(ElementKind::Node, 42, "Cafe Central")])]
    #[case(vec![candidate(ElementKind::Way, 7, "Town hall"), candidate(ElementKind::Node, 8, "Fountain")])]
    #[tokio::test]
    async fn non_relation_results_mean_region_not_found(#[case] candidates: Vec<GeocodeCandidate>) {
        let resolver = RegionResolver::new(Arc::new(StubGeocoder::with_candidates(candidates)));

        let outcome = resolver
            .resolve(&RegionRequest::Named("Cafe Central".to_string()))
            .await;

        assert!(matches!(
            outcome,
            Err(OverpassError::RegionNotFound { ref name }) if name == "Cafe Central"
        ));
    }

    #[tokio::test]
    async fn out_of_range_relation_id_is_not_found() {
        let resolver = RegionResolver::new(Arc::new(StubGeocoder::with_candidates(vec![
            candidate(ElementKind::Relation, i64::MAX, "Nowhere"),
        ])));

        let outcome = resolver
            .resolve(&RegionRequest::Named("Nowhere".to_string()))
            .await;

        assert!(matches!(outcome, Err(OverpassError::RegionNotFound { .. })));
    }

    #[tokio::test]
    async fn geocoder_failure_surfaces_as_unavailable() {
        let resolver = RegionResolver::new(Arc::new(StubGeocoder::failing("connection refused")));

        let outcome = resolver
            .resolve(&RegionRequest::Named("Vaduz".to_string()))
            .await;

        assert!(matches!(outcome, Err(OverpassError::GeocodingUnavailable(_))));
    }

    fn nominatim_config(base_url: String) -> GeocoderConfig {
        GeocoderConfig {
            base_url,
            ..GeocoderConfig::default()
        }
    }

    #[tokio::test]
    async fn nominatim_parses_search_results() {
        let app = Router::new().route(
            "/search",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("q").map(String::as_str), Some("Liechtenstein"));
                assert_eq!(params.get("format").map(String::as_str), Some("jsonv2"));
                Json(serde_json::json!([
                    {"place_id": 1, "osm_type": "relation", "osm_id": 1155955,
                     "display_name": "Liechtenstein", "lat": "47.1", "lon": "9.5"}
                ]))
            }),
        );
        let base_url = serve(app).await;
        let geocoder = NominatimGeocoder::new(nominatim_config(base_url)).unwrap();

        let candidates = geocoder.lookup("Liechtenstein").await.expect("lookup should work");

        assert_eq!(
            candidates,
            vec![candidate(ElementKind::Relation, 1155955, "Liechtenstein")]
        );
    }

    #[tokio::test]
    async fn entries_without_osm_object_are_skipped() {
        let app = Router::new().route(
            "/search",
            get(|| async {
                Json(serde_json::json!([
                    {"place_id": 1, "display_name": "10115, Berlin", "type": "postcode"},
                    {"place_id": 2, "osm_type": "relation", "osm_id": 62422,
                     "display_name": "Berlin, Deutschland"}
                ]))
            }),
        );
        let base_url = serve(app).await;
        let geocoder = NominatimGeocoder::new(nominatim_config(base_url)).unwrap();
        let resolver = RegionResolver::new(Arc::new(geocoder));

        let selector = resolver
            .resolve(&RegionRequest::Named("Berlin".to_string()))
            .await
            .expect("the relation candidate should be used");

        assert_eq!(
            selector,
            SpatialSelector::NamedArea {
                area_id: 3_600_062_422
            }
        );
    }

    #[tokio::test]
    async fn nominatim_error_status_is_unavailable() {
        let app = Router::new().route(
            "/search",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let base_url = serve(app).await;
        let geocoder = NominatimGeocoder::new(nominatim_config(base_url)).unwrap();

        let outcome = geocoder.lookup("Liechtenstein").await;

        assert!(matches!(outcome, Err(OverpassError::GeocodingUnavailable(_))));
    }

    #[tokio::test]
    async fn nominatim_garbage_is_unavailable() {
        let app = Router::new().route("/search", get(|| async { "<html>not json</html>" }));
        let base_url = serve(app).await;
        let geocoder = NominatimGeocoder::new(nominatim_config(base_url)).unwrap();

        let outcome = geocoder.lookup("Liechtenstein").await;

        assert!(matches!(outcome, Err(OverpassError::GeocodingUnavailable(_))));
    }
}
