//! Overpass API transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::OverpassConfig;
use crate::models::RawElement;
use crate::OverpassError;

/// Body of a successful Overpass JSON response
#[derive(Debug, Deserialize)]
pub struct OverpassResponse {
    pub elements: Vec<RawElement>,
    /// Set by the server when the query hit a runtime error or limit
    #[serde(default)]
    pub remark: Option<String>,
}

impl OverpassResponse {
    /// Parse a response body, keeping the raw text on failure
    pub fn parse(body: &str) -> Result<Self, OverpassError> {
        serde_json::from_str(body).map_err(|e| OverpassError::MalformedResponse {
            reason: e.to_string(),
            body: body.to_string(),
        })
    }
}

/// Something that runs an Overpass QL query and returns its elements
#[async_trait]
pub trait ElementSource: Send + Sync {
    async fn fetch(&self, query: &str) -> Result<Vec<RawElement>, OverpassError>;
}

/// HTTP client for a single Overpass endpoint. Requests are never retried.
#[derive(Debug, Clone)]
pub struct OverpassClient {
    client: Client,
    url: String,
}

impl OverpassClient {
    /// Create a client for the configured endpoint
    pub fn new(config: &OverpassConfig) -> Result<Self, OverpassError> {
        let url = config.endpoint().ok_or_else(|| {
            OverpassError::Config(format!(
                "Overpass server index {} out of range",
                config.server_index
            ))
        })?;
        Self::with_url(url, config)
    }

    /// Create a client for an explicit endpoint, other settings from `config`
    pub fn with_url(url: &str, config: &OverpassConfig) -> Result<Self, OverpassError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OverpassError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ElementSource for OverpassClient {
    async fn fetch(&self, query: &str) -> Result<Vec<RawElement>, OverpassError> {
        info!("Sending query to {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .query(&[("data", query)])
            .send()
            .await
            .map_err(|e| OverpassError::QueryServiceUnavailable {
                status: e.status().map(|s| s.as_u16()),
                body: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OverpassError::QueryServiceUnavailable {
                status: Some(status.as_u16()),
                body: format!("failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            return Err(OverpassError::QueryServiceUnavailable {
                status: Some(status.as_u16()),
                body,
            });
        }

        let parsed = OverpassResponse::parse(&body)?;
        if let Some(remark) = &parsed.remark {
            warn!("Overpass remark: {}", remark);
        }

        info!("Received {} elements", parsed.elements.len());
        Ok(parsed.elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;
    use axum::{extract::Query, http::StatusCode, routing::get, Router};
    use std::collections::HashMap;

    async fn client_for(app: Router) -> OverpassClient {
        let base_url = serve(app).await;
        let url = format!("{}/api/interpreter", base_url);
        OverpassClient::with_url(&url, &OverpassConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn sends_query_as_data_parameter() {
        let app = Router::new().route(
            "/api/interpreter",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let data = params.get("data").cloned().unwrap_or_default();
                assert_eq!(data, r#"node["amenity"](1.0,2.0,3.0,4.0);out;"#);
                r#"{"version": 0.6, "elements": [{"type": "node", "id": 1, "lat": 1.5, "lon": 2.5}]}"#
            }),
        );
        let client = client_for(app).await;

        let elements = client
            .fetch(r#"node["amenity"](1.0,2.0,3.0,4.0);out;"#)
            .await
            .expect("fetch should succeed");

        assert_eq!(elements, vec![RawElement::node(1, 1.5, 2.5)]);
    }

    #[tokio::test]
    async fn non_success_status_is_service_unavailable() {
        let app = Router::new().route(
            "/api/interpreter",
            get(|| async { (StatusCode::TOO_MANY_REQUESTS, "rate limited") }),
        );
        let client = client_for(app).await;

        let outcome = client.fetch("out;").await;

        match outcome {
            Err(OverpassError::QueryServiceUnavailable { status, body }) => {
                assert_eq!(status, Some(429));
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_malformed_and_kept() {
        let app = Router::new().route(
            "/api/interpreter",
            get(|| async { "<html>runtime error</html>" }),
        );
        let client = client_for(app).await;

        let outcome = client.fetch("out;").await;

        match outcome {
            Err(OverpassError::MalformedResponse { body, .. }) => {
                assert_eq!(body, "<html>runtime error</html>");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn missing_elements_is_malformed() {
        let outcome = OverpassResponse::parse(r#"{"version": 0.6}"#);
        assert!(matches!(outcome, Err(OverpassError::MalformedResponse { .. })));
    }

    #[test]
    fn keeps_server_remark() {
        let parsed = OverpassResponse::parse(
            r#"{"elements": [], "remark": "runtime error: Query timed out"}"#,
        )
        .unwrap();
        assert!(parsed.elements.is_empty());
        assert_eq!(parsed.remark.as_deref(), Some("runtime error: Query timed out"));
    }

    #[tokio::test]
    async fn unreachable_server_is_service_unavailable() {
        let client =
            OverpassClient::with_url("http://127.0.0.1:9/api/interpreter", &OverpassConfig::default())
                .unwrap();

        let outcome = client.fetch("out;").await;

        assert!(matches!(
            outcome,
            Err(OverpassError::QueryServiceUnavailable { status: None, .. })
        ));
    }
}
