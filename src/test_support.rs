//! Test doubles for the pipeline's I/O seams.
//!
//! Stubs return pre-configured responses and record how they were called,
//! so pipeline behaviour can be checked without geocoding or Overpass
//! services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::{FeatureRecord, GeometryClass, RawElement};
use crate::overpass::ElementSource;
use crate::region::{GeocodeCandidate, Geocoder};
use crate::sink::{FeatureSink, LayerSpec};
use crate::OverpassError;

/// Serve `app` on an ephemeral local port and return its base URL
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener
        .local_addr()
        .expect("test listener should have an address");
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("test server failed");
    });
    format!("http://{}", addr)
}

/// [`Geocoder`] returning fixed candidates or a fixed failure
#[derive(Debug)]
pub struct StubGeocoder {
    response: Result<Vec<GeocodeCandidate>, String>,
    calls: AtomicUsize,
}

impl StubGeocoder {
    pub fn with_candidates(candidates: Vec<GeocodeCandidate>) -> Self {
        Self {
            response: Ok(candidates),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            response: Err(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of lookups issued so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn lookup(&self, _name: &str) -> Result<Vec<GeocodeCandidate>, OverpassError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response
            .clone()
            .map_err(OverpassError::GeocodingUnavailable)
    }
}

/// [`ElementSource`] returning a fixed element list
#[derive(Debug, Default)]
pub struct StubElementSource {
    elements: Vec<RawElement>,
    queries: Mutex<Vec<String>>,
}

impl StubElementSource {
    pub fn with_elements(elements: Vec<RawElement>) -> Self {
        Self {
            elements,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Queries received so far, in order
    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ElementSource for StubElementSource {
    async fn fetch(&self, query: &str) -> Result<Vec<RawElement>, OverpassError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        Ok(self.elements.clone())
    }
}

/// Call observed by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    CreateLayer(String),
    /// Layer class and OSM id of the inserted feature
    Insert(GeometryClass, i64),
    Finish,
}

/// [`FeatureSink`] that records every call and can reject chosen features
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub calls: Vec<SinkCall>,
    pub specs: Vec<LayerSpec>,
    pub records: Vec<FeatureRecord>,
    /// OSM ids whose insert fails
    pub reject_ids: Vec<i64>,
}

impl FeatureSink for RecordingSink {
    fn create_layer(&mut self, spec: &LayerSpec) -> crate::Result<()> {
        self.calls.push(SinkCall::CreateLayer(spec.name.clone()));
        self.specs.push(spec.clone());
        Ok(())
    }

    fn insert(&mut self, class: GeometryClass, record: &FeatureRecord) -> crate::Result<()> {
        if self.reject_ids.contains(&record.osm_id) {
            return Err(OverpassError::Sink(format!("feature {} rejected", record.osm_id)).into());
        }
        self.calls.push(SinkCall::Insert(class, record.osm_id));
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<()> {
        self.calls.push(SinkCall::Finish);
        Ok(())
    }
}
