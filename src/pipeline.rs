//! End-to-end query run: request in, layers out.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OutputSettings;
use crate::decompose::decompose;
use crate::materialize::FeatureMaterializer;
use crate::models::{GeometryClass, TagFilter, TemporalSelector};
use crate::overpass::ElementSource;
use crate::query;
use crate::region::{Geocoder, RegionRequest, RegionResolver};
use crate::report::{ElementFailure, FeatureError, LayerReport, PipelineReport};
use crate::schema::SchemaSet;
use crate::sink::{FeatureSink, LayerSpec};
use crate::OverpassError;

/// Validated user intent for one run
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRequest {
    pub tag: TagFilter,
    pub region: RegionRequest,
    pub as_of: Option<TemporalSelector>,
    /// Prefix of the output layer names
    pub layer_prefix: String,
}

impl FeatureRequest {
    pub fn new(tag: TagFilter, region: RegionRequest) -> Self {
        Self {
            tag,
            region,
            as_of: None,
            layer_prefix: "osm".to_string(),
        }
    }

    pub fn as_of(mut self, as_of: TemporalSelector) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_layer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.layer_prefix = prefix.into();
        self
    }

    /// Checks that need no I/O
    pub fn validate(&self) -> Result<(), OverpassError> {
        if self.tag.key().is_empty() {
            return Err(OverpassError::InvalidRequest(
                "tag key must not be empty".to_string(),
            ));
        }
        if self.tag.key().contains('"') {
            return Err(OverpassError::InvalidRequest(format!(
                "tag key '{}' must not contain a double quote",
                self.tag.key()
            )));
        }

        match &self.region {
            RegionRequest::BoundingBox(bbox) => bbox.validate()?,
            RegionRequest::Named(name) if name.trim().is_empty() => {
                return Err(OverpassError::InvalidRequest(
                    "region name must not be empty".to_string(),
                ));
            }
            RegionRequest::Named(_) => {}
        }

        let prefix_ok = !self.layer_prefix.is_empty()
            && self
                .layer_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(OverpassError::InvalidRequest(format!(
                "layer prefix '{}' may only contain ASCII letters, digits and '_'",
                self.layer_prefix
            )));
        }

        if let Some(as_of) = &self.as_of {
            if as_of.is_before_osm_epoch() {
                warn!(
                    "Requested snapshot {} predates OSM history",
                    as_of.to_wire()
                );
            }
        }

        Ok(())
    }
}

/// Query compiler, geocoder and Overpass wired together
#[derive(Clone)]
pub struct Pipeline {
    resolver: RegionResolver,
    source: Arc<dyn ElementSource>,
    output: OutputSettings,
}

impl Pipeline {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        source: Arc<dyn ElementSource>,
        output: OutputSettings,
    ) -> Self {
        Self {
            resolver: RegionResolver::new(geocoder),
            source,
            output,
        }
    }

    /// Validate and resolve the request into its query string
    pub async fn compile(&self, request: &FeatureRequest) -> Result<String, OverpassError> {
        request.validate()?;
        let selector = self.resolver.resolve(&request.region).await?;
        Ok(query::compile(
            &request.tag,
            &selector,
            request.as_of.as_ref(),
        ))
    }

    /// Run the request and hand the resulting layers to `sink`.
    ///
    /// Errors returned here are fatal and leave the sink untouched, except
    /// for failures raised by the sink itself. Element and field problems
    /// are collected in the report instead.
    pub async fn run<S>(
        &self,
        request: &FeatureRequest,
        sink: &mut S,
    ) -> Result<PipelineReport, OverpassError>
    where
        S: FeatureSink + ?Sized,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Run {}: {:?}", run_id, request.region);

        let query = self.compile(request).await?;
        let elements = self.source.fetch(&query).await?;
        if elements.is_empty() {
            info!("Run {}: Overpass returned no elements", run_id);
            return Err(OverpassError::EmptyResultSet);
        }

        let decomposition = decompose(&elements);
        let schemas = SchemaSet::infer(&decomposition);
        let materializer = FeatureMaterializer::new(&self.output, request.as_of.as_ref());

        let mut layers = Vec::new();
        for class in GeometryClass::ALL {
            if decomposition.bucket(class).is_empty() {
                continue;
            }

            let spec = LayerSpec::new(
                &request.layer_prefix,
                class,
                schemas.get(class),
                request.as_of.is_some(),
            );
            sink.create_layer(&spec)
                .map_err(|e| OverpassError::Sink(format!("creating {}: {:#}", spec.name, e)))?;

            let outcome = materializer.materialize(&decomposition, class, schemas.get(class));
            let mut element_failures = outcome.failures;
            let mut inserted = 0;
            for record in &outcome.records {
                match sink.insert(class, record) {
                    Ok(()) => inserted += 1,
                    Err(e) => {
                        warn!("Run {}: sink rejected feature {}: {:#}", run_id, record.osm_id, e);
                        element_failures.push(ElementFailure {
                            osm_type: class.element_kind(),
                            osm_id: record.osm_id,
                            error: FeatureError::Sink {
                                message: format!("{:#}", e),
                            },
                        });
                    }
                }
            }

            info!(
                "Run {}: layer {} got {} of {} features",
                run_id,
                spec.name,
                inserted,
                decomposition.bucket(class).len()
            );
            layers.push(LayerReport {
                class,
                layer_name: spec.name,
                field_count: spec.fields.len(),
                inserted,
                element_failures,
                field_reports: outcome.field_reports,
            });
        }

        sink.finish()
            .map_err(|e| OverpassError::Sink(format!("finishing output: {:#}", e)))?;

        let report = PipelineReport {
            run_id,
            started_at,
            query,
            element_count: elements.len(),
            layers,
            rejected: decomposition.rejected,
        };
        info!("Run {}: {}", run_id, report.summary());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, ElementKind, RawElement};
    use crate::region::GeocodeCandidate;
    use crate::test_support::{RecordingSink, SinkCall, StubElementSource, StubGeocoder};
    use rstest::{fixture, rstest};
    use std::sync::Mutex;

    /// Captures formatted log output of the current thread
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[fixture]
    fn request() -> FeatureRequest {
        FeatureRequest::new(
            TagFilter::exact("amenity", "cafe"),
            RegionRequest::BoundingBox(BoundingBox::new(47.0, 10.0, 47.1, 10.1)),
        )
    }

    fn pipeline(elements: Vec<RawElement>) -> (Pipeline, Arc<StubElementSource>) {
        let source = Arc::new(StubElementSource::with_elements(elements));
        let pipeline = Pipeline::new(
            Arc::new(StubGeocoder::with_candidates(vec![])),
            source.clone(),
            OutputSettings::default(),
        );
        (pipeline, source)
    }

    fn sample_response() -> Vec<RawElement> {
        vec![
            RawElement::node(1, 1.0, 2.0).with_tags([("amenity", "cafe")]),
            RawElement::way(2, vec![10, 11, 10]).with_tags([("building", "yes")]),
            RawElement::node(10, 5.0, 6.0),
            RawElement::node(11, 5.5, 6.5),
        ]
    }

    #[rstest]
    #[tokio::test]
    async fn empty_response_touches_no_sink(request: FeatureRequest) {
        let (pipeline, _) = pipeline(vec![]);
        let mut sink = RecordingSink::default();

        let outcome = pipeline.run(&request, &mut sink).await;

        assert!(matches!(outcome, Err(OverpassError::EmptyResultSet)));
        assert!(sink.calls.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn creates_layers_only_for_populated_buckets(request: FeatureRequest) {
        let (pipeline, source) = pipeline(sample_response());
        let mut sink = RecordingSink::default();

        let report = pipeline.run(&request, &mut sink).await.expect("run should succeed");

        assert_eq!(
            sink.calls,
            vec![
                SinkCall::CreateLayer("osm_points".to_string()),
                SinkCall::Insert(GeometryClass::Point, 1),
                SinkCall::CreateLayer("osm_polygons".to_string()),
                SinkCall::Insert(GeometryClass::Polygon, 2),
                SinkCall::Finish,
            ]
        );
        assert_eq!(report.total_inserted(), 2);
        assert!(report.layer(GeometryClass::Polyline).is_none());
        assert_eq!(source.queries(), vec![report.query.clone()]);
        assert!(report
            .query
            .contains(r#"node["amenity"="cafe"](47.0,10.0,47.1,10.1);"#));
    }

    #[rstest]
    #[tokio::test]
    async fn invalid_request_fails_before_any_io(mut request: FeatureRequest) {
        request.layer_prefix = "bad name".to_string();
        let (pipeline, source) = pipeline(sample_response());
        let mut sink = RecordingSink::default();

        let outcome = pipeline.run(&request, &mut sink).await;

        assert!(matches!(outcome, Err(OverpassError::InvalidRequest(_))));
        assert!(source.queries().is_empty());
        assert!(sink.calls.is_empty());
    }

    #[tokio::test]
    async fn named_region_compiles_area_query() {
        let geocoder = Arc::new(StubGeocoder::with_candidates(vec![GeocodeCandidate {
            osm_type: ElementKind::Relation,
            osm_id: 1155955,
            display_name: "Liechtenstein".to_string(),
        }]));
        let pipeline = Pipeline::new(
            geocoder,
            Arc::new(StubElementSource::with_elements(vec![])),
            OutputSettings::default(),
        );
        let request = FeatureRequest::new(
            TagFilter::wildcard("tourism"),
            RegionRequest::Named("Liechtenstein".to_string()),
        );

        let query = pipeline.compile(&request).await.unwrap();

        assert!(query.contains("area(3601155955)->.searchArea;"));
    }

    #[rstest]
    #[tokio::test]
    async fn historical_runs_add_datetime_field(request: FeatureRequest) {
        let request = request.as_of(TemporalSelector::parse("2014-01-01").unwrap());
        let (pipeline, _) = pipeline(sample_response());
        let mut sink = RecordingSink::default();

        let report = pipeline.run(&request, &mut sink).await.unwrap();

        assert!(report.query.contains(r#"[date:"2014-01-01T00:00:00Z"]"#));
        assert!(sink.specs.iter().all(|s| s.with_datetime));
    }

    #[rstest]
    #[case(RegionRequest::Named("   ".to_string()))]
    #[case(RegionRequest::BoundingBox(BoundingBox::new(1.0, 1.0, 1.0, 2.0)))]
    fn rejects_unusable_regions(#[case] region: RegionRequest) {
        let request = FeatureRequest::new(TagFilter::wildcard("shop"), region);
        assert!(matches!(
            request.validate(),
            Err(OverpassError::InvalidRequest(_))
        ));
    }

    #[rstest]
    #[case("na\"me")]
    #[case("\"")]
    fn rejects_quotes_in_keys(#[case] key: &str) {
        let request = FeatureRequest::new(
            TagFilter::wildcard(key),
            RegionRequest::Named("Vaduz".to_string()),
        );
        assert!(matches!(
            request.validate(),
            Err(OverpassError::InvalidRequest(_))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn early_snapshot_is_warned_about_once(request: FeatureRequest) {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let request = request.as_of(TemporalSelector::parse("2003-01-01").unwrap());
        let (pipeline, _) = pipeline(sample_response());
        let mut sink = RecordingSink::default();

        pipeline.run(&request, &mut sink).await.unwrap();

        assert_eq!(logs.contents().matches("predates OSM history").count(), 1);
    }
}
