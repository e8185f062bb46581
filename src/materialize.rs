//! Feature record construction.
//!
//! Failures are isolated: a broken element is reported and skipped, a
//! rejected attribute is reported and left out of its record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::OutputSettings;
use crate::decompose::Decomposition;
use crate::models::{FeatureGeometry, FeatureRecord, GeometryClass, RawElement, TemporalSelector};
use crate::report::{ElementFailure, FeatureError, FieldFailure, FieldFailureReason, RecordReport};
use crate::schema::{is_reserved_field, sanitize_field_name, AttributeSchema};

/// Records built for one geometry class, with everything that went wrong
#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub records: Vec<FeatureRecord>,
    pub failures: Vec<ElementFailure>,
    /// Only records with at least one rejected field
    pub field_reports: Vec<RecordReport>,
}

#[derive(Debug, Clone)]
pub struct FeatureMaterializer {
    text_field_width: usize,
    captured_at: Option<DateTime<Utc>>,
}

impl FeatureMaterializer {
    pub fn new(settings: &OutputSettings, as_of: Option<&TemporalSelector>) -> Self {
        Self {
            text_field_width: settings.text_field_width,
            captured_at: as_of.map(TemporalSelector::instant),
        }
    }

    /// Build one record per element of the `class` bucket
    pub fn materialize(
        &self,
        decomposition: &Decomposition<'_>,
        class: GeometryClass,
        schema: &AttributeSchema,
    ) -> MaterializeOutcome {
        let mut outcome = MaterializeOutcome::default();

        for element in decomposition.bucket(class) {
            let geometry = match build_geometry(decomposition, class, element) {
                Ok(geometry) => geometry,
                Err(error) => {
                    warn!("Skipping {} {}: {}", element.kind.as_str(), element.id, error);
                    outcome.failures.push(ElementFailure {
                        osm_type: element.kind,
                        osm_id: element.id,
                        error,
                    });
                    continue;
                }
            };

            let (attributes, field_failures) = self.populate(element, schema);
            if !field_failures.is_empty() {
                for failure in &field_failures {
                    warn!(
                        "Feature {}: tag '{}' not written ({:?})",
                        element.id, failure.tag_key, failure.reason
                    );
                }
                outcome.field_reports.push(RecordReport {
                    osm_id: element.id,
                    field_failures,
                });
            }

            outcome.records.push(FeatureRecord {
                osm_id: element.id,
                geometry,
                attributes,
                captured_at: self.captured_at,
            });
        }

        outcome
    }

    fn populate(
        &self,
        element: &RawElement,
        schema: &AttributeSchema,
    ) -> (BTreeMap<String, String>, Vec<FieldFailure>) {
        let mut attributes = BTreeMap::new();
        let mut failures = Vec::new();

        for (key, value) in element.tags() {
            match self.check_field(key, value, schema, &attributes) {
                Ok(field) => {
                    attributes.insert(field, value.clone());
                }
                Err(failure) => failures.push(failure),
            }
        }

        (attributes, failures)
    }

    /// Field name for a tag, or why it cannot be written
    fn check_field(
        &self,
        key: &str,
        value: &str,
        schema: &AttributeSchema,
        written: &BTreeMap<String, String>,
    ) -> Result<String, FieldFailure> {
        let field = sanitize_field_name(key);
        let fail = |reason| FieldFailure {
            tag_key: key.to_string(),
            field: field.clone(),
            reason,
        };

        if field.is_empty() {
            return Err(fail(FieldFailureReason::EmptyName));
        }
        if is_reserved_field(&field) {
            return Err(fail(FieldFailureReason::ReservedName));
        }
        if !schema.contains(&field) {
            return Err(fail(FieldFailureReason::NotInSchema));
        }
        if written.contains_key(&field) {
            return Err(fail(FieldFailureReason::DuplicateName));
        }

        let len = value.chars().count();
        if len > self.text_field_width {
            return Err(fail(FieldFailureReason::ValueTooLong {
                len,
                max: self.text_field_width,
            }));
        }

        Ok(field)
    }
}

fn build_geometry(
    decomposition: &Decomposition<'_>,
    class: GeometryClass,
    element: &RawElement,
) -> Result<FeatureGeometry, FeatureError> {
    match class {
        GeometryClass::Point => decomposition
            .resolve_point(element)
            .map(FeatureGeometry::Point),
        GeometryClass::Polyline => decomposition
            .resolve_way(element)
            .map(FeatureGeometry::Polyline),
        GeometryClass::Polygon => decomposition
            .resolve_way(element)
            .map(|ring| FeatureGeometry::Polygon(geo::Polygon::new(ring, vec![]))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::decompose;
    use crate::schema::SchemaSet;
    use geo::Coord;

    fn settings(width: usize) -> OutputSettings {
        OutputSettings {
            text_field_width: width,
            ..OutputSettings::default()
        }
    }

    fn run(elements: &[RawElement], class: GeometryClass) -> MaterializeOutcome {
        let decomposition = decompose(elements);
        let schemas = SchemaSet::infer(&decomposition);
        FeatureMaterializer::new(&settings(255), None).materialize(
            &decomposition,
            class,
            schemas.get(class),
        )
    }

    #[test]
    fn materializes_points_and_polygons() {
        let elements = vec![
            RawElement::node(1, 1.0, 2.0).with_tags([("amenity", "cafe")]),
            RawElement::way(2, vec![10, 11, 10]).with_tags([("building", "yes")]),
            RawElement::node(10, 5.0, 6.0),
            RawElement::node(11, 5.5, 6.5),
        ];

        let points = run(&elements, GeometryClass::Point);
        let polygons = run(&elements, GeometryClass::Polygon);

        assert_eq!(points.records.len(), 1);
        assert_eq!(points.records[0].osm_id, 1);
        assert_eq!(
            points.records[0].geometry,
            FeatureGeometry::Point(geo::Point::new(2.0, 1.0))
        );
        assert_eq!(points.records[0].attributes["amenity"], "cafe");

        assert_eq!(polygons.records.len(), 1);
        assert_eq!(polygons.records[0].osm_id, 2);
        match &polygons.records[0].geometry {
            FeatureGeometry::Polygon(polygon) => {
                let ring = &polygon.exterior().0;
                assert_eq!(ring.first(), ring.last());
                assert_eq!(ring[0], Coord { x: 6.0, y: 5.0 });
            }
            other => panic!("expected polygon, got {:?}", other),
        }
    }

    #[test]
    fn unresolved_way_fails_alone() {
        let elements = vec![
            RawElement::way(7, vec![10, 12]).with_tags([("highway", "path")]),
            RawElement::way(8, vec![10, 11]).with_tags([("highway", "track")]),
            RawElement::node(10, 0.0, 0.0),
            RawElement::node(11, 1.0, 1.0),
        ];

        let outcome = run(&elements, GeometryClass::Polyline);

        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].osm_id, 8);
        assert_eq!(
            outcome.failures,
            vec![ElementFailure {
                osm_type: crate::models::ElementKind::Way,
                osm_id: 7,
                error: FeatureError::UnresolvedNodeReference {
                    way_id: 7,
                    node_id: 12
                },
            }]
        );
    }

    #[test]
    fn sanitizes_attribute_names_like_the_schema() {
        let elements = vec![RawElement::node(1, 0.0, 0.0)
            .with_tags([("addr:street", "Main St"), ("name", "Cafe")])];

        let outcome = run(&elements, GeometryClass::Point);

        let record = &outcome.records[0];
        assert_eq!(record.attributes["addrstreet"], "Main St");
        assert_eq!(record.attributes["name"], "Cafe");
        assert!(outcome.field_reports.is_empty());
    }

    #[test]
    fn rejected_fields_do_not_abort_the_record() {
        let elements = vec![RawElement::node(1, 0.0, 0.0).with_tags([
            ("osm_id", "123"),
            ("name", "ok"),
            ("description", "x".repeat(300).as_str()),
            (":", "nothing left"),
        ])];
        let decomposition = decompose(&elements);
        let schemas = SchemaSet::infer(&decomposition);

        let outcome = FeatureMaterializer::new(&settings(255), None).materialize(
            &decomposition,
            GeometryClass::Point,
            &schemas.points,
        );

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[0];
        assert_eq!(record.attributes.keys().collect::<Vec<_>>(), vec!["name"]);

        let reasons: Vec<_> = outcome.field_reports[0]
            .field_failures
            .iter()
            .map(|f| (f.tag_key.as_str(), f.reason.clone()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (":", FieldFailureReason::EmptyName),
                ("description", FieldFailureReason::ValueTooLong { len: 300, max: 255 }),
                ("osm_id", FieldFailureReason::ReservedName),
            ]
        );
    }

    #[test]
    fn colliding_keys_keep_the_first_field() {
        let elements =
            vec![RawElement::node(1, 0.0, 0.0).with_tags([("a:b", "first"), ("ab", "second")])];

        let outcome = run(&elements, GeometryClass::Point);

        assert_eq!(outcome.records[0].attributes["ab"], "first");
        assert_eq!(
            outcome.field_reports[0].field_failures[0].reason,
            FieldFailureReason::DuplicateName
        );
    }

    #[test]
    fn schema_drift_is_reported_not_silent() {
        let elements = vec![RawElement::node(1, 0.0, 0.0).with_tags([("name", "A")])];
        let decomposition = decompose(&elements);

        let outcome = FeatureMaterializer::new(&settings(255), None).materialize(
            &decomposition,
            GeometryClass::Point,
            &AttributeSchema::default(),
        );

        assert!(outcome.records[0].attributes.is_empty());
        assert_eq!(
            outcome.field_reports[0].field_failures[0].reason,
            FieldFailureReason::NotInSchema
        );
    }

    #[test]
    fn stamps_records_with_snapshot_time() {
        let elements = vec![RawElement::node(1, 0.0, 0.0).with_tags([("name", "A")])];
        let decomposition = decompose(&elements);
        let schemas = SchemaSet::infer(&decomposition);
        let as_of = TemporalSelector::parse("2012-09-12").unwrap();

        let outcome = FeatureMaterializer::new(&settings(255), Some(&as_of)).materialize(
            &decomposition,
            GeometryClass::Point,
            &schemas.points,
        );

        assert_eq!(outcome.records[0].captured_at, Some(as_of.instant()));
    }
}
