//! Splits a flat Overpass element list into geometry buckets.

use std::collections::HashMap;

use geo::{Coord, LineString, Point};
use tracing::{debug, warn};

use crate::models::{ElementKind, GeometryClass, RawElement};
use crate::report::{ElementFailure, FeatureError};

/// Node id -> coordinate, built once per response
#[derive(Debug, Default)]
pub struct NodeIndex {
    coords: HashMap<i64, Option<Coord<f64>>>,
}

impl NodeIndex {
    pub fn build(elements: &[RawElement]) -> Self {
        let mut coords = HashMap::new();
        for element in elements.iter().filter(|e| e.kind == ElementKind::Node) {
            let coord = match (element.lat, element.lon) {
                (Some(lat), Some(lon)) => Some(Coord { x: lon, y: lat }),
                _ => None,
            };
            coords.entry(element.id).or_insert(coord);
        }
        Self { coords }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    fn lookup(&self, way_id: i64, node_id: i64) -> Result<Coord<f64>, FeatureError> {
        match self.coords.get(&node_id) {
            Some(Some(coord)) => Ok(*coord),
            Some(None) => Err(FeatureError::MissingCoordinates { node_id }),
            None => Err(FeatureError::UnresolvedNodeReference { way_id, node_id }),
        }
    }
}

/// Tagged elements grouped by geometry class, in response order
#[derive(Debug)]
pub struct Decomposition<'a> {
    nodes: NodeIndex,
    pub points: Vec<&'a RawElement>,
    pub lines: Vec<&'a RawElement>,
    pub polygons: Vec<&'a RawElement>,
    /// Ways that cannot be classified at all
    pub rejected: Vec<ElementFailure>,
}

impl<'a> Decomposition<'a> {
    pub fn bucket(&self, class: GeometryClass) -> &[&'a RawElement] {
        match class {
            GeometryClass::Point => &self.points,
            GeometryClass::Polyline => &self.lines,
            GeometryClass::Polygon => &self.polygons,
        }
    }

    pub fn node_index(&self) -> &NodeIndex {
        &self.nodes
    }

    pub fn resolve_point(&self, node: &RawElement) -> Result<Point<f64>, FeatureError> {
        match (node.lat, node.lon) {
            (Some(lat), Some(lon)) => Ok(Point::new(lon, lat)),
            _ => Err(FeatureError::MissingCoordinates { node_id: node.id }),
        }
    }

    /// Coordinates of a way, in node order. Closed ways come back closed.
    pub fn resolve_way(&self, way: &RawElement) -> Result<LineString<f64>, FeatureError> {
        if way.nodes.is_empty() {
            return Err(FeatureError::DegenerateWay { way_id: way.id });
        }

        way.nodes
            .iter()
            .map(|node_id| self.nodes.lookup(way.id, *node_id))
            .collect::<Result<Vec<_>, _>>()
            .map(LineString::new)
    }
}

/// Classify elements into point, line and polygon candidates.
///
/// Only tagged nodes and ways qualify; untagged elements only serve as
/// geometry support. Relations are never materialized.
pub fn decompose(elements: &[RawElement]) -> Decomposition<'_> {
    let mut decomposition = Decomposition {
        nodes: NodeIndex::build(elements),
        points: Vec::new(),
        lines: Vec::new(),
        polygons: Vec::new(),
        rejected: Vec::new(),
    };
    let mut relations = 0usize;

    for element in elements {
        match element.kind {
            ElementKind::Node if element.is_tagged() => decomposition.points.push(element),
            ElementKind::Way if element.is_tagged() => match GeometryClass::of_way(&element.nodes) {
                Some(GeometryClass::Polygon) => decomposition.polygons.push(element),
                Some(_) => decomposition.lines.push(element),
                None => {
                    warn!("Rejecting way {} without nodes", element.id);
                    decomposition.rejected.push(ElementFailure {
                        osm_type: ElementKind::Way,
                        osm_id: element.id,
                        error: FeatureError::DegenerateWay { way_id: element.id },
                    });
                }
            },
            ElementKind::Relation => relations += 1,
            _ => {}
        }
    }

    debug!(
        "Decomposed {} elements: {} points, {} lines, {} polygons, {} rejected, {} relations skipped, {} nodes indexed",
        elements.len(),
        decomposition.points.len(),
        decomposition.lines.len(),
        decomposition.polygons.len(),
        decomposition.rejected.len(),
        relations,
        decomposition.nodes.len()
    );

    decomposition
}
