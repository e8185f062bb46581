use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::OverpassError;

/// Offset Overpass adds to a relation id to address the derived area
pub const AREA_ID_OFFSET: i64 = 3_600_000_000;

/// OSM element kinds as they appear in Overpass JSON and QL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl ElementKind {
    /// Kinds unioned into every compiled query, in emission order
    pub const QUERYABLE: [ElementKind; 3] =
        [ElementKind::Node, ElementKind::Way, ElementKind::Relation];

    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
        }
    }
}

/// Value constraint of a tag filter
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum TagMode {
    Exact(String),
    /// Ordered, duplicate-free and never empty
    AnyOf(Vec<String>),
    Wildcard,
}

/// "key = one-of-values | any-value"
///
/// Keys and values are kept literally as supplied: no trimming and no
/// escaping. Values containing `|`, `"` or regex metacharacters must be
/// escaped by the caller, e.g. through [`TagFilter::any_of_escaped`].
/// Keys are never escaped either; a key containing `"` is rejected when the
/// owning request is validated.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TagFilter {
    key: String,
    mode: TagMode,
}

impl TagFilter {
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: TagMode::Exact(value.into()),
        }
    }

    pub fn wildcard(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            mode: TagMode::Wildcard,
        }
    }

    /// Build a value union. Duplicates are dropped, keeping the first
    /// occurrence so the caller's order survives.
    pub fn any_of<I, S>(key: impl Into<String>, values: I) -> Result<Self, OverpassError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        let mut unique: Vec<String> = Vec::new();
        for value in values {
            let value = value.into();
            if !unique.contains(&value) {
                unique.push(value);
            }
        }

        if unique.is_empty() {
            return Err(OverpassError::InvalidRequest(format!(
                "tag filter for '{}' needs at least one value",
                key
            )));
        }

        Ok(Self {
            key,
            mode: TagMode::AnyOf(unique),
        })
    }

    /// Like [`TagFilter::any_of`], but regex-escapes every value first.
    pub fn any_of_escaped<I, S>(key: impl Into<String>, values: I) -> Result<Self, OverpassError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::any_of(
            key,
            values
                .into_iter()
                .map(|v| regex::escape(v.as_ref()))
                .collect::<Vec<_>>(),
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> &TagMode {
        &self.mode
    }
}

/// Geographic bounding box in EPSG:4326 degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Create a new bounding box
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Reject boxes that are empty, inverted or outside WGS84 bounds
    pub fn validate(&self) -> Result<(), OverpassError> {
        let finite = [self.min_lat, self.min_lon, self.max_lat, self.max_lon]
            .iter()
            .all(|c| c.is_finite());
        if !finite {
            return Err(OverpassError::InvalidRequest(format!(
                "bounding box has non-finite coordinates: {:?}",
                self
            )));
        }

        if self.min_lat >= self.max_lat || self.min_lon >= self.max_lon {
            return Err(OverpassError::InvalidRequest(format!(
                "degenerate bounding box: min must be below max on both axes ({:?})",
                self
            )));
        }

        if self.min_lat < -90.0 || self.max_lat > 90.0 {
            return Err(OverpassError::InvalidRequest(format!(
                "latitude out of range [-90, 90]: {:?}",
                self
            )));
        }

        if self.min_lon < -180.0 || self.max_lon > 180.0 {
            return Err(OverpassError::InvalidRequest(format!(
                "longitude out of range [-180, 180]: {:?}",
                self
            )));
        }

        Ok(())
    }
}

/// Where the query looks for elements
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SpatialSelector {
    BoundingBox(BoundingBox),
    NamedArea { area_id: i64 },
}

impl SpatialSelector {
    /// Area selector for an administrative boundary relation.
    /// `None` when the id is too large to carry the offset.
    pub fn from_relation(relation_id: i64) -> Option<Self> {
        relation_id
            .checked_add(AREA_ID_OFFSET)
            .map(|area_id| SpatialSelector::NamedArea { area_id })
    }
}

/// Historical snapshot the query should run against
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemporalSelector(DateTime<Utc>);

impl TemporalSelector {
    pub const WIRE_FORMAT: &'static str = "%Y-%m-%dT%H:%M:%SZ";

    /// Sub-second precision is dropped; the wire format cannot carry it.
    pub fn new(instant: DateTime<Utc>) -> Self {
        let truncated = Utc
            .timestamp_opt(instant.timestamp(), 0)
            .single()
            .unwrap_or(instant);
        Self(truncated)
    }

    /// Accepts `YYYY-MM-DD` (midnight UTC) or any RFC 3339 timestamp
    pub fn parse(input: &str) -> Result<Self, OverpassError> {
        if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
            return Ok(Self::new(instant.with_timezone(&Utc)));
        }

        let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|e| {
            OverpassError::InvalidRequest(format!("invalid date '{}': {}", input, e))
        })?;
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
            OverpassError::InvalidRequest(format!("invalid date '{}'", input))
        })?;

        Ok(Self::new(Utc.from_utc_datetime(&midnight)))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// `YYYY-MM-DDTHH:MM:SSZ`
    pub fn to_wire(&self) -> String {
        self.0.format(Self::WIRE_FORMAT).to_string()
    }

    /// OSM has no usable history before 2004-08-09
    pub fn is_before_osm_epoch(&self) -> bool {
        NaiveDate::from_ymd_opt(2004, 8, 9).is_some_and(|epoch| self.0.date_naive() < epoch)
    }
}

/// Element exactly as returned by Overpass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

impl RawElement {
    pub fn node(id: i64, lat: f64, lon: f64) -> Self {
        Self {
            kind: ElementKind::Node,
            id,
            lat: Some(lat),
            lon: Some(lon),
            nodes: Vec::new(),
            tags: None,
        }
    }

    pub fn way(id: i64, nodes: Vec<i64>) -> Self {
        Self {
            kind: ElementKind::Way,
            id,
            lat: None,
            lon: None,
            nodes,
            tags: None,
        }
    }

    pub fn relation(id: i64) -> Self {
        Self {
            kind: ElementKind::Relation,
            id,
            lat: None,
            lon: None,
            nodes: Vec::new(),
            tags: None,
        }
    }

    /// Attach tags, replacing any present
    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags = Some(
            tags.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// An empty `tags` object counts as untagged
    pub fn is_tagged(&self) -> bool {
        self.tags.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn tags(&self) -> impl Iterator<Item = (&String, &String)> {
        self.tags.iter().flat_map(|t| t.iter())
    }
}

/// Geometry class a qualifying element materializes into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GeometryClass {
    Point,
    Polyline,
    Polygon,
}

impl GeometryClass {
    pub const ALL: [GeometryClass; 3] = [
        GeometryClass::Point,
        GeometryClass::Polyline,
        GeometryClass::Polygon,
    ];

    /// Closed ways are polygons. `None` for a way with no nodes.
    pub fn of_way(node_ids: &[i64]) -> Option<GeometryClass> {
        match (node_ids.first(), node_ids.last()) {
            (Some(first), Some(last)) if first == last => Some(GeometryClass::Polygon),
            (Some(_), Some(_)) => Some(GeometryClass::Polyline),
            _ => None,
        }
    }

    /// Kind of element features of this class are built from
    pub fn element_kind(self) -> ElementKind {
        match self {
            GeometryClass::Point => ElementKind::Node,
            GeometryClass::Polyline | GeometryClass::Polygon => ElementKind::Way,
        }
    }

    /// Suffix used for output layer names
    pub fn layer_suffix(self) -> &'static str {
        match self {
            GeometryClass::Point => "points",
            GeometryClass::Polyline => "lines",
            GeometryClass::Polygon => "polygons",
        }
    }
}

/// Concrete coordinates of a feature, x = longitude, y = latitude
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureGeometry {
    Point(geo::Point<f64>),
    Polyline(geo::LineString<f64>),
    Polygon(geo::Polygon<f64>),
}

impl FeatureGeometry {
    pub fn class(&self) -> GeometryClass {
        match self {
            FeatureGeometry::Point(_) => GeometryClass::Point,
            FeatureGeometry::Polyline(_) => GeometryClass::Polyline,
            FeatureGeometry::Polygon(_) => GeometryClass::Polygon,
        }
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        let value = match self {
            FeatureGeometry::Point(p) => geojson::Value::from(p),
            FeatureGeometry::Polyline(l) => geojson::Value::from(l),
            FeatureGeometry::Polygon(p) => geojson::Value::from(p),
        };
        geojson::Geometry::new(value)
    }
}

/// One materialized OSM feature, handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub osm_id: i64,
    pub geometry: FeatureGeometry,
    /// Sanitized field name -> tag value
    pub attributes: BTreeMap<String, String>,
    pub captured_at: Option<DateTime<Utc>>,
}
