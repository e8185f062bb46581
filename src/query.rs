//! Overpass QL rendering.
//!
//! Queries are built as a single statement that unions the node, way and
//! relation clauses and then recurses down to every referenced node, so
//! way geometries can be resolved from the same response.

use tracing::debug;

use crate::models::{ElementKind, SpatialSelector, TagFilter, TagMode, TemporalSelector};

/// Server-side execution bound requested from Overpass, in seconds
pub const QUERY_TIMEOUT_SECS: u32 = 25;

/// Named input set that carries the area in area-scoped queries
const AREA_SET: &str = "searchArea";

/// Recursion that pulls in the nodes of matched ways, then prints
pub const CLOSURE_SUFFIX: &str = "(._;>;);out;>;";

impl TagFilter {
    /// Render the filter as a clause head for one element kind.
    ///
    /// Values are inserted verbatim. A single-value union renders exactly
    /// like an exact match.
    pub fn render(&self, kind: ElementKind) -> String {
        let kind = kind.as_str();
        let key = self.key();
        match self.mode() {
            TagMode::Wildcard => format!(r#"{}["{}"]"#, kind, key),
            TagMode::Exact(value) => format!(r#"{}["{}"="{}"]"#, kind, key, value),
            TagMode::AnyOf(values) => match values.as_slice() {
                [single] => format!(r#"{}["{}"="{}"]"#, kind, key, single),
                _ => format!(r#"{}["{}"~"{}"]"#, kind, key, values.join("|")),
            },
        }
    }
}

impl SpatialSelector {
    /// Statement that has to precede the union, if any
    fn preamble(&self) -> Option<String> {
        match self {
            SpatialSelector::BoundingBox(_) => None,
            SpatialSelector::NamedArea { area_id } => {
                Some(format!("area({})->.{};", area_id, AREA_SET))
            }
        }
    }

    /// Spatial filter appended to every clause head
    fn clause_filter(&self) -> String {
        match self {
            SpatialSelector::BoundingBox(bbox) => format!(
                "({},{},{},{})",
                format_coordinate(bbox.min_lat),
                format_coordinate(bbox.min_lon),
                format_coordinate(bbox.max_lat),
                format_coordinate(bbox.max_lon)
            ),
            SpatialSelector::NamedArea { .. } => format!("(area.{})", AREA_SET),
        }
    }
}

/// Decimal rendering that never uses exponents and always keeps a
/// fractional part, so `47` prints as `47.0`.
fn format_coordinate(value: f64) -> String {
    let mut rendered = value.to_string();
    if !rendered.contains('.') {
        rendered.push_str(".0");
    }
    rendered
}

/// Compose the full Overpass QL query.
///
/// Identical inputs always produce the same bytes.
pub fn compile(
    filter: &TagFilter,
    selector: &SpatialSelector,
    as_of: Option<&TemporalSelector>,
) -> String {
    let mut query = format!("[out:json][timeout:{}]", QUERY_TIMEOUT_SECS);

    if let Some(as_of) = as_of {
        query.push_str(&format!(r#"[date:"{}"]"#, as_of.to_wire()));
    }
    query.push(';');

    if let Some(preamble) = selector.preamble() {
        query.push_str(&preamble);
    }

    let spatial = selector.clause_filter();
    query.push('(');
    for kind in ElementKind::QUERYABLE {
        query.push_str(&filter.render(kind));
        query.push_str(&spatial);
        query.push(';');
    }
    query.push_str(");");
    query.push_str(CLOSURE_SUFFIX);

    debug!("Compiled Overpass query: {}", query);
    query
}
