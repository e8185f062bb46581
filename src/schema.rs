//! Attribute schema inference.
//!
//! [`sanitize_field_name`] is the only place the tag key to field name rule
//! lives; layer schemas and record attributes both go through it.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::decompose::Decomposition;
use crate::models::{GeometryClass, RawElement};

/// Numeric id field every layer carries
pub const OSM_ID_FIELD: &str = "OSM_ID";
/// Snapshot field, present only on historical queries
pub const DATETIME_FIELD: &str = "DATETIME";

/// Names a tag-derived field may not take (compared case-insensitively)
pub const RESERVED_FIELDS: [&str; 5] = [OSM_ID_FIELD, DATETIME_FIELD, "FID", "OBJECTID", "SHAPE"];

pub fn is_reserved_field(name: &str) -> bool {
    RESERVED_FIELDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Map an OSM tag key onto an output field name (`addr:street` -> `addrstreet`)
pub fn sanitize_field_name(key: &str) -> String {
    key.chars().filter(|c| *c != ':').collect()
}

/// Text fields of one output layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeSchema {
    fields: BTreeSet<String>,
}

impl AttributeSchema {
    /// Union of sanitized tag keys across `elements`. Keys that sanitize to
    /// nothing or to a reserved name never become fields.
    pub fn infer<'a, I>(elements: I) -> Self
    where
        I: IntoIterator<Item = &'a RawElement>,
    {
        let fields = elements
            .into_iter()
            .flat_map(|e| e.tags())
            .map(|(key, _)| sanitize_field_name(key))
            .filter(|field| !field.is_empty() && !is_reserved_field(field))
            .collect();
        Self { fields }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Schemas for the three geometry buckets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSet {
    pub points: AttributeSchema,
    pub lines: AttributeSchema,
    pub polygons: AttributeSchema,
}

impl SchemaSet {
    pub fn infer(decomposition: &Decomposition<'_>) -> Self {
        Self {
            points: AttributeSchema::infer(decomposition.points.iter().copied()),
            lines: AttributeSchema::infer(decomposition.lines.iter().copied()),
            polygons: AttributeSchema::infer(decomposition.polygons.iter().copied()),
        }
    }

    pub fn get(&self, class: GeometryClass) -> &AttributeSchema {
        match class {
            GeometryClass::Point => &self.points,
            GeometryClass::Polyline => &self.lines,
            GeometryClass::Polygon => &self.polygons,
        }
    }
}
