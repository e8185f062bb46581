use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{ElementKind, GeometryClass};

/// Failure confined to a single element; siblings keep processing
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureError {
    #[error("way {way_id} references node {node_id}, which is not in the response")]
    UnresolvedNodeReference { way_id: i64, node_id: i64 },

    #[error("way {way_id} has no nodes")]
    DegenerateWay { way_id: i64 },

    #[error("node {node_id} has no coordinates")]
    MissingCoordinates { node_id: i64 },

    #[error("sink rejected feature: {message}")]
    Sink { message: String },
}

/// A [`FeatureError`] tied to the element that raised it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementFailure {
    pub osm_type: ElementKind,
    pub osm_id: i64,
    pub error: FeatureError,
}

/// Why a single attribute was not written
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldFailureReason {
    /// Sanitized name collides with a field the layer defines itself
    ReservedName,
    /// Value does not fit the fixed-width text field
    ValueTooLong { len: usize, max: usize },
    /// Nothing is left of the key after sanitization
    EmptyName,
    /// Sanitized name is missing from the layer schema
    NotInSchema,
    /// Another key of the same element already produced this field name
    DuplicateName,
}

/// One rejected attribute of an otherwise materialized feature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFailure {
    pub tag_key: String,
    pub field: String,
    pub reason: FieldFailureReason,
}

/// Attribute problems of one feature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub osm_id: i64,
    pub field_failures: Vec<FieldFailure>,
}

/// Outcome for one output layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub class: GeometryClass,
    pub layer_name: String,
    pub field_count: usize,
    pub inserted: usize,
    pub element_failures: Vec<ElementFailure>,
    pub field_reports: Vec<RecordReport>,
}

impl LayerReport {
    pub fn field_failure_count(&self) -> usize {
        self.field_reports
            .iter()
            .map(|r| r.field_failures.len())
            .sum()
    }
}

/// Outcome of a complete query run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub query: String,
    pub element_count: usize,
    /// Only layers that were actually created
    pub layers: Vec<LayerReport>,
    /// Elements rejected before classification, such as empty ways
    pub rejected: Vec<ElementFailure>,
}

impl PipelineReport {
    pub fn total_inserted(&self) -> usize {
        self.layers.iter().map(|l| l.inserted).sum()
    }

    pub fn failed_elements(&self) -> usize {
        self.rejected.len()
            + self
                .layers
                .iter()
                .map(|l| l.element_failures.len())
                .sum::<usize>()
    }

    pub fn layer(&self, class: GeometryClass) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.class == class)
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let layers = if self.layers.is_empty() {
            "no layers".to_string()
        } else {
            self.layers
                .iter()
                .map(|l| format!("{} ({} features)", l.layer_name, l.inserted))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let field_failures: usize = self.layers.iter().map(|l| l.field_failure_count()).sum();

        format!(
            "Received {} elements, wrote {} features to {}. {} elements failed, {} attributes skipped.",
            self.element_count,
            self.total_inserted(),
            layers,
            self.failed_elements(),
            field_failures
        )
    }
}
