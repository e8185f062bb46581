use geojson::{Feature, FeatureCollection, JsonObject, JsonValue};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::OutputSettings;
use crate::models::{FeatureRecord, GeometryClass};
use crate::schema::{AttributeSchema, DATETIME_FIELD, OSM_ID_FIELD};
use crate::OverpassError;

/// Definition of an output layer, requested before any insert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSpec {
    pub class: GeometryClass,
    pub name: String,
    /// Text fields, in addition to `OSM_ID` and the optional `DATETIME`
    pub fields: Vec<String>,
    pub with_datetime: bool,
}

impl LayerSpec {
    pub fn new(
        prefix: &str,
        class: GeometryClass,
        schema: &AttributeSchema,
        with_datetime: bool,
    ) -> Self {
        Self {
            class,
            name: format!("{}_{}", prefix, class.layer_suffix()),
            fields: schema.fields().map(str::to_string).collect(),
            with_datetime,
        }
    }
}

/// Receiver of materialized features.
///
/// The pipeline only creates layers for non-empty geometry buckets, so a
/// sink never sees an empty layer request.
pub trait FeatureSink {
    fn create_layer(&mut self, spec: &LayerSpec) -> crate::Result<()>;

    fn insert(&mut self, class: GeometryClass, record: &FeatureRecord) -> crate::Result<()>;

    /// Called once after the last insert of a successful run
    fn finish(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Render a record with the layer's full field set; missing tags are null.
pub fn to_geojson_feature(spec: &LayerSpec, record: &FeatureRecord) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert(OSM_ID_FIELD.to_string(), JsonValue::from(record.osm_id));

    if spec.with_datetime {
        let captured = record
            .captured_at
            .map(|t| JsonValue::from(t.to_rfc3339()))
            .unwrap_or(JsonValue::Null);
        properties.insert(DATETIME_FIELD.to_string(), captured);
    }

    for field in &spec.fields {
        let value = record
            .attributes
            .get(field)
            .map(|v| JsonValue::from(v.as_str()))
            .unwrap_or(JsonValue::Null);
        properties.insert(field.clone(), value);
    }

    Feature {
        bbox: None,
        geometry: Some(record.geometry.to_geojson()),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

#[derive(Debug, Clone)]
struct CollectedLayer {
    spec: LayerSpec,
    features: Vec<Feature>,
}

/// In-memory sink producing one GeoJSON feature collection per layer
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    layers: BTreeMap<GeometryClass, CollectedLayer>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer_specs(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.values().map(|l| &l.spec)
    }

    pub fn feature_count(&self, class: GeometryClass) -> usize {
        self.layers.get(&class).map_or(0, |l| l.features.len())
    }

    /// Layers in point, line, polygon order
    pub fn into_collections(self) -> Vec<(LayerSpec, FeatureCollection)> {
        self.layers
            .into_values()
            .map(|layer| {
                let collection = FeatureCollection {
                    bbox: None,
                    features: layer.features,
                    foreign_members: None,
                };
                (layer.spec, collection)
            })
            .collect()
    }
}

impl FeatureSink for CollectingSink {
    fn create_layer(&mut self, spec: &LayerSpec) -> crate::Result<()> {
        self.layers.insert(
            spec.class,
            CollectedLayer {
                spec: spec.clone(),
                features: Vec::new(),
            },
        );
        Ok(())
    }

    fn insert(&mut self, class: GeometryClass, record: &FeatureRecord) -> crate::Result<()> {
        let layer = self.layers.get_mut(&class).ok_or_else(|| {
            OverpassError::Sink(format!("no {} layer has been created", class.layer_suffix()))
        })?;
        let feature = to_geojson_feature(&layer.spec, record);
        layer.features.push(feature);
        Ok(())
    }
}

/// Writes each layer to `<output_dir>/<layer name>.geojson` on finish
#[derive(Debug)]
pub struct GeoJsonSink {
    settings: OutputSettings,
    collected: CollectingSink,
    written: Vec<PathBuf>,
}

impl GeoJsonSink {
    /// Create a new sink, creating the output directory if needed
    pub fn new(settings: OutputSettings) -> crate::Result<Self> {
        std::fs::create_dir_all(&settings.output_dir)?;
        Ok(Self {
            settings,
            collected: CollectingSink::new(),
            written: Vec::new(),
        })
    }

    pub fn layer_path(&self, name: &str) -> PathBuf {
        self.settings.output_dir.join(format!("{}.geojson", name))
    }

    /// Files written by [`FeatureSink::finish`]
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl FeatureSink for GeoJsonSink {
    fn create_layer(&mut self, spec: &LayerSpec) -> crate::Result<()> {
        let path = self.layer_path(&spec.name);
        if path.exists() && !self.settings.overwrite {
            return Err(OverpassError::Sink(format!(
                "{} already exists and overwriting is disabled",
                path.display()
            ))
            .into());
        }
        self.collected.create_layer(spec)
    }

    fn insert(&mut self, class: GeometryClass, record: &FeatureRecord) -> crate::Result<()> {
        self.collected.insert(class, record)
    }

    fn finish(&mut self) -> crate::Result<()> {
        let collected = std::mem::take(&mut self.collected);
        for (spec, collection) in collected.into_collections() {
            let path = self.layer_path(&spec.name);
            write_collection(&path, &collection)?;
            info!(
                "Wrote {} features to {:?}",
                collection.features.len(),
                path
            );
            self.written.push(path);
        }
        Ok(())
    }
}

fn write_collection(path: &Path, collection: &FeatureCollection) -> crate::Result<()> {
    let content = serde_json::to_string_pretty(collection)?;
    std::fs::write(path, content)?;
    Ok(())
}
