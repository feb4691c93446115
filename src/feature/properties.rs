//! Feature, property, and collection types plus response normalization.

use super::geometry::Geometry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

fn feature_type() -> String {
    "Feature".to_string()
}

fn collection_type() -> String {
    "FeatureCollection".to_string()
}

/// One scored class assignment from the model ontology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureClass {
    /// Ontology IRI identifying the class.
    pub iri: String,
    /// Confidence score in `[0, 1]`. Soft-NMS may decay this value.
    pub score: f64,
    /// The model's original score, preserved when Soft-NMS adjusts `score`.
    #[serde(rename = "rawScore", skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f64>,
}

impl FeatureClass {
    pub fn new(iri: impl Into<String>, score: f64) -> Self {
        Self {
            iri: iri.into(),
            score,
            raw_score: None,
        }
    }
}

/// Provenance of the imagery a detection came from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// URI of the source image.
    pub source: String,
    /// Container format of the source image (e.g. "NITF", "GTIFF").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Security / handling category inferred from image metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Platform or sensor identifier from image metadata.
    #[serde(rename = "sourceId", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Collection time of the source image.
    #[serde(rename = "sourceDT", skip_serializing_if = "Option::is_none")]
    pub source_dt: Option<String>,
}

/// Pedigree of the inference run that produced a detection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferenceMetadata {
    /// Job that produced this feature.
    #[serde(rename = "jobId")]
    pub job_id: String,
    /// Wall-clock time of the lift, RFC 3339.
    #[serde(rename = "inferenceDT")]
    pub inference_dt: String,
    /// Populated when the geographic lift failed; the feature is retained
    /// with null geometry.
    #[serde(rename = "liftError", skip_serializing_if = "Option::is_none")]
    pub lift_error: Option<String>,
}

/// Properties carried by every detection feature.
///
/// `bounds_imcoords` and `feature_types` are the deprecated spellings some
/// models still emit; [`normalize_features`] migrates them into `imageBBox`
/// and `featureClasses` and they are never serialized back out.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureProperties {
    /// Detection geometry in pixel coordinates. Tile frame in a model
    /// response; full-image frame after lifting.
    #[serde(rename = "imageGeometry", skip_serializing_if = "Option::is_none")]
    pub image_geometry: Option<Geometry>,

    /// Axis-aligned pixel bounds `[min_x, min_y, max_x, max_y]`.
    #[serde(rename = "imageBBox", skip_serializing_if = "Option::is_none")]
    pub image_bbox: Option<[f64; 4]>,

    /// Scored class assignments, highest score first by convention.
    #[serde(rename = "featureClasses", default, skip_serializing_if = "Vec::is_empty")]
    pub feature_classes: Vec<FeatureClass>,

    /// Provenance of the source imagery.
    #[serde(rename = "sourceMetadata", default, skip_serializing_if = "Vec::is_empty")]
    pub source_metadata: Vec<SourceMetadata>,

    /// Pedigree of the inference run.
    #[serde(rename = "inferenceMetadata", skip_serializing_if = "Option::is_none")]
    pub inference_metadata: Option<InferenceMetadata>,

    /// Deprecated: accepted on input, migrated to `imageBBox`.
    #[serde(default, skip_serializing)]
    pub bounds_imcoords: Option<[f64; 4]>,

    /// Deprecated: accepted on input, migrated to `featureClasses`.
    #[serde(default, skip_serializing)]
    pub feature_types: Option<BTreeMap<String, f64>>,

    /// Any additional properties the model attached; passed through intact.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single detection, GeoJSON-compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    kind: String,

    /// Stable identifier; assigned by the model or synthesized downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Geographic geometry, filled by the lifter. Null when the image has no
    /// usable geolocation or the lift failed.
    pub geometry: Option<Geometry>,

    /// Geographic bounds matching `geometry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,

    #[serde(default)]
    pub properties: FeatureProperties,
}

impl Feature {
    /// Creates a feature with empty properties and no geometry.
    pub fn new() -> Self {
        Self {
            kind: feature_type(),
            id: None,
            geometry: None,
            bbox: None,
            properties: FeatureProperties::default(),
        }
    }

    /// Pixel bounds of this feature: `imageBBox` when present, otherwise the
    /// axis-aligned bounds of `imageGeometry`.
    pub fn image_bounds(&self) -> Option<[f64; 4]> {
        self.properties
            .image_bbox
            .or_else(|| self.properties.image_geometry.as_ref().and_then(Geometry::bounds))
    }

    /// The highest-scoring class assignment, if any.
    pub fn dominant_class(&self) -> Option<&FeatureClass> {
        self.properties
            .feature_classes
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

impl Default for Feature {
    fn default() -> Self {
        Self::new()
    }
}

/// A GeoJSON FeatureCollection, the model response and job output envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type", default = "collection_type")]
    kind: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            kind: collection_type(),
            features,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

/// Migrates deprecated model-response fields into their current homes.
///
/// - `bounds_imcoords` becomes `imageBBox` when `imageBBox` is absent.
/// - `feature_types` (class name to score map) becomes `featureClasses` when
///   `featureClasses` is absent.
/// - A missing `imageBBox` is derived from `imageGeometry` bounds; a missing
///   `imageGeometry` is synthesized as a rectangle from `imageBBox`.
///
/// Deprecated fields are cleared so they never round-trip to output.
pub fn normalize_features(features: &mut [Feature]) {
    for feature in features {
        let props = &mut feature.properties;

        if props.image_bbox.is_none() {
            props.image_bbox = props.bounds_imcoords;
        }
        props.bounds_imcoords = None;

        if props.feature_classes.is_empty() {
            if let Some(types) = props.feature_types.take() {
                let mut classes: Vec<FeatureClass> = types
                    .into_iter()
                    .map(|(iri, score)| FeatureClass::new(iri, score))
                    .collect();
                classes.sort_by(|a, b| b.score.total_cmp(&a.score));
                props.feature_classes = classes;
            }
        }
        props.feature_types = None;

        if props.image_bbox.is_none() {
            props.image_bbox = props.image_geometry.as_ref().and_then(Geometry::bounds);
        }
        if props.image_geometry.is_none() {
            if let Some(bbox) = props.image_bbox {
                props.image_geometry = Some(Geometry::from_bbox(bbox));
            }
        }
    }
}
