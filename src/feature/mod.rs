//! GeoJSON-compatible feature model.
//!
//! Detections travel through the system as GeoJSON Features carrying two
//! coordinate frames at once: `properties.imageGeometry` / `imageBBox` in
//! pixel space (tile frame when they leave the model, full-image frame after
//! lifting) and the top-level `geometry` / `bbox` in geographic coordinates
//! (filled in by the lifter when a sensor model is available).
//!
//! Geometry is a closed tagged variant rather than a free-form JSON blob so
//! that coordinate transforms are total functions over the type. Deprecated
//! model-response fields (`bounds_imcoords`, `feature_types`) are accepted on
//! input and migrated by [`normalize_features`].

mod geometry;
mod properties;

pub use geometry::{Geometry, Position};
pub use properties::{
    normalize_features, Feature, FeatureClass, FeatureCollection, FeatureProperties,
    InferenceMetadata, SourceMetadata,
};
