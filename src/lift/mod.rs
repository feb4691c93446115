//! Feature lifting: tile frame to full-image frame to geographic frame.
//!
//! Models see one tile at a time and report pixel coordinates relative to
//! that tile. The lifter rewrites those coordinates into the full-image
//! frame by translating with the tile origin, then maps them through the
//! image's sensor model to populate the geographic `geometry` and `bbox`,
//! and finally stamps provenance onto each feature.
//!
//! A failed geographic lift is non-fatal: the feature keeps its pixel
//! coordinates and a null `geometry`, with the error recorded in its
//! `inferenceMetadata`.

use crate::feature::{Feature, Geometry, InferenceMetadata, Position, SourceMetadata};
use crate::sensor::SensorModel;
use crate::tiling::PixelRect;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::warn;

/// Result of lifting one tile's worth of features.
#[derive(Debug)]
pub struct LiftOutcome {
    pub features: Vec<Feature>,
    /// Features whose geographic lift failed and were retained with null
    /// geometry.
    pub lift_errors: usize,
}

/// Lifts model detections for one image.
///
/// Construct once per region from the image's sensor model and source
/// metadata; the lifter itself is immutable and cheap to share.
pub struct FeatureLifter {
    job_id: String,
    sensor_model: Arc<dyn SensorModel>,
    source: SourceMetadata,
}

impl FeatureLifter {
    pub fn new(
        job_id: impl Into<String>,
        sensor_model: Arc<dyn SensorModel>,
        source: SourceMetadata,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            sensor_model,
            source,
        }
    }

    /// Lifts all features returned by the model for the tile at `tile`.
    ///
    /// Input features are expected to be normalized (see
    /// [`crate::feature::normalize_features`]); coordinates are in the tile
    /// frame on entry and in the full-image / geographic frames on return.
    pub fn lift_tile_features(&self, features: Vec<Feature>, tile: &PixelRect) -> LiftOutcome {
        let dx = tile.ul_x as f64;
        let dy = tile.ul_y as f64;
        let inference_dt = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut lift_errors = 0;
        let mut lifted = Vec::with_capacity(features.len());
        for (index, mut feature) in features.into_iter().enumerate() {
            // Tile frame -> full-image frame
            if let Some(geometry) = feature.properties.image_geometry.take() {
                feature.properties.image_geometry = Some(geometry.translated(dx, dy));
            }
            if let Some(bbox) = feature.properties.image_bbox.take() {
                feature.properties.image_bbox =
                    Some([bbox[0] + dx, bbox[1] + dy, bbox[2] + dx, bbox[3] + dy]);
            }

            let mut metadata = InferenceMetadata {
                job_id: self.job_id.clone(),
                inference_dt: inference_dt.clone(),
                lift_error: None,
            };

            // Full-image frame -> geographic frame
            if self.sensor_model.is_georeferenced() {
                match self.lift_geometry(feature.properties.image_geometry.as_ref()) {
                    Ok(Some(geometry)) => {
                        feature.bbox = geometry.bounds();
                        feature.geometry = Some(geometry);
                    }
                    Ok(None) => {}
                    Err(message) => {
                        warn!(
                            job_id = %self.job_id,
                            tile = %tile,
                            error = %message,
                            "Geographic lift failed, retaining feature with null geometry"
                        );
                        metadata.lift_error = Some(message);
                        lift_errors += 1;
                    }
                }
            }

            if feature.id.is_none() {
                feature.id = Some(format!(
                    "{}:{}:{}:{}",
                    self.job_id, tile.ul_x, tile.ul_y, index
                ));
            }
            feature.properties.source_metadata.push(self.source.clone());
            feature.properties.inference_metadata = Some(metadata);
            lifted.push(feature);
        }

        LiftOutcome {
            features: lifted,
            lift_errors,
        }
    }

    fn lift_geometry(&self, geometry: Option<&Geometry>) -> Result<Option<Geometry>, String> {
        let Some(geometry) = geometry else {
            return Ok(None);
        };
        geometry
            .try_map(|position| {
                let world = self
                    .sensor_model
                    .pixel_to_world(position.x, position.y)
                    .map_err(|err| err.to_string())?;
                Ok(Position {
                    x: world.longitude,
                    y: world.latitude,
                    z: world.elevation,
                })
            })
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{normalize_features, FeatureClass};
    use crate::sensor::{
        AffineSensorModel, SensorModelError, UngeoreferencedSensorModel, WorldCoordinate,
    };

    fn source() -> SourceMetadata {
        SourceMetadata {
            source: "s3://imagery/scene.tif".to_string(),
            format: Some("GTIFF".to_string()),
            category: Some("UNKNOWN".to_string()),
            source_id: None,
            source_dt: None,
        }
    }

    fn identity_ish_model() -> Arc<dyn SensorModel> {
        // Degree-per-pixel transform keeps the math easy to eyeball
        Arc::new(AffineSensorModel::from_geotransform([0.0, 0.001, 0.0, 0.0, 0.0, -0.001]).unwrap())
    }

    fn tile_point_feature(x: f64, y: f64) -> Feature {
        let mut feature = Feature::new();
        feature.properties.image_geometry = Some(Geometry::Point(Position::new(x, y)));
        feature.properties.feature_classes = vec![FeatureClass::new("ship", 0.9)];
        let mut features = vec![feature];
        normalize_features(&mut features);
        features.pop().unwrap()
    }

    #[test]
    fn test_lift_translates_into_image_frame() {
        let lifter = FeatureLifter::new("job-1", identity_ish_model(), source());
        let tile = PixelRect::new(2048, 4096, 512, 512);

        let outcome = lifter.lift_tile_features(vec![tile_point_feature(10.0, 20.0)], &tile);
        assert_eq!(outcome.lift_errors, 0);

        let props = &outcome.features[0].properties;
        assert_eq!(
            props.image_geometry,
            Some(Geometry::Point(Position::new(2058.0, 4116.0)))
        );
        assert_eq!(props.image_bbox, Some([2058.0, 4116.0, 2058.0, 4116.0]));
    }

    #[test]
    fn test_lift_populates_world_geometry() {
        let lifter = FeatureLifter::new("job-1", identity_ish_model(), source());
        let tile = PixelRect::new(1000, 1000, 512, 512);

        let outcome = lifter.lift_tile_features(vec![tile_point_feature(0.0, 0.0)], &tile);
        let feature = &outcome.features[0];
        match feature.geometry.as_ref().unwrap() {
            Geometry::Point(p) => {
                assert!((p.x - 1.0).abs() < 1e-9);
                assert!((p.y - -1.0).abs() < 1e-9);
            }
            other => panic!("expected point, got {other:?}"),
        }
        assert_eq!(feature.bbox, Some([1.0, -1.0, 1.0, -1.0]));
    }

    #[test]
    fn test_coords_stay_within_translated_tile() {
        let lifter = FeatureLifter::new("job-1", identity_ish_model(), source());
        let tile = PixelRect::new(4096, 0, 256, 256);
        let outcome =
            lifter.lift_tile_features(vec![tile_point_feature(256.0, 256.0)], &tile);
        let bbox = outcome.features[0].properties.image_bbox.unwrap();
        assert!(bbox[0] >= 4096.0 && bbox[2] <= 4096.0 + 256.0);
        assert!(bbox[1] >= 0.0 && bbox[3] <= 256.0);
    }

    #[test]
    fn test_ungeoreferenced_image_keeps_null_geometry() {
        let lifter = FeatureLifter::new(
            "job-1",
            Arc::new(UngeoreferencedSensorModel),
            source(),
        );
        let tile = PixelRect::new(0, 0, 512, 512);

        let outcome = lifter.lift_tile_features(vec![tile_point_feature(5.0, 5.0)], &tile);
        // Not an error, and pixel coordinates still pass through
        assert_eq!(outcome.lift_errors, 0);
        let feature = &outcome.features[0];
        assert!(feature.geometry.is_none());
        assert!(feature.properties.image_geometry.is_some());
        assert!(feature
            .properties
            .inference_metadata
            .as_ref()
            .unwrap()
            .lift_error
            .is_none());
    }

    struct FailingModel;

    impl SensorModel for FailingModel {
        fn pixel_to_world(&self, x: f64, y: f64) -> Result<WorldCoordinate, SensorModelError> {
            Err(SensorModelError::TransformFailed { x, y })
        }
    }

    #[test]
    fn test_lift_error_retains_feature() {
        let lifter = FeatureLifter::new("job-1", Arc::new(FailingModel), source());
        let tile = PixelRect::new(0, 0, 512, 512);

        let outcome = lifter.lift_tile_features(vec![tile_point_feature(5.0, 5.0)], &tile);
        assert_eq!(outcome.lift_errors, 1);
        let feature = &outcome.features[0];
        assert!(feature.geometry.is_none());
        assert!(feature
            .properties
            .inference_metadata
            .as_ref()
            .unwrap()
            .lift_error
            .is_some());
    }

    #[test]
    fn test_pedigree_attached() {
        let lifter = FeatureLifter::new("job-9", identity_ish_model(), source());
        let tile = PixelRect::new(0, 0, 512, 512);

        let outcome = lifter.lift_tile_features(vec![tile_point_feature(1.0, 1.0)], &tile);
        let feature = &outcome.features[0];
        assert!(feature.id.is_some());
        assert_eq!(feature.properties.source_metadata.len(), 1);
        assert_eq!(
            feature.properties.source_metadata[0].source,
            "s3://imagery/scene.tif"
        );
        let metadata = feature.properties.inference_metadata.as_ref().unwrap();
        assert_eq!(metadata.job_id, "job-9");
        assert!(!metadata.inference_dt.is_empty());
    }

    #[test]
    fn test_polygon_structure_preserved() {
        let mut feature = Feature::new();
        feature.properties.image_geometry =
            Some(Geometry::from_bbox([0.0, 0.0, 10.0, 10.0]));
        let mut features = vec![feature];
        normalize_features(&mut features);

        let lifter = FeatureLifter::new("job-1", identity_ish_model(), source());
        let outcome =
            lifter.lift_tile_features(features, &PixelRect::new(100, 100, 512, 512));
        match outcome.features[0].geometry.as_ref().unwrap() {
            Geometry::Polygon(rings) => assert_eq!(rings[0].len(), 5),
            other => panic!("expected polygon, got {other:?}"),
        }
    }
}
