//! Sensor-model adapter: pixel to geographic coordinate mapping.
//!
//! The external decoder hands us image metadata that may include a
//! six-element affine geotransform (the contract photogrammetry libraries
//! expose for orthorectified imagery). This module wraps that into an opaque
//! [`SensorModel`] the feature lifter can call without caring whether the
//! image is georeferenced at all.
//!
//! Images without usable geolocation get an [`UngeoreferencedSensorModel`];
//! lifted features keep their pixel coordinates and a null `geometry`.

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A geographic coordinate produced by a sensor model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldCoordinate {
    /// Longitude in degrees.
    pub longitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Elevation in meters, when the model can provide one.
    pub elevation: Option<f64>,
}

/// Errors from sensor-model construction and coordinate transforms.
#[derive(Debug, Clone, Error)]
pub enum SensorModelError {
    /// The image carries no usable geolocation metadata.
    #[error("image has no usable geolocation metadata")]
    NotGeoreferenced,

    /// The geotransform cannot be inverted, so round-trip validation is
    /// impossible and the transform is unusable.
    #[error("geotransform is singular and cannot be inverted")]
    SingularTransform,

    /// A per-coordinate transform produced a non-finite result.
    #[error("coordinate transform failed for pixel ({x}, {y})")]
    TransformFailed { x: f64, y: f64 },
}

/// Maps full-image pixel coordinates to geographic coordinates.
///
/// Implementations are immutable after construction and shared across the
/// tile workers of an image via `Arc`. Transforms are pure CPU work and do
/// not suspend.
pub trait SensorModel: Send + Sync {
    /// Maps a full-image pixel coordinate to a geographic coordinate.
    fn pixel_to_world(&self, x: f64, y: f64) -> Result<WorldCoordinate, SensorModelError>;

    /// Whether this model can produce geographic coordinates at all.
    ///
    /// The lifter checks this once per region and skips the geographic lift
    /// entirely for ungeoreferenced imagery rather than counting an error
    /// per feature.
    fn is_georeferenced(&self) -> bool {
        true
    }
}

/// Sensor model backed by an affine geotransform.
///
/// Uses the GDAL convention: `lon = t[0] + x*t[1] + y*t[2]`,
/// `lat = t[3] + x*t[4] + y*t[5]`.
pub struct AffineSensorModel {
    transform: [f64; 6],
    inverse: [f64; 6],
}

impl AffineSensorModel {
    /// Builds a model from a geotransform, pre-computing the inverse for
    /// round-trip validation.
    pub fn from_geotransform(transform: [f64; 6]) -> Result<Self, SensorModelError> {
        let det = transform[1] * transform[5] - transform[2] * transform[4];
        if det.abs() < f64::EPSILON || !det.is_finite() {
            return Err(SensorModelError::SingularTransform);
        }
        let inv_det = 1.0 / det;
        // Inverse of the 2x2 linear part plus translated origin
        let inverse = [
            (transform[2] * transform[3] - transform[0] * transform[5]) * inv_det,
            transform[5] * inv_det,
            -transform[2] * inv_det,
            (transform[0] * transform[4] - transform[1] * transform[3]) * inv_det,
            -transform[4] * inv_det,
            transform[1] * inv_det,
        ];
        Ok(Self { transform, inverse })
    }

    /// Maps a geographic coordinate back to pixel space.
    pub fn world_to_pixel(&self, longitude: f64, latitude: f64) -> (f64, f64) {
        let x = self.inverse[0] + longitude * self.inverse[1] + latitude * self.inverse[2];
        let y = self.inverse[3] + longitude * self.inverse[4] + latitude * self.inverse[5];
        (x, y)
    }

    /// Maximum pixel error after mapping the given pixel to world
    /// coordinates and back.
    pub fn round_trip_error(&self, x: f64, y: f64) -> Result<f64, SensorModelError> {
        let world = self.pixel_to_world(x, y)?;
        let (rx, ry) = self.world_to_pixel(world.longitude, world.latitude);
        Ok((rx - x).abs().max((ry - y).abs()))
    }
}

impl SensorModel for AffineSensorModel {
    fn pixel_to_world(&self, x: f64, y: f64) -> Result<WorldCoordinate, SensorModelError> {
        let longitude = self.transform[0] + x * self.transform[1] + y * self.transform[2];
        let latitude = self.transform[3] + x * self.transform[4] + y * self.transform[5];
        if !longitude.is_finite() || !latitude.is_finite() {
            return Err(SensorModelError::TransformFailed { x, y });
        }
        Ok(WorldCoordinate {
            longitude,
            latitude,
            elevation: None,
        })
    }
}

/// Degenerate model for imagery without geolocation metadata.
///
/// Lifted features pass their pixel coordinates through and keep a null
/// `geometry`.
pub struct UngeoreferencedSensorModel;

impl SensorModel for UngeoreferencedSensorModel {
    fn pixel_to_world(&self, _x: f64, _y: f64) -> Result<WorldCoordinate, SensorModelError> {
        Err(SensorModelError::NotGeoreferenced)
    }

    fn is_georeferenced(&self) -> bool {
        false
    }
}

/// Round-trip tolerance in pixels for accepting a geotransform.
const ROUND_TRIP_TOLERANCE_PX: f64 = 0.5;

/// Builds the sensor model for an image from its optional geotransform.
///
/// Falls back to the degenerate model when the transform is missing,
/// singular, or fails round-trip validation at the image corners.
pub fn build_sensor_model(
    geo_transform: Option<[f64; 6]>,
    width: u32,
    height: u32,
) -> Arc<dyn SensorModel> {
    let Some(transform) = geo_transform else {
        return Arc::new(UngeoreferencedSensorModel);
    };

    let model = match AffineSensorModel::from_geotransform(transform) {
        Ok(model) => model,
        Err(err) => {
            warn!(error = %err, "Rejecting geotransform, image will not be georeferenced");
            return Arc::new(UngeoreferencedSensorModel);
        }
    };

    let corners = [
        (0.0, 0.0),
        (width as f64, 0.0),
        (0.0, height as f64),
        (width as f64, height as f64),
    ];
    for (x, y) in corners {
        match model.round_trip_error(x, y) {
            Ok(err_px) if err_px <= ROUND_TRIP_TOLERANCE_PX => {}
            Ok(err_px) => {
                warn!(
                    error_px = err_px,
                    "Geotransform failed round-trip validation, image will not be georeferenced"
                );
                return Arc::new(UngeoreferencedSensorModel);
            }
            Err(err) => {
                warn!(error = %err, "Geotransform validation failed");
                return Arc::new(UngeoreferencedSensorModel);
            }
        }
    }

    Arc::new(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0.25m pixels anchored at (-122.5, 37.8), north-up
    const SIMPLE_TRANSFORM: [f64; 6] = [-122.5, 0.000_002_5, 0.0, 37.8, 0.0, -0.000_002_5];

    #[test]
    fn test_affine_pixel_to_world() {
        let model = AffineSensorModel::from_geotransform(SIMPLE_TRANSFORM).unwrap();
        let world = model.pixel_to_world(0.0, 0.0).unwrap();
        assert!((world.longitude - -122.5).abs() < 1e-9);
        assert!((world.latitude - 37.8).abs() < 1e-9);

        let world = model.pixel_to_world(1000.0, 2000.0).unwrap();
        assert!((world.longitude - (-122.5 + 0.0025)).abs() < 1e-9);
        assert!((world.latitude - (37.8 - 0.005)).abs() < 1e-9);
    }

    #[test]
    fn test_affine_round_trip() {
        let model = AffineSensorModel::from_geotransform(SIMPLE_TRANSFORM).unwrap();
        let err = model.round_trip_error(12345.0, 6789.0).unwrap();
        assert!(err < 1e-6, "round trip error {err}");
    }

    #[test]
    fn test_singular_transform_rejected() {
        let result = AffineSensorModel::from_geotransform([0.0; 6]);
        assert!(matches!(result, Err(SensorModelError::SingularTransform)));
    }

    #[test]
    fn test_rotated_transform_round_trip() {
        // Includes row/column cross terms
        let transform = [10.0, 0.001, 0.0002, 50.0, -0.0001, -0.001];
        let model = AffineSensorModel::from_geotransform(transform).unwrap();
        let err = model.round_trip_error(500.0, 700.0).unwrap();
        assert!(err < 1e-6, "round trip error {err}");
    }

    #[test]
    fn test_ungeoreferenced_model() {
        let model = UngeoreferencedSensorModel;
        assert!(!model.is_georeferenced());
        assert!(matches!(
            model.pixel_to_world(1.0, 1.0),
            Err(SensorModelError::NotGeoreferenced)
        ));
    }

    #[test]
    fn test_build_sensor_model_with_transform() {
        let model = build_sensor_model(Some(SIMPLE_TRANSFORM), 10_000, 10_000);
        assert!(model.is_georeferenced());
    }

    #[test]
    fn test_build_sensor_model_without_transform() {
        let model = build_sensor_model(None, 10_000, 10_000);
        assert!(!model.is_georeferenced());
    }

    #[test]
    fn test_build_sensor_model_rejects_singular() {
        let model = build_sensor_model(Some([0.0; 6]), 100, 100);
        assert!(!model.is_georeferenced());
    }
}
