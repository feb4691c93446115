//! Region processing requests for the region queue.

use super::{ImageRequest, ModelEndpointDescriptor, OutputSink, TileCompression, TileFormat};
use crate::distill::DistillationMode;
use crate::tiling::{PixelRect, TileParams, TilingError};
use serde::{Deserialize, Serialize};

/// A request to process one region of an image.
///
/// Derived from an [`ImageRequest`] and self-contained: any worker that
/// dequeues it can open the image, enumerate tiles, and complete the region
/// without access to the original image message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRequest {
    #[serde(rename = "jobId")]
    pub job_id: String,

    /// Deterministic region identifier derived from the bounds, so a
    /// redelivered or re-planned region maps to the same ledger record.
    #[serde(rename = "regionId")]
    pub region_id: String,

    #[serde(rename = "imageUrl")]
    pub image_url: String,

    #[serde(rename = "regionBounds")]
    pub region_bounds: PixelRect,

    #[serde(rename = "tileSize")]
    pub tile_size: u32,

    #[serde(rename = "tileOverlap")]
    pub tile_overlap: u32,

    #[serde(rename = "tileFormat")]
    pub tile_format: TileFormat,

    #[serde(rename = "tileCompression")]
    pub tile_compression: TileCompression,

    #[serde(rename = "imageProcessor")]
    pub image_processor: ModelEndpointDescriptor,

    #[serde(default)]
    pub outputs: Vec<OutputSink>,

    #[serde(
        rename = "featureDistillation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub feature_distillation: Option<DistillationMode>,
}

impl RegionRequest {
    /// Derives the region request for one planned region of an image job.
    pub fn from_image_request(request: &ImageRequest, image_url: &str, bounds: PixelRect) -> Self {
        Self {
            job_id: request.job_id.clone(),
            region_id: region_id_for(&bounds),
            image_url: image_url.to_string(),
            region_bounds: bounds,
            tile_size: request.tile_size,
            tile_overlap: request.tile_overlap,
            tile_format: request.tile_format,
            tile_compression: request.tile_compression,
            image_processor: request.image_processor.clone(),
            outputs: request.outputs.clone(),
            feature_distillation: request.feature_distillation,
        }
    }

    pub fn tile_params(&self) -> Result<TileParams, TilingError> {
        TileParams::new(self.tile_size, self.tile_overlap)
    }
}

/// Region id from bounds: stable across replanning and redelivery.
pub(crate) fn region_id_for(bounds: &PixelRect) -> String {
    format!(
        "{}-{}-{}-{}",
        bounds.ul_x, bounds.ul_y, bounds.width, bounds.height
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image_request() -> ImageRequest {
        serde_json::from_str(
            r#"{
                "jobId": "job-7",
                "imageUrls": ["s3://imagery/scene.tif"],
                "outputs": [{"type": "Kinesis", "stream": "detections"}],
                "imageProcessor": {"name": "ship-detector", "type": "HTTP_ENDPOINT"},
                "imageProcessorTileSize": 512,
                "imageProcessorTileOverlap": 32,
                "imageProcessorTileFormat": "PNG"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_derived_from_image_request() {
        let image_request = sample_image_request();
        let bounds = PixelRect::new(8192, 0, 8192, 8192);
        let region = RegionRequest::from_image_request(
            &image_request,
            "s3://imagery/scene.tif",
            bounds,
        );

        assert_eq!(region.job_id, "job-7");
        assert_eq!(region.region_id, "8192-0-8192-8192");
        assert_eq!(region.region_bounds, bounds);
        assert_eq!(region.tile_size, 512);
        assert_eq!(region.outputs, image_request.outputs);
    }

    #[test]
    fn test_region_id_deterministic() {
        let bounds = PixelRect::new(0, 8192, 4000, 3000);
        assert_eq!(region_id_for(&bounds), region_id_for(&bounds));
    }

    #[test]
    fn test_wire_roundtrip() {
        let image_request = sample_image_request();
        let region = RegionRequest::from_image_request(
            &image_request,
            "s3://imagery/scene.tif",
            PixelRect::new(0, 0, 100, 100),
        );
        let json = serde_json::to_string(&region).unwrap();
        let back: RegionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, region);
    }
}
