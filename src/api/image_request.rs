//! Image processing requests from the image queue.

use super::{is_valid_tile_encoding, OutputSink, TileCompression, TileFormat};
use crate::distill::DistillationMode;
use crate::tiling::{TileParams, TilingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the model endpoint is hosted.
///
/// Only HTTP endpoints are dispatched by this crate; other hosting modes
/// fail request parsing and the message is rejected at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelHost {
    #[serde(rename = "HTTP_ENDPOINT")]
    Http,
}

/// The model endpoint a request should be dispatched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEndpointDescriptor {
    /// Model name; also the `ModelName` metrics dimension.
    pub name: String,
    #[serde(rename = "type")]
    pub host: ModelHost,
}

/// Validation failures for incoming requests.
///
/// All of these are permanent: the job is marked FAILED and the message
/// acknowledged, since redelivering bad data cannot succeed.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("request is missing a job id")]
    MissingJobId,

    #[error("request has no image urls")]
    MissingImageUrls,

    #[error(transparent)]
    InvalidTileParams(#[from] TilingError),

    #[error("unsupported tile encoding: {format} with {compression} compression")]
    InvalidTileEncoding {
        format: TileFormat,
        compression: TileCompression,
    },

    #[error("region size {0} must be positive")]
    InvalidRegionSize(u32),
}

fn default_tile_size() -> u32 {
    1024
}

fn default_tile_overlap() -> u32 {
    50
}

/// A request to run a model over one image, as received from the image
/// queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(rename = "jobName", default)]
    pub job_name: String,

    #[serde(rename = "jobId")]
    pub job_id: String,

    /// Image URIs; the first entry is the primary image to process.
    #[serde(rename = "imageUrls")]
    pub image_urls: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<OutputSink>,

    #[serde(rename = "imageProcessor")]
    pub image_processor: ModelEndpointDescriptor,

    #[serde(rename = "imageProcessorTileSize", default = "default_tile_size")]
    pub tile_size: u32,

    #[serde(rename = "imageProcessorTileOverlap", default = "default_tile_overlap")]
    pub tile_overlap: u32,

    #[serde(rename = "imageProcessorTileFormat", default)]
    pub tile_format: TileFormat,

    #[serde(rename = "imageProcessorTileCompression", default)]
    pub tile_compression: TileCompression,

    /// Overrides the service-configured region size for this job.
    #[serde(rename = "regionSize", default, skip_serializing_if = "Option::is_none")]
    pub region_size: Option<u32>,

    /// How boundary-straddling duplicates are resolved; the service default
    /// applies when absent.
    #[serde(
        rename = "featureDistillation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub feature_distillation: Option<DistillationMode>,
}

impl ImageRequest {
    /// The primary image this job processes.
    pub fn primary_image_url(&self) -> Option<&str> {
        self.image_urls.first().map(String::as_str)
    }

    /// Validated tile parameters.
    pub fn tile_params(&self) -> Result<TileParams, TilingError> {
        TileParams::new(self.tile_size, self.tile_overlap)
    }

    /// Checks required fields, tile parameter bounds, and the
    /// format/compression table.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.job_id.is_empty() {
            return Err(RequestError::MissingJobId);
        }
        if self.image_urls.is_empty() || self.image_urls.iter().any(String::is_empty) {
            return Err(RequestError::MissingImageUrls);
        }
        self.tile_params()?;
        if !is_valid_tile_encoding(self.tile_format, self.tile_compression) {
            return Err(RequestError::InvalidTileEncoding {
                format: self.tile_format,
                compression: self.tile_compression,
            });
        }
        if let Some(size) = self.region_size {
            if size == 0 {
                return Err(RequestError::InvalidRegionSize(size));
            }
        }
        Ok(())
    }
}
