//! Imagery collaborator contract.
//!
//! Images live in a range-readable object store and are decoded by an
//! external library; this module defines the narrow contract the workflows
//! depend on: open an image's metadata, and read a rectangle of pixels.
//! [`SyntheticImageReader`] is an in-memory implementation used by tests and
//! local development, standing in for the store-backed decoder.

use crate::feature::SourceMetadata;
use crate::tiling::PixelRect;
use dashmap::DashMap;
use image::RgbaImage;
use std::future::Future;
use thiserror::Error;

/// Errors from the imagery collaborator.
#[derive(Debug, Clone, Error)]
pub enum ImageReadError {
    /// The URI does not resolve to an object. Permanent.
    #[error("image not found: {0}")]
    NotFound(String),

    /// The object exists but cannot be decoded. Permanent.
    #[error("cannot decode image {uri}: {message}")]
    Decode { uri: String, message: String },

    /// Store or network failure. Transient: surfaced to the queue
    /// coordinator for redelivery.
    #[error("i/o error reading {uri}: {message}")]
    Io { uri: String, message: String },

    /// The requested rectangle falls outside the image.
    #[error("requested window {window} exceeds image {uri}")]
    WindowOutOfBounds { uri: String, window: PixelRect },
}

impl ImageReadError {
    /// Transient errors benefit from queue redelivery; permanent ones mark
    /// the job FAILED.
    pub fn is_transient(&self) -> bool {
        matches!(self, ImageReadError::Io { .. })
    }
}

/// Metadata the decoder extracts from an image header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    /// Affine geotransform when the image is georeferenced.
    pub geo_transform: Option<[f64; 6]>,
    /// Platform or sensor identifier.
    pub source_id: Option<String>,
    /// Collection time, RFC 3339.
    pub collection_dt: Option<String>,
    /// Security / handling marking.
    pub category: Option<String>,
    /// Container format reported by the decoder (e.g. "GTIFF").
    pub format: Option<String>,
}

/// An opened image: dimensions plus header metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub metadata: ImageMetadata,
}

impl ImageInfo {
    /// Source provenance stamped onto every feature lifted from this image.
    pub fn source_metadata(&self) -> SourceMetadata {
        SourceMetadata {
            source: self.uri.clone(),
            format: self.metadata.format.clone(),
            category: Some(
                self.metadata
                    .category
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
            ),
            source_id: self.metadata.source_id.clone(),
            source_dt: self.metadata.collection_dt.clone(),
        }
    }
}

/// Opens images and reads pixel windows from them.
pub trait ImageReader: Send + Sync + 'static {
    /// Reads the image header: dimensions and metadata.
    fn open(&self, uri: &str) -> impl Future<Output = Result<ImageInfo, ImageReadError>> + Send;

    /// Reads a window of pixels in full-image coordinates.
    fn read_window(
        &self,
        uri: &str,
        window: PixelRect,
    ) -> impl Future<Output = Result<RgbaImage, ImageReadError>> + Send;
}

/// In-memory imagery for tests and local development.
///
/// Registered images have deterministic gradient pixels so tile payloads
/// are stable without storing rasters.
#[derive(Default)]
pub struct SyntheticImageReader {
    images: DashMap<String, ImageInfo>,
}

impl SyntheticImageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an image with the given dimensions and metadata.
    pub fn add_image(&self, uri: &str, width: u32, height: u32, metadata: ImageMetadata) {
        self.images.insert(
            uri.to_string(),
            ImageInfo {
                uri: uri.to_string(),
                width,
                height,
                metadata,
            },
        );
    }
}

impl ImageReader for SyntheticImageReader {
    async fn open(&self, uri: &str) -> Result<ImageInfo, ImageReadError> {
        self.images
            .get(uri)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ImageReadError::NotFound(uri.to_string()))
    }

    async fn read_window(
        &self,
        uri: &str,
        window: PixelRect,
    ) -> Result<RgbaImage, ImageReadError> {
        let info = self.open(uri).await?;
        let image_rect = PixelRect::new(0, 0, info.width, info.height);
        if !image_rect.contains(&window) {
            return Err(ImageReadError::WindowOutOfBounds {
                uri: uri.to_string(),
                window,
            });
        }
        Ok(RgbaImage::from_fn(window.width, window.height, |x, y| {
            let gx = (window.ul_x + x) % 256;
            let gy = (window.ul_y + y) % 256;
            image::Rgba([gx as u8, gy as u8, 64, 255])
        }))
    }
}
