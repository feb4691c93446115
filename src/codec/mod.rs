//! Tile payload encoding.
//!
//! Tiles are cut from the source image as raw rasters and must be encoded
//! into the container format the model endpoint expects before dispatch.
//! PNG, JPEG, and GeoTIFF (uncompressed and LZW) are handled natively;
//! NITF and JPEG2000 have no pure-Rust codec and are the province of an
//! external codec plugged in behind the same entry points, so the built-in
//! encoder reports them as unsupported rather than guessing.

use crate::api::{TileCompression, TileFormat};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use thiserror::Error;
use tiff::encoder::{colortype, compression, TiffEncoder};

/// JPEG quality used for both the JPEG container and JPEG-in-container
/// compression.
const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The format/compression pair passed request validation but has no
    /// built-in codec. Permanent for the tile.
    #[error("no codec available for {format} with {compression} compression")]
    Unsupported {
        format: TileFormat,
        compression: TileCompression,
    },

    #[error("tile encode failed: {0}")]
    Encode(String),

    #[error("tile decode failed: {0}")]
    Decode(String),
}

/// Encodes a tile raster into the requested container format.
pub fn encode_tile(
    pixels: &RgbaImage,
    format: TileFormat,
    compression: TileCompression,
) -> Result<Vec<u8>, CodecError> {
    match (format, compression) {
        (TileFormat::PNG, TileCompression::NONE) => encode_png(pixels),
        (TileFormat::JPEG, TileCompression::NONE) => encode_jpeg(pixels),
        (TileFormat::GTIFF, TileCompression::NONE) => {
            encode_tiff(pixels, compression::Uncompressed)
        }
        (TileFormat::GTIFF, TileCompression::LZW) => encode_tiff(pixels, compression::Lzw),
        (format, compression) => Err(CodecError::Unsupported {
            format,
            compression,
        }),
    }
}

/// Decodes a tile payload back into a raster, sniffing the container.
///
/// Used by round-trip verification and test endpoints; the production model
/// endpoint does its own decoding.
pub fn decode_tile(bytes: &[u8]) -> Result<RgbaImage, CodecError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|err| CodecError::Decode(err.to_string()))
}

fn encode_png(pixels: &RgbaImage) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Cursor::new(Vec::new());
    pixels
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}

fn encode_jpeg(pixels: &RgbaImage) -> Result<Vec<u8>, CodecError> {
    // JPEG carries no alpha channel
    let rgb = DynamicImage::ImageRgba8(pixels.clone()).to_rgb8();
    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}

fn encode_tiff<C>(pixels: &RgbaImage, compression: C) -> Result<Vec<u8>, CodecError>
where
    C: compression::Compression + Clone,
{
    let mut buffer = Cursor::new(Vec::new());
    let mut encoder =
        TiffEncoder::new(&mut buffer).map_err(|err| CodecError::Encode(err.to_string()))?;
    encoder
        .write_image_with_compression::<colortype::RGBA8, C>(
            pixels.width(),
            pixels.height(),
            compression,
            pixels.as_raw(),
        )
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}
