//! Request model for the work queues.
//!
//! An [`ImageRequest`] arrives on the image queue as JSON. The image
//! workflow validates it, plans regions, and derives self-contained
//! [`RegionRequest`]s for the region queue so that any worker in the fleet
//! can process a region without re-reading the original message.

mod image_request;
mod region_request;
mod sink;

pub use image_request::{ImageRequest, ModelEndpointDescriptor, ModelHost, RequestError};
pub use region_request::RegionRequest;
pub use sink::OutputSink;

use serde::{Deserialize, Serialize};

/// Container format for encoded tiles sent to the model endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TileFormat {
    #[default]
    NITF,
    JPEG,
    PNG,
    GTIFF,
}

impl TileFormat {
    /// Content-Type header sent with tiles in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::NITF => "image/nitf",
            TileFormat::JPEG => "image/jpeg",
            TileFormat::PNG => "image/png",
            TileFormat::GTIFF => "image/tiff",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TileFormat::NITF => "NITF",
            TileFormat::JPEG => "JPEG",
            TileFormat::PNG => "PNG",
            TileFormat::GTIFF => "GTIFF",
        }
    }
}

impl std::fmt::Display for TileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied within the tile container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TileCompression {
    #[default]
    NONE,
    JPEG,
    J2K,
    LZW,
}

impl std::fmt::Display for TileCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TileCompression::NONE => "NONE",
            TileCompression::JPEG => "JPEG",
            TileCompression::J2K => "J2K",
            TileCompression::LZW => "LZW",
        };
        f.write_str(name)
    }
}

/// Whether a format/compression pair is accepted at request validation.
pub fn is_valid_tile_encoding(format: TileFormat, compression: TileCompression) -> bool {
    use TileCompression as C;
    use TileFormat as F;
    matches!(
        (format, compression),
        (F::NITF, C::NONE)
            | (F::NITF, C::JPEG)
            | (F::NITF, C::J2K)
            | (F::GTIFF, C::NONE)
            | (F::GTIFF, C::JPEG)
            | (F::GTIFF, C::LZW)
            | (F::PNG, C::NONE)
            | (F::JPEG, C::NONE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_table() {
        use TileCompression as C;
        use TileFormat as F;

        assert!(is_valid_tile_encoding(F::NITF, C::NONE));
        assert!(is_valid_tile_encoding(F::NITF, C::JPEG));
        assert!(is_valid_tile_encoding(F::NITF, C::J2K));
        assert!(!is_valid_tile_encoding(F::NITF, C::LZW));

        assert!(is_valid_tile_encoding(F::GTIFF, C::LZW));
        assert!(!is_valid_tile_encoding(F::GTIFF, C::J2K));

        assert!(is_valid_tile_encoding(F::PNG, C::NONE));
        assert!(!is_valid_tile_encoding(F::PNG, C::JPEG));

        assert!(is_valid_tile_encoding(F::JPEG, C::NONE));
        assert!(!is_valid_tile_encoding(F::JPEG, C::J2K));
    }

    #[test]
    fn test_format_serde_names() {
        assert_eq!(serde_json::to_string(&TileFormat::GTIFF).unwrap(), "\"GTIFF\"");
        assert_eq!(
            serde_json::from_str::<TileCompression>("\"J2K\"").unwrap(),
            TileCompression::J2K
        );
    }
}
