use std::io::Write;

use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::fusion::accumulator::BayerMosaic;
use crate::burst_pipeline::output::types::TiffCompression;
use crate::burst_pipeline::output::writer::MosaicWriter;

/// 16-bit grayscale TIFF of an RGGB mosaic.
pub struct BayerTiffWriter {
    compression: TiffCompression,
}

impl BayerTiffWriter {
    pub fn new(compression: TiffCompression) -> Self {
        Self { compression }
    }
}

impl Default for BayerTiffWriter {
    fn default() -> Self {
        Self::new(TiffCompression::None)
    }
}

impl MosaicWriter for BayerTiffWriter {
    fn write_mosaic(&self, mosaic: &BayerMosaic, output: &mut dyn Write) -> Result<()> {
        debug!("Encoding Bayer TIFF: {}x{}", mosaic.width, mosaic.height);

        if mosaic.data.len() != mosaic.width * mosaic.height {
            return Err(FusionError::InvalidDimensions(mosaic.width, mosaic.height));
        }

        let mut buffer = Vec::new();

        let compression = match self.compression {
            TiffCompression::None => tiff::encoder::Compression::Uncompressed,
            TiffCompression::Lzw => tiff::encoder::Compression::Lzw,
            TiffCompression::DeflateFast => {
                tiff::encoder::Compression::Deflate(tiff::encoder::compression::DeflateLevel::Fast)
            }
            TiffCompression::DeflateBalanced => {
                tiff::encoder::Compression::Deflate(tiff::encoder::compression::DeflateLevel::Balanced)
            }
            TiffCompression::DeflateBest => {
                tiff::encoder::Compression::Deflate(tiff::encoder::compression::DeflateLevel::Best)
            }
        };

        let mut encoder = tiff::encoder::TiffEncoder::new(std::io::Cursor::new(&mut buffer))
            .map_err(|e| FusionError::EncodeError(e.to_string()))?
            .with_compression(compression);

        encoder
            .write_image::<tiff::encoder::colortype::Gray16>(mosaic.width as u32, mosaic.height as u32, &mosaic.data)
            .map_err(|e| FusionError::EncodeError(e.to_string()))?;

        output.write_all(&buffer)?;

        debug!("TIFF encoding complete");
        Ok(())
    }
}
