use std::io::Write;

use image::RgbImage;

use crate::burst_pipeline::common::error::Result;
use crate::burst_pipeline::fusion::accumulator::BayerMosaic;

/// Writes the merged RAW as a single-channel Bayer mosaic.
pub trait MosaicWriter {
    fn write_mosaic(&self, mosaic: &BayerMosaic, output: &mut dyn Write) -> Result<()>;
}

/// Writes the final tone-mapped image.
pub trait ImageWriter {
    fn write_image(&self, image: &RgbImage, quality: u8, output: &mut dyn Write) -> Result<()>;
}
