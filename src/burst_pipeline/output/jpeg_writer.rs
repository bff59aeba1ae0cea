use std::io::Write;

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::output::writer::ImageWriter;

/// Baseline JPEG via the `image` crate encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegWriter;

impl ImageWriter for JpegWriter {
    fn write_image(&self, image: &RgbImage, quality: u8, output: &mut dyn Write) -> Result<()> {
        let quality = quality.clamp(1, 100);
        debug!("Encoding JPEG: {}x{} quality {}", image.width(), image.height(), quality);

        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality)
            .encode_image(image)
            .map_err(|e| FusionError::EncodeError(e.to_string()))?;

        output.write_all(&buffer)?;
        Ok(())
    }
}
