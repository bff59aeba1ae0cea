//! Splits a Bayer mosaic into four half-resolution planes plus an 8-bit luma preview.

use image::GrayImage;
use rayon::prelude::*;
use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::types::{BAYER_CHANNELS, CameraProfile, RawFrame, RawMetadata};
use crate::burst_pipeline::wavelet::types::DENOISE_LEVELS;

/// Half-resolution planes are padded to a multiple of this so every wavelet level halves evenly.
pub const EDGE_ALIGNMENT: usize = 1 << DENOISE_LEVELS;

/// A RAW frame as four half-resolution planes, one per Bayer cell position
/// (top-left, top-right, bottom-left, bottom-right).
#[derive(Debug, Clone)]
pub struct HalfResRaw {
    /// Padded plane width
    pub width: usize,
    /// Padded plane height
    pub height: usize,
    /// Plane width before edge extension
    pub valid_width: usize,
    /// Plane height before edge extension
    pub valid_height: usize,
    /// Sensor values, black level not subtracted
    pub channels: [Vec<u16>; BAYER_CHANNELS],
    /// Gamma-encoded luma used for flow estimation and measurements
    pub preview: GrayImage,
    pub metadata: RawMetadata,
}

impl HalfResRaw {
    #[inline]
    pub fn at(&self, channel: usize, x: usize, y: usize) -> u16 {
        self.channels[channel][y * self.width + x]
    }

    pub fn channel(&self, channel: usize) -> &[u16] {
        &self.channels[channel]
    }

    /// Number of padding columns and rows added on the right and bottom.
    pub fn extension(&self) -> (usize, usize) {
        (self.width - self.valid_width, self.height - self.valid_height)
    }
}

/// Deinterleaves `frame` into half-resolution planes.
///
/// With `extend_edges` the planes are padded on the right and bottom by edge replication up to
/// a multiple of [`EDGE_ALIGNMENT`].
pub fn deinterleave(frame: &RawFrame, profile: &CameraProfile, extend_edges: bool) -> Result<HalfResRaw> {
    frame.validate()?;

    let valid_width = frame.width / 2;
    let valid_height = frame.height / 2;

    let (width, height) = if extend_edges {
        (
            valid_width.div_ceil(EDGE_ALIGNMENT) * EDGE_ALIGNMENT,
            valid_height.div_ceil(EDGE_ALIGNMENT) * EDGE_ALIGNMENT,
        )
    } else {
        (valid_width, valid_height)
    };

    debug!(
        "Deinterleaving {} ({}x{}) into {}x{} planes",
        frame.id, frame.width, frame.height, width, height
    );

    let channels: [Vec<u16>; BAYER_CHANNELS] = std::array::from_fn(|c| {
        let (dx, dy) = (c % 2, c / 2);
        let mut plane = vec![0u16; width * height];
        plane.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let sy = y.min(valid_height - 1) * 2 + dy;
            for (x, out) in row.iter_mut().enumerate() {
                let sx = x.min(valid_width - 1) * 2 + dx;
                *out = frame.sample(sx, sy);
            }
        });
        plane
    });

    let preview = build_preview(&channels, width, height, profile)?;

    Ok(HalfResRaw {
        width,
        height,
        valid_width,
        valid_height,
        channels,
        preview,
        metadata: frame.metadata.clone(),
    })
}

fn build_preview(
    channels: &[Vec<u16>; BAYER_CHANNELS],
    width: usize,
    height: usize,
    profile: &CameraProfile,
) -> Result<GrayImage> {
    let black: f32 = profile.black_level.iter().map(|&b| b as f32).sum::<f32>() / 4.0;
    let range = (profile.white_level as f32 - black).max(1.0);

    let mut luma = vec![0u8; width * height];
    luma.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, out) in row.iter_mut().enumerate() {
            let i = y * width + x;
            let sum: f32 = channels.iter().map(|plane| plane[i] as f32).sum();
            let linear = ((sum / 4.0 - black) / range).clamp(0.0, 1.0);
            *out = (linear.powf(1.0 / 2.2) * 255.0).round() as u8;
        }
    });

    GrayImage::from_raw(width as u32, height as u32, luma).ok_or_else(|| {
        FusionError::InvalidFrameData(format!("preview buffer does not match {}x{}", width, height))
    })
}
