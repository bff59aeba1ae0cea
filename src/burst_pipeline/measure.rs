//! Histogram and sharpness measurements on RAW frames.

use rayon::prelude::*;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::types::{BAYER_CHANNELS, CameraProfile, RawFrame};
use crate::burst_pipeline::tonemap::color::normalize_as_shot;

pub const HISTOGRAM_BINS: usize = 256;

/// One 256-bin histogram per colour channel (R, G, B).
pub type RgbHistogram = [Vec<u32>; 3];

/// Measurement collaborator used by the auto-settings estimator and reference selection.
pub trait ImageMeasure: Send + Sync {
    /// Histogram of the RAW data before demosaic, lens shading and white balance applied.
    /// Every `downscale`-th Bayer cell is counted.
    fn measure_histogram(&self, frame: &RawFrame, profile: &CameraProfile, downscale: usize) -> Result<RgbHistogram>;

    /// Mean edge strength of the half-resolution luma. Higher is sharper.
    fn measure_sharpness(&self, frame: &RawFrame) -> Result<f32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuImageMeasure;

impl CpuImageMeasure {
    pub fn new() -> Self {
        Self
    }
}

impl ImageMeasure for CpuImageMeasure {
    fn measure_histogram(&self, frame: &RawFrame, profile: &CameraProfile, downscale: usize) -> Result<RgbHistogram> {
        frame.validate()?;
        let downscale = downscale.max(1);

        let metadata = &frame.metadata;
        let white_balance = normalize_as_shot(metadata.as_shot)?;
        let positions = profile.sensor_arrangement.channel_positions();
        let black = profile.black_level.map(|b| b as f32);
        let range = black.map(|b| (profile.white_level as f32 - b).max(1.0));

        let half_width = frame.width / 2;
        let half_height = frame.height / 2;
        let cols = half_width.div_ceil(downscale);
        let rows = half_height.div_ceil(downscale);

        let to_bin = |v: f32| ((v.clamp(0.0, 1.0) * (HISTOGRAM_BINS - 1) as f32).round() as usize).min(HISTOGRAM_BINS - 1);

        let histogram = (0..rows)
            .into_par_iter()
            .fold(
                || [vec![0u32; HISTOGRAM_BINS], vec![0u32; HISTOGRAM_BINS], vec![0u32; HISTOGRAM_BINS]],
                |mut hist, row| {
                    let y = row * downscale;
                    let v = (y as f32 + 0.5) / half_height as f32;
                    for col in 0..cols {
                        let x = col * downscale;
                        let u = (x as f32 + 0.5) / half_width as f32;

                        let bayer: [f32; BAYER_CHANNELS] = std::array::from_fn(|k| {
                            let c = positions[k];
                            let raw = frame.sample(x * 2 + c % 2, y * 2 + c / 2) as f32;
                            let gain = metadata.color_correction[k] * metadata.lens_shading_map[k].sample(u, v);
                            ((raw - black[c]) / range[c]).max(0.0) * gain
                        });

                        let rgb = [
                            bayer[0] / white_balance[0],
                            0.5 * (bayer[1] + bayer[2]) / white_balance[1],
                            bayer[3] / white_balance[2],
                        ];
                        for (channel, value) in hist.iter_mut().zip(rgb) {
                            channel[to_bin(value)] += 1;
                        }
                    }
                    hist
                },
            )
            .reduce(
                || [vec![0u32; HISTOGRAM_BINS], vec![0u32; HISTOGRAM_BINS], vec![0u32; HISTOGRAM_BINS]],
                |mut a, b| {
                    for (ca, cb) in a.iter_mut().zip(b.iter()) {
                        ca.iter_mut().zip(cb).for_each(|(x, y)| *x += y);
                    }
                    a
                },
            );

        Ok(histogram)
    }

    fn measure_sharpness(&self, frame: &RawFrame) -> Result<f32> {
        frame.validate()?;

        let width = frame.width / 2;
        let height = frame.height / 2;
        if width < 3 || height < 3 {
            return Err(FusionError::InvalidDimensions(frame.width, frame.height));
        }

        let luma: Vec<f32> = (0..width * height)
            .into_par_iter()
            .map(|i| {
                let (x, y) = (i % width * 2, i / width * 2);
                (frame.sample(x, y) as f32
                    + frame.sample(x + 1, y) as f32
                    + frame.sample(x, y + 1) as f32
                    + frame.sample(x + 1, y + 1) as f32)
                    / 4.0
            })
            .collect();

        // Sobel magnitude over the interior
        let total: f64 = (1..height - 1)
            .into_par_iter()
            .map(|y| {
                let at = |x: usize, y: usize| luma[y * width + x];
                let mut sum = 0.0f64;
                for x in 1..width - 1 {
                    let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                        - at(x - 1, y - 1)
                        - 2.0 * at(x - 1, y)
                        - at(x - 1, y + 1);
                    let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                        - at(x - 1, y - 1)
                        - 2.0 * at(x, y - 1)
                        - at(x + 1, y - 1);
                    sum += (gx * gx + gy * gy).sqrt() as f64;
                }
                sum
            })
            .sum();

        Ok((total / ((width - 2) * (height - 2)) as f64) as f32)
    }
}
