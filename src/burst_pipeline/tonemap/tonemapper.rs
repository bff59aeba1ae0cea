//! Demosaic and tone-map the merged RAW into the final RGB image.

use std::io::Cursor;

use bayer::{BayerDepth, CFA, Demosaic, RasterDepth, RasterMut};
use image::{Rgb, Rgb32FImage, RgbImage, imageops};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::fusion::accumulator::{BayerMosaic, MergedRaw};
use crate::burst_pipeline::raw::types::{BAYER_CHANNELS, CameraProfile, ScreenOrientation};
use crate::burst_pipeline::settings::PostProcessSettings;
use crate::burst_pipeline::tonemap::color::{ColorScience, DngColorScience, white_balance_transform};
use crate::burst_pipeline::tonemap::curve::{ToneCurve, luma, to_u8};

const FINE_SHARPEN_SIGMA: f32 = 1.0;
const COARSE_SHARPEN_SIGMA: f32 = 2.5;

/// Tone-mapping and demosaic collaborator applied once to the merged RAW.
pub trait ToneMapper: Send + Sync {
    fn tone_map(
        &self,
        merged: &MergedRaw,
        profile: &CameraProfile,
        settings: &PostProcessSettings,
    ) -> Result<RgbImage>;
}

pub struct CpuToneMapper<C: ColorScience = DngColorScience> {
    color: C,
}

impl CpuToneMapper<DngColorScience> {
    pub fn new() -> Self {
        Self {
            color: DngColorScience,
        }
    }
}

impl Default for CpuToneMapper<DngColorScience> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ColorScience> CpuToneMapper<C> {
    pub fn with_color_science(color: C) -> Self {
        Self { color }
    }

    /// Applies lens shading to an RGGB mosaic in place.
    fn shade(mosaic: &mut BayerMosaic, merged: &MergedRaw) {
        let maps = &merged.metadata.lens_shading_map;
        let (width, height) = (mosaic.width, mosaic.height);

        mosaic.data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            let v = (y as f32 + 0.5) / height as f32;
            for (x, value) in row.iter_mut().enumerate() {
                let u = (x as f32 + 0.5) / width as f32;
                let gain = maps[(y % 2) * 2 + x % 2].sample(u, v);
                *value = (*value as f32 * gain).round().min(u16::MAX as f32) as u16;
            }
        });
    }

    fn demosaic(mosaic: &BayerMosaic) -> Result<Vec<u16>> {
        let bayer_bytes: Vec<u8> = mosaic.data.iter().flat_map(|&val| val.to_le_bytes()).collect();
        let mut output_buf = vec![0u8; mosaic.width * mosaic.height * 3 * 2];
        let mut cursor = Cursor::new(&bayer_bytes[..]);

        debug!(
            "Running demosaic on {}x{} mosaic, CFA=RGGB, algo=Linear",
            mosaic.width, mosaic.height
        );

        let mut output_raster = RasterMut::new(mosaic.width, mosaic.height, RasterDepth::Depth16, &mut output_buf);

        bayer::run_demosaic(
            &mut cursor,
            BayerDepth::Depth16LE,
            CFA::RGGB,
            Demosaic::Linear,
            &mut output_raster,
        )
        .map_err(|e| FusionError::DecodeError(format!("Demosaic failed: {:?}", e)))?;

        Ok(output_buf
            .chunks_exact(2)
            .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
            .collect())
    }
}

impl<C: ColorScience> ToneMapper for CpuToneMapper<C> {
    fn tone_map(
        &self,
        merged: &MergedRaw,
        profile: &CameraProfile,
        settings: &PostProcessSettings,
    ) -> Result<RgbImage> {
        let shading_maps = merged.metadata.lens_shading_map.len();
        if shading_maps != BAYER_CHANNELS {
            return Err(FusionError::InvalidLensShadingMap(shading_maps));
        }
        if merged.valid_width == 0 || merged.valid_height == 0 {
            return Err(FusionError::InvalidDimensions(merged.valid_width, merged.valid_height));
        }

        let transform = white_balance_transform(&self.color, profile, &merged.metadata, settings)?;
        let curve = ToneCurve::new(settings, transform);

        let mut mosaic = merged.to_rggb_mosaic(profile.sensor_arrangement);
        Self::shade(&mut mosaic, merged);

        let (width, height) = (mosaic.width, mosaic.height);
        info!("Tone mapping merged RAW {}x{}", width, height);

        let rgb = Self::demosaic(&mosaic)?;
        let scale = 1.0 / MergedRaw::WHITE_LEVEL as f32;

        let mut toned = vec![0.0f32; width * height * 3];
        toned
            .par_chunks_mut(3)
            .zip(rgb.par_chunks_exact(3))
            .for_each(|(out, pixel)| {
                let camera = [pixel[0] as f32 * scale, pixel[1] as f32 * scale, pixel[2] as f32 * scale];
                out.copy_from_slice(&curve.apply(camera));
            });

        let mut image = Rgb32FImage::from_raw(width as u32, height as u32, toned).ok_or_else(|| {
            FusionError::InvalidFrameData(format!("tone-mapped buffer does not match {}x{}", width, height))
        })?;

        if settings.chroma_eps > 0.0 {
            let _span = tracing::debug_span!("chroma_smoothing").entered();
            image = smooth_chroma(&image, (settings.chroma_eps / 8.0).clamp(0.5, 4.0));
        }
        if settings.sharpen0 > 0.0 {
            image = unsharp(&image, FINE_SHARPEN_SIGMA, settings.sharpen0);
        }
        if settings.sharpen1 > 0.0 {
            image = unsharp(&image, COARSE_SHARPEN_SIGMA, settings.sharpen1);
        }

        let output = RgbImage::from_fn(width as u32, height as u32, |x, y| Rgb(to_u8(image.get_pixel(x, y).0)));

        Ok(orient(
            output,
            merged.metadata.screen_orientation,
            merged.metadata.flipped || settings.flipped,
        ))
    }
}

/// Keeps the luma of `image` and takes chroma from a blurred copy.
fn smooth_chroma(image: &Rgb32FImage, sigma: f32) -> Rgb32FImage {
    let blurred = imageops::blur(image, sigma);
    let mut output = image.clone();

    for (pixel, smooth) in output.pixels_mut().zip(blurred.pixels()) {
        let l = luma(pixel.0);
        let ls = luma(smooth.0);
        pixel.0 = smooth.0.map(|v| (l + v - ls).clamp(0.0, 1.0));
    }
    output
}

fn unsharp(image: &Rgb32FImage, sigma: f32, amount: f32) -> Rgb32FImage {
    let blurred = imageops::blur(image, sigma);
    let mut output = image.clone();

    for (pixel, smooth) in output.pixels_mut().zip(blurred.pixels()) {
        for (v, s) in pixel.0.iter_mut().zip(smooth.0) {
            *v = (*v + amount * (*v - s)).clamp(0.0, 1.0);
        }
    }
    output
}

/// Rotates a landscape render for display in `orientation`, mirrored when `flipped`.
pub fn orient(image: RgbImage, orientation: ScreenOrientation, flipped: bool) -> RgbImage {
    let rotated = match orientation {
        ScreenOrientation::Landscape => image,
        ScreenOrientation::Portrait => imageops::rotate90(&image),
        ScreenOrientation::ReverseLandscape => imageops::rotate180(&image),
        ScreenOrientation::ReversePortrait => imageops::rotate270(&image),
    };

    if flipped {
        imageops::flip_horizontal(&rotated)
    } else {
        rotated
    }
}
