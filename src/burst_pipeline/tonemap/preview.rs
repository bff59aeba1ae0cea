//! Downscaled, tone-mapped previews straight from a RAW frame.

use image::RgbImage;
use rayon::prelude::*;
use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::types::{
    BAYER_CHANNELS, CameraProfile, RawFrame, ScreenOrientation, ShadingMap,
};
use crate::burst_pipeline::settings::PostProcessSettings;
use crate::burst_pipeline::tonemap::color::{ColorScience, DngColorScience, white_balance_transform};
use crate::burst_pipeline::tonemap::curve::ToneCurve;

/// Renders small previews used by the auto-settings estimator.
pub trait PreviewRenderer: Send + Sync {
    /// Renders `frame` at `1 / (2 * downscale)` of the mosaic size, rotated for its screen orientation.
    fn create_preview(
        &self,
        frame: &RawFrame,
        downscale: u32,
        profile: &CameraProfile,
        settings: &PostProcessSettings,
    ) -> Result<RgbImage>;
}

/// Everything a preview routine reads.
pub struct PreviewInput<'a> {
    pub frame: &'a RawFrame,
    pub profile: &'a CameraProfile,
    pub curve: ToneCurve,
    pub flipped: bool,
}

pub type PreviewRoutine = fn(&PreviewInput<'_>) -> RgbImage;

const LANDSCAPE: u8 = 0;
const PORTRAIT: u8 = 1;
const REVERSE_LANDSCAPE: u8 = 2;
const REVERSE_PORTRAIT: u8 = 3;

/// One routine per (orientation, downscale) pair.
const PREVIEW_ROUTINES: [((ScreenOrientation, u32), PreviewRoutine); 12] = [
    ((ScreenOrientation::Landscape, 2), render::<2, LANDSCAPE>),
    ((ScreenOrientation::Landscape, 4), render::<4, LANDSCAPE>),
    ((ScreenOrientation::Landscape, 8), render::<8, LANDSCAPE>),
    ((ScreenOrientation::Portrait, 2), render::<2, PORTRAIT>),
    ((ScreenOrientation::Portrait, 4), render::<4, PORTRAIT>),
    ((ScreenOrientation::Portrait, 8), render::<8, PORTRAIT>),
    ((ScreenOrientation::ReverseLandscape, 2), render::<2, REVERSE_LANDSCAPE>),
    ((ScreenOrientation::ReverseLandscape, 4), render::<4, REVERSE_LANDSCAPE>),
    ((ScreenOrientation::ReverseLandscape, 8), render::<8, REVERSE_LANDSCAPE>),
    ((ScreenOrientation::ReversePortrait, 2), render::<2, REVERSE_PORTRAIT>),
    ((ScreenOrientation::ReversePortrait, 4), render::<4, REVERSE_PORTRAIT>),
    ((ScreenOrientation::ReversePortrait, 8), render::<8, REVERSE_PORTRAIT>),
];

/// Looks up the routine for `orientation` at `downscale`.
pub fn preview_routine(orientation: ScreenOrientation, downscale: u32) -> Result<PreviewRoutine> {
    PREVIEW_ROUTINES
        .iter()
        .find(|(key, _)| *key == (orientation, downscale))
        .map(|(_, routine)| *routine)
        .ok_or(FusionError::UnsupportedDownscale(downscale))
}

pub struct CpuPreviewRenderer<C: ColorScience = DngColorScience> {
    color: C,
}

impl CpuPreviewRenderer<DngColorScience> {
    pub fn new() -> Self {
        Self {
            color: DngColorScience,
        }
    }
}

impl Default for CpuPreviewRenderer<DngColorScience> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ColorScience> CpuPreviewRenderer<C> {
    pub fn with_color_science(color: C) -> Self {
        Self { color }
    }
}

impl<C: ColorScience> PreviewRenderer for CpuPreviewRenderer<C> {
    fn create_preview(
        &self,
        frame: &RawFrame,
        downscale: u32,
        profile: &CameraProfile,
        settings: &PostProcessSettings,
    ) -> Result<RgbImage> {
        let metadata = &frame.metadata;
        if metadata.lens_shading_map.len() != BAYER_CHANNELS {
            return Err(FusionError::InvalidLensShadingMap(metadata.lens_shading_map.len()));
        }

        let routine = preview_routine(metadata.screen_orientation, downscale)?;

        let scale = 2 * downscale as usize;
        if frame.width < scale || frame.height < scale {
            return Err(FusionError::InvalidDimensions(frame.width, frame.height));
        }
        frame.validate()?;

        let transform = white_balance_transform(&self.color, profile, metadata, settings)?;
        let input = PreviewInput {
            frame,
            profile,
            curve: ToneCurve::new(settings, transform),
            flipped: metadata.flipped || settings.flipped,
        };

        let preview = routine(&input);
        debug!(
            "Preview of {} at 1/{}: {}x{}",
            frame.id,
            downscale,
            preview.width(),
            preview.height()
        );

        Ok(preview)
    }
}

fn render<const DOWNSCALE: usize, const ORIENTATION: u8>(input: &PreviewInput<'_>) -> RgbImage {
    let frame = input.frame;
    let width = frame.width / 2 / DOWNSCALE;
    let height = frame.height / 2 / DOWNSCALE;

    let black = input.profile.black_level.map(|b| b as f32);
    let range = black.map(|b| (input.profile.white_level as f32 - b).max(1.0));
    let positions = input.profile.sensor_arrangement.channel_positions();
    let shading: &[ShadingMap] = &frame.metadata.lens_shading_map;
    let norm = (DOWNSCALE * DOWNSCALE) as f32;

    let mut landscape = vec![[0u8; 3]; width * height];
    landscape.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        let v = (y as f32 + 0.5) / height as f32;
        for (x, out) in row.iter_mut().enumerate() {
            let u = (x as f32 + 0.5) / width as f32;

            // Mean of each cell position over the DOWNSCALE x DOWNSCALE block
            let mut cells = [0.0f32; BAYER_CHANNELS];
            for j in 0..DOWNSCALE {
                let sy = (y * DOWNSCALE + j) * 2;
                for i in 0..DOWNSCALE {
                    let sx = (x * DOWNSCALE + i) * 2;
                    for (c, cell) in cells.iter_mut().enumerate() {
                        *cell += frame.sample(sx + c % 2, sy + c / 2) as f32;
                    }
                }
            }

            let bayer: [f32; BAYER_CHANNELS] = std::array::from_fn(|k| {
                let c = positions[k];
                let value = ((cells[c] / norm - black[c]) / range[c]).max(0.0);
                value * shading[k].sample(u, v)
            });

            let camera = [bayer[0], 0.5 * (bayer[1] + bayer[2]), bayer[3]];
            *out = input.curve.apply_u8(camera);
        }
    });

    let portrait = ORIENTATION == PORTRAIT || ORIENTATION == REVERSE_PORTRAIT;
    let (out_width, out_height) = if portrait { (height, width) } else { (width, height) };

    RgbImage::from_fn(out_width as u32, out_height as u32, |ox, oy| {
        let ox = if input.flipped {
            out_width - 1 - ox as usize
        } else {
            ox as usize
        };
        let oy = oy as usize;

        let (lx, ly) = match ORIENTATION {
            PORTRAIT => (oy, height - 1 - ox),
            REVERSE_LANDSCAPE => (width - 1 - ox, height - 1 - oy),
            REVERSE_PORTRAIT => (width - 1 - oy, ox),
            _ => (ox, oy),
        };

        image::Rgb(landscape[ly * width + lx])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst_pipeline::raw::types::RawMetadata;

    fn gradient_frame(width: usize, height: usize, metadata: RawMetadata) -> RawFrame {
        // Brightness grows left to right
        let values: Vec<u16> = (0..width * height)
            .map(|i| 64 + ((i % width) * 900 / width) as u16)
            .collect();
        RawFrame::from_u16("preview", width, height, &values, metadata)
    }

    fn render_with(orientation: ScreenOrientation, flipped: bool, downscale: u32) -> Result<RgbImage> {
        let metadata = RawMetadata {
            screen_orientation: orientation,
            flipped,
            ..RawMetadata::default()
        };
        CpuPreviewRenderer::new().create_preview(
            &gradient_frame(64, 32, metadata),
            downscale,
            &CameraProfile::default(),
            &PostProcessSettings::default(),
        )
    }

    #[test]
    fn test_every_orientation_and_downscale_has_a_routine() {
        for orientation in [
            ScreenOrientation::Landscape,
            ScreenOrientation::Portrait,
            ScreenOrientation::ReverseLandscape,
            ScreenOrientation::ReversePortrait,
        ] {
            for downscale in [2, 4, 8] {
                assert!(preview_routine(orientation, downscale).is_ok());
            }
        }
    }

    #[test]
    fn test_unsupported_downscale() {
        assert!(matches!(
            render_with(ScreenOrientation::Landscape, false, 3),
            Err(FusionError::UnsupportedDownscale(3))
        ));
        assert!(matches!(
            render_with(ScreenOrientation::Landscape, false, 16),
            Err(FusionError::UnsupportedDownscale(16))
        ));
    }

    #[test]
    fn test_invalid_shading_map_count() {
        let metadata = RawMetadata {
            lens_shading_map: vec![ShadingMap::flat(2, 2); 2],
            ..RawMetadata::default()
        };
        let result = CpuPreviewRenderer::new().create_preview(
            &gradient_frame(64, 32, metadata),
            2,
            &CameraProfile::default(),
            &PostProcessSettings::default(),
        );
        assert!(matches!(result, Err(FusionError::InvalidLensShadingMap(2))));
    }

    #[test]
    fn test_zero_white_balance() {
        let metadata = RawMetadata {
            as_shot: [0.0; 3],
            ..RawMetadata::default()
        };
        let result = CpuPreviewRenderer::new().create_preview(
            &gradient_frame(64, 32, metadata),
            2,
            &CameraProfile::default(),
            &PostProcessSettings::default(),
        );
        assert!(matches!(result, Err(FusionError::ZeroWhiteBalance)));
    }

    #[test]
    fn test_landscape_size_and_gradient() {
        let preview = render_with(ScreenOrientation::Landscape, false, 2).unwrap();
        assert_eq!(preview.dimensions(), (16, 8));
        assert!(preview.get_pixel(15, 4).0[1] > preview.get_pixel(0, 4).0[1]);
    }

    #[test]
    fn test_portrait_swaps_dimensions() {
        let preview = render_with(ScreenOrientation::Portrait, false, 4).unwrap();
        assert_eq!(preview.dimensions(), (4, 8));

        // Rotated clockwise: the bright right edge ends up at the bottom
        assert!(preview.get_pixel(0, 7).0[1] > preview.get_pixel(0, 0).0[1]);
    }

    #[test]
    fn test_reverse_landscape_and_flip() {
        let reversed = render_with(ScreenOrientation::ReverseLandscape, false, 2).unwrap();
        assert!(reversed.get_pixel(0, 4).0[1] > reversed.get_pixel(15, 4).0[1]);

        let flipped = render_with(ScreenOrientation::Landscape, true, 2).unwrap();
        let plain = render_with(ScreenOrientation::Landscape, false, 2).unwrap();
        assert_eq!(flipped.get_pixel(0, 0), plain.get_pixel(15, 0));
    }
}
