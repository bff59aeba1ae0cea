//! Histogram-driven estimation of tone-mapping settings from a single reference frame.

use image::{GrayImage, RgbImage, imageops};
use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::burst_pipeline::common::error::Result;
use crate::burst_pipeline::measure::ImageMeasure;
use crate::burst_pipeline::raw::deinterleave::deinterleave;
use crate::burst_pipeline::raw::types::{CameraProfile, RawFrame};
use crate::burst_pipeline::settings::{AutoSettingsMode, HistogramThresholds, PostProcessSettings};
use crate::burst_pipeline::tonemap::color::ColorScience;
use crate::burst_pipeline::tonemap::preview::PreviewRenderer;

/// Preview luma histogram bins, covering `[0, 256)`.
pub const LUMA_BINS: usize = 255;

const SHADOWS_START: u32 = 2;
const SHADOWS_STEP: u32 = 2;
const SHADOWS_CEILING: u32 = 16;
/// Stop lifting once mean luma grows by less than this factor
const SHADOWS_MIN_GAIN: f32 = 1.03;
const BASIC_PREVIEW_DOWNSCALE: u32 = 8;
const FULL_PREVIEW_DOWNSCALE: u32 = 4;
/// Fraction of a channel allowed above the exposure bin
const CLIPPED_FRACTION: f64 = 1e-4;

/// Derives initial post-processing settings from a reference frame.
pub struct AutoSettingsEstimator<'a, P: ?Sized, M: ?Sized, C: ?Sized> {
    renderer: &'a P,
    measure: &'a M,
    color: &'a C,
    thresholds: HistogramThresholds,
}

impl<'a, P, M, C> AutoSettingsEstimator<'a, P, M, C>
where
    P: PreviewRenderer + ?Sized,
    M: ImageMeasure + ?Sized,
    C: ColorScience + ?Sized,
{
    pub fn new(renderer: &'a P, measure: &'a M, color: &'a C, thresholds: HistogramThresholds) -> Self {
        Self {
            renderer,
            measure,
            color,
            thresholds,
        }
    }

    pub fn estimate(&self, mode: AutoSettingsMode, frame: &RawFrame, profile: &CameraProfile) -> Result<PostProcessSettings> {
        match mode {
            AutoSettingsMode::Basic => self.estimate_basic_settings(frame, profile),
            AutoSettingsMode::Full => self.estimate_settings(frame, profile),
        }
    }

    /// White balance, shadows, black and white point.
    #[instrument(skip_all, fields(frame = %frame.id))]
    pub fn estimate_basic_settings(&self, frame: &RawFrame, profile: &CameraProfile) -> Result<PostProcessSettings> {
        let mut settings = self.initial_settings(frame, profile)?;
        settings.shadows = self.estimate_shadows(frame, profile, &settings)?;

        let preview = self.renderer.create_preview(frame, BASIC_PREVIEW_DOWNSCALE, profile, &settings)?;
        self.apply_levels(&mut settings, &luma_histogram(&preview), pixel_count(&preview));

        info!(
            "Estimated basic settings: {:.0}K shadows={} blacks={:.3} white={:.3}",
            settings.temperature, settings.shadows, settings.blacks, settings.white_point
        );
        Ok(settings)
    }

    /// Basic settings plus exposure compensation, scene luminance and a fast noise estimate.
    #[instrument(skip_all, fields(frame = %frame.id))]
    pub fn estimate_settings(&self, frame: &RawFrame, profile: &CameraProfile) -> Result<PostProcessSettings> {
        let mut settings = self.initial_settings(frame, profile)?;
        settings.exposure = self.estimate_exposure_compensation(frame, profile)?;
        settings.shadows = self.estimate_shadows(frame, profile, &settings)?;

        let preview = self.renderer.create_preview(frame, FULL_PREVIEW_DOWNSCALE, profile, &settings)?;
        self.apply_levels(&mut settings, &luma_histogram(&preview), pixel_count(&preview));

        settings.scene_luminance = scene_luminance(&imageops::grayscale(&preview));
        settings.noise_sigma = fast_noise_sigma(frame, profile)?;

        info!(
            "Estimated settings: {:.0}K exposure={:.2} shadows={} blacks={:.3} white={:.3} luminance={:.3} noise={:.2}",
            settings.temperature,
            settings.exposure,
            settings.shadows,
            settings.blacks,
            settings.white_point,
            settings.scene_luminance,
            settings.noise_sigma
        );
        Ok(settings)
    }

    /// Raises shadows in steps until mean preview luma stops growing, then backs off one step.
    pub fn estimate_shadows(&self, frame: &RawFrame, profile: &CameraProfile, settings: &PostProcessSettings) -> Result<f32> {
        let mut settings = settings.clone();
        let mut previous_luma = 1e-5f32;

        for shadows in (SHADOWS_START..SHADOWS_CEILING).step_by(SHADOWS_STEP as usize) {
            settings.shadows = shadows as f32;

            let preview = self.renderer.create_preview(frame, BASIC_PREVIEW_DOWNSCALE, profile, &settings)?;
            let luma = mean_luma(&imageops::grayscale(&preview));
            debug!("Shadows {}: mean luma {:.3}", shadows, luma);

            if luma / previous_luma < SHADOWS_MIN_GAIN {
                break;
            }
            previous_luma = luma;
        }

        Ok((settings.shadows - SHADOWS_STEP as f32).max(SHADOWS_START as f32))
    }

    /// Stops of headroom above the brightest meaningful RAW content.
    pub fn estimate_exposure_compensation(&self, frame: &RawFrame, profile: &CameraProfile) -> Result<f32> {
        let histogram = self.measure.measure_histogram(frame, profile, 1)?;
        let max_pixels = (CLIPPED_FRACTION * (frame.width * frame.height) as f64 / 4.0) as u64;

        let bin = histogram
            .iter()
            .map(|channel| {
                let mut sum = 0u64;
                channel
                    .iter()
                    .enumerate()
                    .rev()
                    .find(|&(_, &count)| {
                        sum += count as u64;
                        sum > max_pixels
                    })
                    .map_or(0, |(x, _)| x)
            })
            .max()
            .unwrap_or(0);

        let bins = histogram.first().map_or(0, Vec::len).max(1);
        Ok((bins as f32 / (bin + 1) as f32).log2())
    }

    fn initial_settings(&self, frame: &RawFrame, profile: &CameraProfile) -> Result<PostProcessSettings> {
        let temperature = self.color.temperature_from_vector(profile, frame.metadata.as_shot)?;
        Ok(PostProcessSettings {
            temperature: temperature.kelvin,
            tint: temperature.tint,
            flipped: frame.metadata.flipped,
            ..PostProcessSettings::default()
        })
    }

    fn apply_levels(&self, settings: &mut PostProcessSettings, histogram: &[u32], total: usize) {
        settings.blacks = black_point(histogram, total, &self.thresholds);
        settings.white_point = white_point(histogram, total, &self.thresholds);
    }
}

fn pixel_count(image: &RgbImage) -> usize {
    image.width() as usize * image.height() as usize
}

/// Luma histogram of an 8-bit preview with [`LUMA_BINS`] bins over `[0, 256)`.
pub fn luma_histogram(preview: &RgbImage) -> Vec<u32> {
    let mut histogram = vec![0u32; LUMA_BINS];
    for pixel in imageops::grayscale(preview).pixels() {
        let bin = pixel.0[0] as usize * LUMA_BINS / 256;
        histogram[bin] += 1;
    }
    histogram
}

/// Lowest bin below which at most `black_fraction` of the pixels fall, capped at `black_max_bin`.
pub fn black_point(histogram: &[u32], total: usize, thresholds: &HistogramThresholds) -> f32 {
    let allow = (thresholds.black_fraction * total as f32) as u64;
    let max_bin = thresholds.black_max_bin.min(histogram.len());

    let mut pixels = 0u64;
    let mut end_bin = 0;
    while end_bin < max_bin {
        let count = histogram[end_bin] as u64;
        if count + pixels > allow {
            break;
        }
        pixels += count;
        end_bin += 1;
    }

    (end_bin as f32 / 255.0).max(0.02)
}

/// Highest bin above which at most `white_fraction` of the pixels fall, no lower than `white_min_bin`.
pub fn white_point(histogram: &[u32], total: usize, thresholds: &HistogramThresholds) -> f32 {
    let allow = (thresholds.white_fraction * total as f32) as u64;
    let Some(top) = histogram.len().checked_sub(1) else {
        return 1.0;
    };
    let min_bin = thresholds.white_min_bin.min(top);

    let mut pixels = 0u64;
    let mut end_bin = top;
    while end_bin > min_bin {
        let count = histogram[end_bin] as u64;
        if count + pixels > allow {
            break;
        }
        pixels += count;
        end_bin -= 1;
    }

    end_bin as f32 / 255.0
}

fn mean_luma(gray: &GrayImage) -> f32 {
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    (sum as f64 / count as f64) as f32
}

/// Log-average luminance of a preview, in `[0, 1]`.
pub fn scene_luminance(gray: &GrayImage) -> f32 {
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let log_sum: f64 = gray.pixels().map(|p| (p.0[0] as f64 / 255.0 + 0.001).ln()).sum();
    (log_sum / count as f64).exp() as f32
}

/// Closed-form noise estimate of the first Bayer plane from a 3x3 Laplacian response.
pub fn fast_noise_sigma(frame: &RawFrame, profile: &CameraProfile) -> Result<f32> {
    let half = deinterleave(frame, profile, false)?;
    let (width, height) = (half.width, half.height);
    if width < 3 || height < 3 {
        return Ok(0.0);
    }

    let plane = half.channel(0);
    let at = |x: usize, y: usize| plane[y * width + x] as f64;

    let total: f64 = (1..height - 1)
        .into_par_iter()
        .map(|y| {
            (1..width - 1)
                .map(|x| {
                    let response = at(x - 1, y - 1) - 2.0 * at(x, y - 1) + at(x + 1, y - 1)
                        - 2.0 * at(x - 1, y)
                        + 4.0 * at(x, y)
                        - 2.0 * at(x + 1, y)
                        + at(x - 1, y + 1)
                        - 2.0 * at(x, y + 1)
                        + at(x + 1, y + 1);
                    response.abs()
                })
                .sum::<f64>()
        })
        .sum();

    let scale = (0.5 * std::f64::consts::PI).sqrt() / (6.0 * (width - 2) as f64 * (height - 2) as f64);
    Ok((scale * total) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst_pipeline::common::error::FusionError;
    use crate::burst_pipeline::measure::{CpuImageMeasure, HISTOGRAM_BINS, RgbHistogram};
    use crate::burst_pipeline::raw::types::RawMetadata;
    use crate::burst_pipeline::tonemap::color::DngColorScience;
    use crate::burst_pipeline::tonemap::preview::CpuPreviewRenderer;
    use image::Rgb;
    use parking_lot::Mutex;

    /// Renders a flat preview whose level is a function of the shadows setting.
    struct ScriptedRenderer {
        response: fn(f32) -> u8,
        calls: Mutex<Vec<f32>>,
    }

    impl ScriptedRenderer {
        fn new(response: fn(f32) -> u8) -> Self {
            Self {
                response,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl PreviewRenderer for ScriptedRenderer {
        fn create_preview(
            &self,
            _frame: &RawFrame,
            _downscale: u32,
            _profile: &CameraProfile,
            settings: &PostProcessSettings,
        ) -> Result<RgbImage> {
            self.calls.lock().push(settings.shadows);
            let level = (self.response)(settings.shadows);
            Ok(RgbImage::from_pixel(8, 8, Rgb([level, level, level])))
        }
    }

    struct FixedHistogram(RgbHistogram);

    impl ImageMeasure for FixedHistogram {
        fn measure_histogram(&self, _frame: &RawFrame, _profile: &CameraProfile, _downscale: usize) -> Result<RgbHistogram> {
            Ok(self.0.clone())
        }

        fn measure_sharpness(&self, _frame: &RawFrame) -> Result<f32> {
            Ok(0.0)
        }
    }

    fn frame() -> RawFrame {
        let values: Vec<u16> = (0..64 * 64).map(|i| 64 + (i * 7 % 900) as u16).collect();
        RawFrame::from_u16("ref", 64, 64, &values, RawMetadata::default())
    }

    fn shadows_with(response: fn(f32) -> u8) -> (f32, usize) {
        let renderer = ScriptedRenderer::new(response);
        let estimator = AutoSettingsEstimator::new(
            &renderer,
            &CpuImageMeasure,
            &DngColorScience,
            HistogramThresholds::default(),
        );
        let shadows = estimator
            .estimate_shadows(&frame(), &CameraProfile::default(), &PostProcessSettings::default())
            .unwrap();
        let calls = renderer.calls.lock().len();
        (shadows, calls)
    }

    #[test]
    fn test_shadows_converge_within_bounds() {
        let responses: [fn(f32) -> u8; 5] = [
            |_| 0,
            |_| 100,
            |s| (s * 10.0) as u8,
            |s| (s * 30.0).min(255.0) as u8,
            |s| (40.0 * s.ln()).min(255.0) as u8,
        ];

        for response in responses {
            let (shadows, calls) = shadows_with(response);
            assert!((2.0..=14.0).contains(&shadows), "shadows {}", shadows);
            assert!(calls <= 7, "{} iterations", calls);
        }
    }

    #[test]
    fn test_shadows_back_off_one_step() {
        // Flat response stops at the second step
        assert_eq!(shadows_with(|_| 100), (2.0, 2));
        // Steady growth never stops: the last step was 14
        assert_eq!(shadows_with(|s| (s * 10.0) as u8), (12.0, 7));
        // Saturates at 255 from shadows 10 on
        assert_eq!(shadows_with(|s| (s * 25.5).min(255.0) as u8).0, 10.0);
    }

    #[test]
    fn test_black_point_stops_before_threshold() {
        let mut histogram = vec![0u32; LUMA_BINS];
        histogram[..6].fill(10);
        histogram[6] = 20;
        histogram[100] = 920;

        // 7% of 1000 pixels allows bins 0 to 5, bin 6 would push the count to 80
        let blacks = black_point(&histogram, 1000, &HistogramThresholds::default());
        assert_eq!(blacks, 6.0 / 255.0);
    }

    #[test]
    fn test_black_point_floor_and_cap() {
        let mut dark = vec![0u32; LUMA_BINS];
        dark[0] = 100;
        assert_eq!(black_point(&dark, 100, &HistogramThresholds::default()), 0.02);

        let mut bright = vec![0u32; LUMA_BINS];
        bright[200] = 100;
        assert_eq!(black_point(&bright, 100, &HistogramThresholds::default()), 8.0 / 255.0);
    }

    #[test]
    fn test_white_point_search() {
        let mut histogram = vec![0u32; LUMA_BINS];
        histogram[254] = 1;
        histogram[230] = 5;
        histogram[50] = 994;

        // 0.5% of 1000 pixels allows 5: bin 254 fits, bin 230 would push it to 6
        let white = white_point(&histogram, 1000, &HistogramThresholds::default());
        assert_eq!(white, 230.0 / 255.0);
    }

    #[test]
    fn test_white_point_stops_at_min_bin() {
        let mut histogram = vec![0u32; LUMA_BINS];
        histogram[10] = 1000;
        assert_eq!(white_point(&histogram, 1000, &HistogramThresholds::default()), 192.0 / 255.0);
    }

    #[test]
    fn test_levels_monotonic_in_thresholds() {
        let histogram: Vec<u32> = (0..LUMA_BINS as u32).map(|i| (i * 37 + 11) % 23 + 1).collect();
        let total = histogram.iter().sum::<u32>() as usize;

        let mut previous = (0.0f32, f32::MAX);
        for step in 0..=20 {
            let fraction = step as f32 * 0.01;
            let thresholds = HistogramThresholds {
                black_fraction: fraction,
                white_fraction: fraction,
                ..HistogramThresholds::default()
            };
            let blacks = black_point(&histogram, total, &thresholds);
            let white = white_point(&histogram, total, &thresholds);

            assert!(blacks >= previous.0, "blacks decreased at {}", fraction);
            assert!(white <= previous.1, "white increased at {}", fraction);
            previous = (blacks, white);
        }
    }

    #[test]
    fn test_exposure_compensation_from_highlights() {
        let mut channel = vec![0u32; HISTOGRAM_BINS];
        channel[10] = 1000;
        channel[63] = 50;
        let mut dim = vec![0u32; HISTOGRAM_BINS];
        dim[5] = 1050;

        let measure = FixedHistogram([channel, dim.clone(), dim]);
        let renderer = ScriptedRenderer::new(|_| 0);
        let estimator =
            AutoSettingsEstimator::new(&renderer, &measure, &DngColorScience, HistogramThresholds::default());

        // 64x64 frame: 0.0001 * 4096 / 4 rounds to 0, so the first non-empty bin from the top wins
        let stops = estimator
            .estimate_exposure_compensation(&frame(), &CameraProfile::default())
            .unwrap();
        assert_eq!(stops, 2.0);
    }

    #[test]
    fn test_scene_luminance() {
        let black = GrayImage::from_pixel(4, 4, image::Luma([0]));
        let white = GrayImage::from_pixel(4, 4, image::Luma([255]));
        assert!((scene_luminance(&black) - 0.001).abs() < 1e-6);
        assert!((scene_luminance(&white) - 1.001).abs() < 1e-5);
    }

    #[test]
    fn test_fast_noise_sigma() {
        let flat = RawFrame::from_u16("flat", 32, 32, &[300; 1024], RawMetadata::default());
        assert_eq!(fast_noise_sigma(&flat, &CameraProfile::default()).unwrap(), 0.0);

        let values: Vec<u16> = (0..1024u32).map(|i| 300 + (i.wrapping_mul(2654435761) >> 28) as u16).collect();
        let noisy = RawFrame::from_u16("noisy", 32, 32, &values, RawMetadata::default());
        assert!(fast_noise_sigma(&noisy, &CameraProfile::default()).unwrap() > 0.5);
    }

    #[test]
    fn test_estimate_settings_with_cpu_collaborators() {
        let renderer = CpuPreviewRenderer::new();
        let estimator = AutoSettingsEstimator::new(
            &renderer,
            &CpuImageMeasure,
            &DngColorScience,
            HistogramThresholds::default(),
        );

        let basic = estimator.estimate_basic_settings(&frame(), &CameraProfile::default()).unwrap();
        assert!(basic.temperature > 0.0);
        assert!((2.0..=14.0).contains(&basic.shadows));
        assert!(basic.blacks >= 0.02);
        assert!(basic.white_point <= 1.0 && basic.white_point >= 192.0 / 255.0);
        assert_eq!(basic.exposure, 0.0);

        let full = estimator.estimate(AutoSettingsMode::Full, &frame(), &CameraProfile::default()).unwrap();
        assert!(full.scene_luminance > 0.0 && full.scene_luminance <= 1.001);
        assert!(full.noise_sigma > 0.0);
        assert!(full.exposure >= 0.0);
    }

    #[test]
    fn test_zero_white_balance_is_fatal() {
        let metadata = RawMetadata {
            as_shot: [0.0; 3],
            ..RawMetadata::default()
        };
        let frame = RawFrame::from_u16("zero", 64, 64, &[100; 4096], metadata);
        let renderer = CpuPreviewRenderer::new();
        let estimator = AutoSettingsEstimator::new(
            &renderer,
            &CpuImageMeasure,
            &DngColorScience,
            HistogramThresholds::default(),
        );
        assert!(matches!(
            estimator.estimate_settings(&frame, &CameraProfile::default()),
            Err(FusionError::ZeroWhiteBalance)
        ));
    }
}
