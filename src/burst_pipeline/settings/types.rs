//! Post-processing settings and burst configuration types

use serde::{Deserialize, Serialize};

use crate::burst_pipeline::motion::FlowParams;
use crate::burst_pipeline::output::TiffCompression;

/// Parameters of the tone-mapping stage.
///
/// Either supplied by the caller (for example embedded in a burst manifest) or produced by
/// the auto-settings estimator. Temperature and tint `<= 0` mean "use the as-shot white balance".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessSettings {
    pub temperature: f32,
    pub tint: f32,
    pub gamma: f32,
    /// Exposure compensation in stops
    pub exposure: f32,
    pub shadows: f32,
    pub tonemap_variance: f32,
    pub blacks: f32,
    pub white_point: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub blue_saturation: f32,
    pub green_saturation: f32,
    pub sharpen0: f32,
    pub sharpen1: f32,
    pub chroma_eps: f32,
    pub spatial_denoise_aggressiveness: f32,
    pub scene_luminance: f32,
    pub noise_sigma: f32,
    pub jpeg_quality: u8,
    pub flipped: bool,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            temperature: -1.0,
            tint: -1.0,
            gamma: 2.2,
            exposure: 0.0,
            shadows: 1.0,
            tonemap_variance: 0.25,
            blacks: 0.0,
            white_point: 1.0,
            contrast: 0.5,
            saturation: 1.0,
            blue_saturation: 1.0,
            green_saturation: 1.0,
            sharpen0: 0.0,
            sharpen1: 0.0,
            chroma_eps: 8.0,
            spatial_denoise_aggressiveness: 1.0,
            scene_luminance: 0.0,
            noise_sigma: 0.0,
            jpeg_quality: 95,
            flipped: false,
        }
    }
}

impl PostProcessSettings {
    /// Whether an explicit white balance overrides the as-shot vector.
    pub fn has_explicit_white_balance(&self) -> bool {
        self.temperature > 0.0 || self.tint > 0.0
    }
}

/// Pixel-count limits of the black and white point search over the preview luma histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramThresholds {
    /// Fraction of pixels allowed below the black point
    pub black_fraction: f32,
    /// Exclusive upper bound of the black point bin
    pub black_max_bin: usize,
    /// Fraction of pixels allowed above the white point
    pub white_fraction: f32,
    /// Lowest bin the white point search may reach
    pub white_min_bin: usize,
}

impl Default for HistogramThresholds {
    fn default() -> Self {
        Self {
            black_fraction: 0.07,
            black_max_bin: 8,
            white_fraction: 0.005,
            white_min_bin: 192,
        }
    }
}

/// Which estimator derives settings when the container supplies none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoSettingsMode {
    /// White balance, shadows, black and white point
    Basic,
    /// Basic plus exposure compensation, scene luminance and noise sigma
    #[default]
    Full,
}

/// Configuration for a burst run
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Whether to validate frame layout before fusion
    pub validate_dimensions: bool,
    /// Dense flow estimator tuning
    pub flow: FlowParams,
    /// Black/white point search limits
    pub thresholds: HistogramThresholds,
    /// Auto-settings estimator used when no settings are supplied
    pub auto_settings: AutoSettingsMode,
    /// Cap the fused frame count at what the exposure-derived denoise settings ask for
    pub limit_merge_frames: bool,
    /// Compression of the merged Bayer TIFF, when one is requested
    pub raw_compression: TiffCompression,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            validate_dimensions: true,
            flow: FlowParams::default(),
            thresholds: HistogramThresholds::default(),
            auto_settings: AutoSettingsMode::Full,
            limit_merge_frames: false,
            raw_compression: TiffCompression::None,
        }
    }
}

impl FusionConfig {
    pub fn builder() -> FusionConfigBuilder {
        FusionConfigBuilder::default()
    }
}

/// Builder for FusionConfig
#[derive(Default)]
pub struct FusionConfigBuilder {
    validate_dimensions: Option<bool>,
    flow: Option<FlowParams>,
    thresholds: Option<HistogramThresholds>,
    auto_settings: Option<AutoSettingsMode>,
    limit_merge_frames: Option<bool>,
    raw_compression: Option<TiffCompression>,
}

impl FusionConfigBuilder {
    pub fn validate_dimensions(mut self, validate: bool) -> Self {
        self.validate_dimensions = Some(validate);
        self
    }

    pub fn flow(mut self, flow: FlowParams) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn thresholds(mut self, thresholds: HistogramThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    pub fn auto_settings(mut self, mode: AutoSettingsMode) -> Self {
        self.auto_settings = Some(mode);
        self
    }

    pub fn limit_merge_frames(mut self, enable: bool) -> Self {
        self.limit_merge_frames = Some(enable);
        self
    }

    pub fn raw_compression(mut self, compression: TiffCompression) -> Self {
        self.raw_compression = Some(compression);
        self
    }

    pub fn build(self) -> FusionConfig {
        let default = FusionConfig::default();
        FusionConfig {
            validate_dimensions: self.validate_dimensions.unwrap_or(default.validate_dimensions),
            flow: self.flow.unwrap_or(default.flow),
            thresholds: self.thresholds.unwrap_or(default.thresholds),
            auto_settings: self.auto_settings.unwrap_or(default.auto_settings),
            limit_merge_frames: self.limit_merge_frames.unwrap_or(default.limit_merge_frames),
            raw_compression: self.raw_compression.unwrap_or(default.raw_compression),
        }
    }
}
