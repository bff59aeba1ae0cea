//! Per-pixel tone operations shared by the preview renderer and the tone mapper.

use crate::burst_pipeline::settings::PostProcessSettings;
use crate::burst_pipeline::tonemap::color::ColorTransform;

const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

#[inline]
pub fn luma(rgb: [f32; 3]) -> f32 {
    LUMA[0] * rgb[0] + LUMA[1] * rgb[1] + LUMA[2] * rgb[2]
}

#[inline]
fn smoothstep(v: f32) -> f32 {
    v * v * (3.0 - 2.0 * v)
}

/// Tone curve built from one set of post-processing settings.
///
/// Input is camera RGB normalised to `[0, 1]` above black; output is gamma-encoded sRGB in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct ToneCurve {
    transform: ColorTransform,
    exposure_gain: f32,
    shadows: f32,
    variance: f32,
    blacks: f32,
    white_point: f32,
    contrast: f32,
    saturation: f32,
    blue_saturation: f32,
    green_saturation: f32,
    inv_gamma: f32,
}

impl ToneCurve {
    pub fn new(settings: &PostProcessSettings, transform: ColorTransform) -> Self {
        Self {
            transform,
            exposure_gain: 2f32.powf(settings.exposure),
            shadows: settings.shadows.max(1.0),
            variance: settings.tonemap_variance.max(1e-4),
            blacks: settings.blacks.clamp(0.0, 0.99),
            white_point: settings.white_point.clamp(0.01, 1.0),
            contrast: settings.contrast.clamp(0.0, 1.0),
            saturation: settings.saturation,
            blue_saturation: settings.blue_saturation,
            green_saturation: settings.green_saturation,
            inv_gamma: 1.0 / settings.gamma.max(0.1),
        }
    }

    /// Linear sRGB after exposure, colour conversion and shadow lift.
    #[inline]
    pub fn linear(&self, camera: [f32; 3]) -> [f32; 3] {
        let exposed = camera.map(|v| v * self.exposure_gain);
        let rgb = self.transform.apply(exposed).map(|v| v.max(0.0));

        let l = luma(rgb);
        if l <= 0.0 {
            return rgb;
        }

        // Lift follows a global curve and fades out for bright pixels
        let s = self.shadows;
        let lifted = s * l / (1.0 + (s - 1.0) * l);
        let falloff = (-(l * l) / (2.0 * self.variance)).exp();
        let target = l + (lifted - l) * falloff;

        let gain = target / l;
        rgb.map(|v| v * gain)
    }

    /// Full curve, gamma-encoded.
    #[inline]
    pub fn apply(&self, camera: [f32; 3]) -> [f32; 3] {
        let range = (self.white_point - self.blacks).max(1e-3);
        let rgb = self
            .linear(camera)
            .map(|v| ((v - self.blacks) / range).clamp(0.0, 1.0))
            .map(|v| v + (smoothstep(v) - v) * self.contrast);

        let saturation = self.saturation
            * if rgb[2] > rgb[0] && rgb[2] > rgb[1] {
                self.blue_saturation
            } else if rgb[1] > rgb[0] && rgb[1] > rgb[2] {
                self.green_saturation
            } else {
                1.0
            };

        let l = luma(rgb);
        rgb.map(|v| (l + (v - l) * saturation).clamp(0.0, 1.0).powf(self.inv_gamma))
    }

    #[inline]
    pub fn apply_u8(&self, camera: [f32; 3]) -> [u8; 3] {
        to_u8(self.apply(camera))
    }
}

#[inline]
pub fn to_u8(rgb: [f32; 3]) -> [u8; 3] {
    rgb.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
}
