//! Exposure-driven denoise strength and merge frame count.

/// Aperture term of the exposure value, f/1.8 squared.
const APERTURE_SQ: f64 = 1.8 * 1.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseSettings {
    pub spatial_weight: f32,
    pub chroma_eps: f32,
    /// Frames worth fusing, reference included
    pub merge_images: usize,
}

impl DenoiseSettings {
    pub fn new(iso: u32, exposure_time_ns: i64, shadows: f32) -> Self {
        let ev = exposure_value(iso, exposure_time_ns);

        let (spatial_weight, chroma_eps, mut merge_images) = if ev > 9.99 {
            (0.0, 2.0, 2)
        } else if ev > 7.99 {
            (1.0, 4.0, 4)
        } else if ev > 5.99 {
            (1.0, 8.0, 6)
        } else if ev > 3.99 {
            (1.0, 16.0, 8)
        } else if ev > 1.99 {
            (1.0, 32.0, 12)
        } else {
            (3.0, 32.0, 12)
        };

        // Lifted shadows show more noise
        if shadows >= 3.99 {
            merge_images += 2;
        }
        if shadows >= 7.99 {
            merge_images += 2;
        }

        Self {
            spatial_weight,
            chroma_eps,
            merge_images,
        }
    }
}

/// Scene exposure value at ISO 100 for a fixed f/1.8 aperture.
pub fn exposure_value(iso: u32, exposure_time_ns: i64) -> f64 {
    let seconds = exposure_time_ns as f64 / 1.0e9;
    (APERTURE_SQ / seconds).log2() - (iso as f64 / 100.0).log2()
}
