use crate::burst_pipeline::motion::types::MotionField;

/// Downscale applied to the field before measuring it.
const STATISTIC_DOWNSCALE: usize = 4;

/// Standard deviation of the flow magnitude over the field downscaled by four.
///
/// Fields smaller than the downscale are measured as they are. An empty field has no motion.
pub fn motion_std_dev(field: &MotionField) -> f32 {
    let width = field.width / STATISTIC_DOWNSCALE;
    let height = field.height / STATISTIC_DOWNSCALE;

    let small;
    let measured = if width > 0 && height > 0 {
        small = field.resized(width, height);
        &small
    } else {
        field
    };

    let count = measured.data.len();
    if count == 0 {
        return 0.0;
    }

    let (sum, sum_sq) = measured
        .magnitudes()
        .fold((0.0f64, 0.0f64), |(s, sq), m| (s + m as f64, sq + (m as f64) * (m as f64)));

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    variance.sqrt() as f32
}
