/// Scale of the median absolute deviation of a unit normal distribution.
const MAD_TO_SIGMA: f32 = 0.6745;

/// Robust noise sigma of a high-frequency subband: `median(|x|) / 0.6745`.
///
/// Non-finite coefficients are skipped. An empty subband has zero noise.
pub fn estimate_noise(subband: &[f32]) -> f32 {
    let mut magnitudes: Vec<f32> = subband
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .collect();

    if magnitudes.is_empty() {
        return 0.0;
    }

    let mid = magnitudes.len() / 2;
    let (_, median, _) = magnitudes.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *median / MAD_TO_SIGMA
}
