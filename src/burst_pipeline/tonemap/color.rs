//! White balance and camera-to-sRGB colour conversion.

use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::types::{CameraProfile, RawMetadata};
use crate::burst_pipeline::settings::PostProcessSettings;

pub type Matrix3 = [[f32; 3]; 3];

/// Standard XYZ to linear sRGB matrix (D65).
pub const XYZ_TO_SRGB: Matrix3 = [
    [3.2404542, -1.5371385, -0.4985314],
    [-0.9692660, 1.8760108, 0.0415560],
    [0.0556434, -0.2040259, 1.0572252],
];

const MIN_KELVIN: f64 = 1667.0;
const MAX_KELVIN: f64 = 25000.0;
/// Tint units per unit of uv distance from the Planckian locus
const TINT_SCALE: f64 = 3000.0;
const WHITE_SEARCH_ITERATIONS: usize = 30;

/// Correlated colour temperature plus offset from the Planckian locus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature {
    pub kelvin: f32,
    pub tint: f32,
}

impl Temperature {
    pub fn new(kelvin: f32, tint: f32) -> Self {
        Self { kelvin, tint }
    }
}

/// Everything the renderers need to turn white-balanced camera RGB into linear sRGB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTransform {
    /// Camera response to the scene white, largest component 1
    pub camera_white: [f32; 3],
    /// Maps camera RGB divided by `camera_white` to linear sRGB; rows sum to 1
    pub camera_to_srgb: Matrix3,
}

impl ColorTransform {
    /// Divides by the scene white and converts to linear sRGB.
    #[inline]
    pub fn apply(&self, camera: [f32; 3]) -> [f32; 3] {
        let balanced = [
            camera[0] / self.camera_white[0],
            camera[1] / self.camera_white[1],
            camera[2] / self.camera_white[2],
        ];
        mat_vec(&self.camera_to_srgb, balanced)
    }
}

/// Colour-science collaborator.
pub trait ColorScience: Send + Sync {
    /// Scene temperature whose white matches the camera neutral `as_shot`.
    fn temperature_from_vector(&self, profile: &CameraProfile, as_shot: [f32; 3]) -> Result<Temperature>;

    fn camera_to_srgb(&self, profile: &CameraProfile, temperature: &Temperature) -> Result<ColorTransform>;
}

/// DNG-style colour science: colour matrices interpolated by inverse temperature between the
/// two calibration illuminants.
#[derive(Debug, Clone, Copy, Default)]
pub struct DngColorScience;

impl DngColorScience {
    pub fn new() -> Self {
        Self
    }

    fn interpolated_matrix(profile: &CameraProfile, kelvin: f64) -> Matrix3 {
        let t1 = profile.illuminant1.temperature() as f64;
        let t2 = profile.illuminant2.temperature() as f64;

        let g = if (t1 - t2).abs() < f64::EPSILON {
            1.0
        } else {
            ((1.0 / kelvin - 1.0 / t2) / (1.0 / t1 - 1.0 / t2)).clamp(0.0, 1.0)
        } as f32;

        std::array::from_fn(|r| {
            std::array::from_fn(|c| g * profile.color_matrix1[r][c] + (1.0 - g) * profile.color_matrix2[r][c])
        })
    }
}

impl ColorScience for DngColorScience {
    fn temperature_from_vector(&self, profile: &CameraProfile, as_shot: [f32; 3]) -> Result<Temperature> {
        let neutral = normalize_as_shot(as_shot)?;

        // Fixed point: the white whose temperature selects a matrix mapping it back to `neutral`
        let mut xy = (0.3457, 0.3585);
        for _ in 0..WHITE_SEARCH_ITERATIONS {
            let kelvin = cct_from_xy(xy);
            let matrix = Self::interpolated_matrix(profile, kelvin);
            let xyz = mat_vec(&invert(&matrix)?, neutral);
            let sum = (xyz[0] + xyz[1] + xyz[2]) as f64;
            if sum.abs() < 1e-9 {
                return Err(FusionError::ZeroWhiteBalance);
            }

            let next = (xyz[0] as f64 / sum, xyz[1] as f64 / sum);
            let delta = (next.0 - xy.0).abs() + (next.1 - xy.1).abs();
            xy = next;
            if delta < 1e-7 {
                break;
            }
        }

        let kelvin = cct_from_xy(xy);
        let tint = tint_from_xy(xy, kelvin);

        debug!("White balance from {:?}: {:.0}K tint {:.1}", as_shot, kelvin, tint);

        Ok(Temperature::new(kelvin as f32, tint as f32))
    }

    fn camera_to_srgb(&self, profile: &CameraProfile, temperature: &Temperature) -> Result<ColorTransform> {
        let kelvin = (temperature.kelvin as f64).clamp(MIN_KELVIN, MAX_KELVIN);
        let (x, y) = xy_from_temperature(kelvin, temperature.tint as f64);
        let white_xyz = [(x / y) as f32, 1.0, ((1.0 - x - y) / y) as f32];

        let xyz_to_camera = Self::interpolated_matrix(profile, kelvin);
        let camera_white = normalize_as_shot(mat_vec(&xyz_to_camera, white_xyz))?;
        let camera_to_xyz = invert(&xyz_to_camera)?;

        let mut camera_to_srgb = mat_mul(&XYZ_TO_SRGB, &camera_to_xyz);
        for row in camera_to_srgb.iter_mut() {
            for (value, white) in row.iter_mut().zip(camera_white) {
                *value *= white;
            }
            let sum: f32 = row.iter().sum();
            if sum.abs() < 1e-6 {
                return Err(FusionError::SingularColorMatrix);
            }
            row.iter_mut().for_each(|value| *value /= sum);
        }

        Ok(ColorTransform {
            camera_white,
            camera_to_srgb,
        })
    }
}

/// Scales the as-shot neutral so its largest component is 1.
pub fn normalize_as_shot(as_shot: [f32; 3]) -> Result<[f32; 3]> {
    let max = as_shot.iter().copied().fold(f32::MIN, f32::max);
    if max <= 0.0 || !max.is_finite() {
        return Err(FusionError::ZeroWhiteBalance);
    }
    Ok(as_shot.map(|v| v / max))
}

/// Explicit temperature/tint from `settings` when set, the frame's as-shot vector otherwise.
pub fn white_balance_transform<C: ColorScience + ?Sized>(
    color: &C,
    profile: &CameraProfile,
    metadata: &RawMetadata,
    settings: &PostProcessSettings,
) -> Result<ColorTransform> {
    let temperature = if settings.has_explicit_white_balance() {
        Temperature::new(settings.temperature, settings.tint)
    } else {
        color.temperature_from_vector(profile, metadata.as_shot)?
    };
    color.camera_to_srgb(profile, &temperature)
}

#[inline]
pub fn mat_vec(m: &Matrix3, v: [f32; 3]) -> [f32; 3] {
    std::array::from_fn(|r| m[r][0] * v[0] + m[r][1] * v[1] + m[r][2] * v[2])
}

pub fn mat_mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    std::array::from_fn(|r| std::array::from_fn(|c| (0..3).map(|k| a[r][k] * b[k][c]).sum()))
}

pub fn invert(m: &Matrix3) -> Result<Matrix3> {
    let m = m.map(|row| row.map(|v| v as f64));
    let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0];

    let det = m[0][0] * cofactor(1, 2, 1, 2) - m[0][1] * cofactor(1, 2, 0, 2) + m[0][2] * cofactor(1, 2, 0, 1);
    if det.abs() < 1e-12 {
        return Err(FusionError::SingularColorMatrix);
    }

    let adjugate = [
        [cofactor(1, 2, 1, 2), -cofactor(0, 2, 1, 2), cofactor(0, 1, 1, 2)],
        [-cofactor(1, 2, 0, 2), cofactor(0, 2, 0, 2), -cofactor(0, 1, 0, 2)],
        [cofactor(1, 2, 0, 1), -cofactor(0, 2, 0, 1), cofactor(0, 1, 0, 1)],
    ];

    Ok(adjugate.map(|row| row.map(|v| (v / det) as f32)))
}

/// Kang et al. cubic approximation of the Planckian locus.
fn planckian_xy(kelvin: f64) -> (f64, f64) {
    let t = kelvin.clamp(MIN_KELVIN, MAX_KELVIN);
    let (t2, t3) = (t * t, t * t * t);

    let x = if t <= 4000.0 {
        -0.2661239e9 / t3 - 0.2343589e6 / t2 + 0.8776956e3 / t + 0.179910
    } else {
        -3.0258469e9 / t3 + 2.1070379e6 / t2 + 0.2226347e3 / t + 0.240390
    };
    let (x2, x3) = (x * x, x * x * x);

    let y = if t <= 2222.0 {
        -1.1063814 * x3 - 1.34811020 * x2 + 2.18555832 * x - 0.20219683
    } else if t <= 4000.0 {
        -0.9549476 * x3 - 1.37418593 * x2 + 2.09137015 * x - 0.16748867
    } else {
        3.0817580 * x3 - 5.87338670 * x2 + 3.75112997 * x - 0.37001483
    };

    (x, y)
}

fn xy_to_uv((x, y): (f64, f64)) -> (f64, f64) {
    let d = -2.0 * x + 12.0 * y + 3.0;
    (4.0 * x / d, 6.0 * y / d)
}

fn uv_to_xy((u, v): (f64, f64)) -> (f64, f64) {
    let d = 2.0 * u - 8.0 * v + 4.0;
    (3.0 * u / d, 2.0 * v / d)
}

/// Unit normal to the locus in uv space at `kelvin`.
fn locus_normal(kelvin: f64) -> (f64, f64) {
    let a = xy_to_uv(planckian_xy(kelvin - 10.0));
    let b = xy_to_uv(planckian_xy(kelvin + 10.0));
    let (du, dv) = (b.0 - a.0, b.1 - a.1);
    let len = (du * du + dv * dv).sqrt().max(1e-12);
    (-dv / len, du / len)
}

fn xy_from_temperature(kelvin: f64, tint: f64) -> (f64, f64) {
    let (u, v) = xy_to_uv(planckian_xy(kelvin));
    let (nu, nv) = locus_normal(kelvin);
    let offset = tint / TINT_SCALE;
    uv_to_xy((u + nu * offset, v + nv * offset))
}

fn tint_from_xy(xy: (f64, f64), kelvin: f64) -> f64 {
    let (u, v) = xy_to_uv(xy);
    let (pu, pv) = xy_to_uv(planckian_xy(kelvin));
    let (nu, nv) = locus_normal(kelvin);
    ((u - pu) * nu + (v - pv) * nv) * TINT_SCALE
}

/// McCamy's approximation.
fn cct_from_xy((x, y): (f64, f64)) -> f64 {
    let n = (x - 0.3320) / (0.1858 - y);
    (449.0 * n.powi(3) + 3525.0 * n.powi(2) + 6823.3 * n + 5520.33).clamp(MIN_KELVIN, MAX_KELVIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_white_balance_rejected() {
        assert!(matches!(normalize_as_shot([0.0, 0.0, 0.0]), Err(FusionError::ZeroWhiteBalance)));
        assert!(matches!(
            DngColorScience.temperature_from_vector(&CameraProfile::default(), [0.0; 3]),
            Err(FusionError::ZeroWhiteBalance)
        ));
    }

    #[test]
    fn test_normalize_by_max() {
        assert_eq!(normalize_as_shot([0.5, 1.0, 0.25]).unwrap(), [0.5, 1.0, 0.25]);
        assert_eq!(normalize_as_shot([1.0, 2.0, 4.0]).unwrap(), [0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_invert_roundtrip() {
        let m = [[2.0, 0.5, 0.0], [0.1, 1.0, 0.3], [0.0, 0.2, 1.5]];
        let product = mat_mul(&m, &invert(&m).unwrap());
        for (r, row) in product.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let m = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]];
        assert!(matches!(invert(&m), Err(FusionError::SingularColorMatrix)));
    }

    #[test]
    fn test_locus_at_6500k() {
        let (x, y) = xy_from_temperature(6504.0, 0.0);
        assert!((x - 0.3135).abs() < 0.002, "x = {}", x);
        assert!((y - 0.3237).abs() < 0.002, "y = {}", y);
        assert!((cct_from_xy((x, y)) - 6504.0).abs() < 100.0);
    }

    #[test]
    fn test_temperature_roundtrip() {
        let profile = CameraProfile::default();
        let color = DngColorScience;
        let target = Temperature::new(4500.0, 5.0);

        let transform = color.camera_to_srgb(&profile, &target).unwrap();
        let estimated = color.temperature_from_vector(&profile, transform.camera_white).unwrap();

        assert!((estimated.kelvin - 4500.0).abs() < 60.0, "{:?}", estimated);
        assert!((estimated.tint - 5.0).abs() < 1.0, "{:?}", estimated);
    }

    #[test]
    fn test_neutral_maps_to_grey() {
        let profile = CameraProfile::default();
        let color = DngColorScience;
        let temperature = color.temperature_from_vector(&profile, [0.6, 1.0, 0.8]).unwrap();
        let transform = color.camera_to_srgb(&profile, &temperature).unwrap();

        let rgb = transform.apply(transform.camera_white.map(|v| v * 0.5));
        for v in rgb {
            assert!((v - 0.5).abs() < 1e-3, "{:?}", rgb);
        }
    }

    #[test]
    fn test_explicit_white_balance_wins() {
        let profile = CameraProfile::default();
        let metadata = RawMetadata {
            as_shot: [0.0; 3],
            ..RawMetadata::default()
        };
        let settings = PostProcessSettings {
            temperature: 5500.0,
            tint: 0.0,
            ..PostProcessSettings::default()
        };

        // The zero as-shot vector is never consulted
        assert!(white_balance_transform(&DngColorScience, &profile, &metadata, &settings).is_ok());
        assert!(matches!(
            white_balance_transform(&DngColorScience, &profile, &metadata, &PostProcessSettings::default()),
            Err(FusionError::ZeroWhiteBalance)
        ));
    }
}
