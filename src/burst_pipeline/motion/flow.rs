//! Dense optical flow between two previews.
//!
//! [`PatchFlowEstimator`] is a coarse-to-fine patch search in the style of dense inverse search:
//! per-patch Lucas-Kanade gradient descent, left-to-right spatial propagation, densification by
//! photometric-error weighting and a few smoothing passes over the dense field.

use rayon::prelude::*;
use tracing::trace;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::motion::types::{GrayPreview, MotionField};

/// Tuning of the flow estimator. Defaults favour speed over precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowParams {
    pub patch_size: usize,
    pub patch_stride: usize,
    pub gradient_descent_iterations: usize,
    /// Smoothing passes over the dense field at each scale
    pub refinement_iterations: usize,
    pub spatial_propagation: bool,
    /// Finest pyramid scale searched; the result is upsampled from there
    pub finest_scale: usize,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            patch_size: 16,
            patch_stride: 8,
            gradient_descent_iterations: 16,
            refinement_iterations: 5,
            spatial_propagation: true,
            finest_scale: 2,
        }
    }
}

pub trait FlowEstimator {
    /// Flow from `reference` to `candidate`. Both previews must have the same size.
    fn estimate_flow(&self, reference: &GrayPreview, candidate: &GrayPreview) -> Result<MotionField>;
}

pub struct PatchFlowEstimator {
    params: FlowParams,
}

impl PatchFlowEstimator {
    pub fn new(params: FlowParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &FlowParams {
        &self.params
    }
}

impl Default for PatchFlowEstimator {
    fn default() -> Self {
        Self::new(FlowParams::default())
    }
}

impl FlowEstimator for PatchFlowEstimator {
    fn estimate_flow(&self, reference: &GrayPreview, candidate: &GrayPreview) -> Result<MotionField> {
        if reference.dimensions() != candidate.dimensions() {
            let (rw, rh) = reference.dimensions();
            let (cw, ch) = candidate.dimensions();
            return Err(FusionError::DimensionMismatch {
                expected: (rw as usize, rh as usize),
                got: (cw as usize, ch as usize),
            });
        }

        let width = reference.width() as usize;
        let height = reference.height() as usize;
        let params = &self.params;
        let patch = params.patch_size.max(2);
        let min_dim = width.min(height);

        if min_dim >> params.finest_scale == 0 {
            return Ok(MotionField::zeros(width, height));
        }

        let mut coarsest = params.finest_scale;
        while (min_dim >> (coarsest + 1)) >= 2 * patch {
            coarsest += 1;
        }

        let ref_pyramid = Plane::from_gray(reference).pyramid(coarsest);
        let cand_pyramid = Plane::from_gray(candidate).pyramid(coarsest);

        let mut flow = MotionField::zeros(ref_pyramid[coarsest].width, ref_pyramid[coarsest].height);

        for scale in (params.finest_scale..=coarsest).rev() {
            let (r, c) = (&ref_pyramid[scale], &cand_pyramid[scale]);
            if scale != coarsest {
                flow = flow.resized(r.width, r.height).scaled(2.0);
            }
            flow = self.refine_scale(r, c, flow);
            trace!(scale, width = r.width, height = r.height, "Flow scale done");
        }

        Ok(flow
            .resized(width, height)
            .scaled((1 << params.finest_scale) as f32))
    }
}

impl PatchFlowEstimator {
    fn refine_scale(&self, reference: &Plane, candidate: &Plane, init: MotionField) -> MotionField {
        let patch = self.params.patch_size.max(2);
        let stride = self.params.patch_stride.max(1);
        let (width, height) = (reference.width, reference.height);

        if width < patch || height < patch {
            return init;
        }

        let xs = patch_positions(width, patch, stride);
        let ys = patch_positions(height, patch, stride);

        let patch_flows: Vec<Vec<[f32; 2]>> = ys
            .par_iter()
            .map(|&py| {
                let mut row: Vec<[f32; 2]> = Vec::with_capacity(xs.len());
                for &px in &xs {
                    let centre = init.at(px + patch / 2, py + patch / 2);
                    let mut start = centre;

                    if self.params.spatial_propagation {
                        if let Some(&left) = row.last() {
                            let own = patch_ssd(reference, candidate, px, py, patch, centre);
                            let propagated = patch_ssd(reference, candidate, px, py, patch, left);
                            if propagated < own {
                                start = left;
                            }
                        }
                    }

                    row.push(self.descend(reference, candidate, px, py, patch, start));
                }
                row
            })
            .collect();

        let mut dense = densify(reference, candidate, &xs, &ys, patch, &patch_flows, init);
        for _ in 0..self.params.refinement_iterations {
            dense = smooth(&dense);
        }
        dense
    }

    /// Inverse-compositional Lucas-Kanade on one patch.
    fn descend(
        &self,
        reference: &Plane,
        candidate: &Plane,
        px: usize,
        py: usize,
        patch: usize,
        start: [f32; 2],
    ) -> [f32; 2] {
        let mut gradients = Vec::with_capacity(patch * patch);
        let (mut hxx, mut hxy, mut hyy) = (0.0f32, 0.0f32, 0.0f32);

        for y in py..py + patch {
            for x in px..px + patch {
                let gx = (reference.at(x as isize + 1, y as isize) - reference.at(x as isize - 1, y as isize)) * 0.5;
                let gy = (reference.at(x as isize, y as isize + 1) - reference.at(x as isize, y as isize - 1)) * 0.5;
                hxx += gx * gx;
                hxy += gx * gy;
                hyy += gy * gy;
                gradients.push((gx, gy));
            }
        }

        let det = hxx * hyy - hxy * hxy;
        if det.abs() < 1e-3 {
            return start;
        }

        let mut u = start;
        for _ in 0..self.params.gradient_descent_iterations {
            let (mut bx, mut by) = (0.0f32, 0.0f32);
            let mut i = 0;
            for y in py..py + patch {
                for x in px..px + patch {
                    let error = candidate.sample(x as f32 + u[0], y as f32 + u[1])
                        - reference.at(x as isize, y as isize);
                    let (gx, gy) = gradients[i];
                    bx += gx * error;
                    by += gy * error;
                    i += 1;
                }
            }

            let dx = -(hyy * bx - hxy * by) / det;
            let dy = -(hxx * by - hxy * bx) / det;
            u[0] += dx;
            u[1] += dy;

            if dx * dx + dy * dy < 1e-4 {
                break;
            }
        }
        u
    }
}

fn patch_positions(extent: usize, patch: usize, stride: usize) -> Vec<usize> {
    let last = extent - patch;
    let mut positions: Vec<usize> = (0..=last).step_by(stride).collect();
    if positions.last() != Some(&last) {
        positions.push(last);
    }
    positions
}

fn patch_ssd(reference: &Plane, candidate: &Plane, px: usize, py: usize, patch: usize, u: [f32; 2]) -> f32 {
    let mut ssd = 0.0;
    for y in py..py + patch {
        for x in px..px + patch {
            let d = candidate.sample(x as f32 + u[0], y as f32 + u[1]) - reference.at(x as isize, y as isize);
            ssd += d * d;
        }
    }
    ssd
}

/// Blends overlapping patch flows per pixel, weighting each by its photometric error there.
/// Pixels no patch covers keep `init`.
fn densify(
    reference: &Plane,
    candidate: &Plane,
    xs: &[usize],
    ys: &[usize],
    patch: usize,
    patch_flows: &[Vec<[f32; 2]>],
    init: MotionField,
) -> MotionField {
    let width = reference.width;
    let mut acc = vec![[0.0f32; 2]; width * reference.height];
    let mut weights = vec![0.0f32; width * reference.height];

    for (row, &py) in patch_flows.iter().zip(ys) {
        for (&u, &px) in row.iter().zip(xs) {
            for y in py..py + patch {
                for x in px..px + patch {
                    let error = candidate.sample(x as f32 + u[0], y as f32 + u[1])
                        - reference.at(x as isize, y as isize);
                    let w = 1.0 / error.abs().max(1.0);
                    let i = y * width + x;
                    acc[i][0] += w * u[0];
                    acc[i][1] += w * u[1];
                    weights[i] += w;
                }
            }
        }
    }

    let mut field = init;
    for ((out, sum), w) in field.data.iter_mut().zip(acc).zip(weights) {
        if w > 0.0 {
            *out = [sum[0] / w, sum[1] / w];
        }
    }
    field
}

fn smooth(field: &MotionField) -> MotionField {
    let (width, height) = (field.width, field.height);
    let mut out = MotionField::zeros(width, height);

    out.data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, value) in row.iter_mut().enumerate() {
            let mut sum = [0.0f32; 2];
            let mut count = 0.0f32;
            for ny in y.saturating_sub(1)..(y + 2).min(height) {
                for nx in x.saturating_sub(1)..(x + 2).min(width) {
                    let v = field.at(nx, ny);
                    sum[0] += v[0];
                    sum[1] += v[1];
                    count += 1.0;
                }
            }
            *value = [sum[0] / count, sum[1] / count];
        }
    });
    out
}

/// Float luma plane with clamped addressing.
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &GrayPreview) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Scales `0..=levels`, each a 2x2 box downscale of the previous.
    fn pyramid(self, levels: usize) -> Vec<Plane> {
        let mut pyramid = vec![self];
        while pyramid.len() <= levels {
            let next = match pyramid.last() {
                Some(plane) => plane.downscale(),
                None => break,
            };
            pyramid.push(next);
        }
        pyramid
    }

    fn downscale(&self) -> Plane {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = (2 * x as isize, 2 * y as isize);
                let sum = self.at(sx, sy) + self.at(sx + 1, sy) + self.at(sx, sy + 1) + self.at(sx + 1, sy + 1);
                data.push(sum * 0.25);
            }
        }
        Plane { width, height, data }
    }

    #[inline]
    fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);

        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x0 + 1, y0) * fx;
        let bottom = self.at(x0, y0 + 1) * (1.0 - fx) + self.at(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}
