//! CPU wavelet kernels.
//!
//! Orthonormal Haar decomposition. In every subband plane 0 holds coefficients and plane 1 the
//! accumulated blend weight: a forward transform sets weights to one, fusion keeps plane 0 as the
//! weighted running average and adds each candidate's weight to plane 1.

use rayon::prelude::*;
use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::motion::types::MotionField;
use crate::burst_pipeline::raw::deinterleave::HalfResRaw;
use crate::burst_pipeline::raw::types::BAYER_CHANNELS;
use crate::burst_pipeline::wavelet::kernels::{FuseRequest, InverseParams, WaveletKernels};
use crate::burst_pipeline::wavelet::types::{Subband, WaveletPyramid};

/// Blend weight that counts a matching candidate the same as the reference.
const UNIT_BLEND_WEIGHT: f32 = 8.0;

pub struct CpuWaveletKernels;

impl WaveletKernels for CpuWaveletKernels {
    fn forward_transform(&self, raw: &HalfResRaw, channel: usize) -> Result<WaveletPyramid> {
        check_channel(channel)?;
        let plane: Vec<f32> = raw.channel(channel).iter().map(|&v| v as f32).collect();
        decompose(plane, raw.width, raw.height)
    }

    fn fuse(&self, request: &FuseRequest<'_>, output: &mut WaveletPyramid) -> Result<()> {
        check_channel(request.channel)?;

        let candidate = request.candidate;
        let (width, height) = (candidate.width, candidate.height);

        if request.reference.plane_size() != (width, height) {
            return Err(FusionError::DimensionMismatch {
                expected: request.reference.plane_size(),
                got: (width, height),
            });
        }
        if (request.flow.width, request.flow.height) != (width, height) {
            return Err(FusionError::DimensionMismatch {
                expected: (width, height),
                got: (request.flow.width, request.flow.height),
            });
        }
        if !output.same_shape(request.reference) {
            if !request.reset_output {
                return Err(FusionError::DimensionMismatch {
                    expected: request.reference.plane_size(),
                    got: output.plane_size(),
                });
            }
            *output = WaveletPyramid::new(width, height)?;
        }

        let warped = warp(candidate, request.channel, request.flow);
        let candidate_pyramid = decompose(warped, width, height)?;

        let params = request.params;
        let reset_output = request.reset_output;
        let tolerance = params.difference_weight * params.noise_sigma;
        let tolerance_sq = tolerance * tolerance;
        let scale = params.blend_weight / UNIT_BLEND_WEIGHT;

        for ((out_level, ref_level), cand_level) in output
            .levels
            .iter_mut()
            .zip(&request.reference.levels)
            .zip(&candidate_pyramid.levels)
        {
            for subband in [Subband::LowLow, Subband::LowHigh, Subband::HighLow, Subband::HighHigh] {
                let reference = ref_level.plane(subband, 0);
                let candidate = cand_level.plane(subband, 0);
                let (fused, weights) = out_level.planes_mut(subband);

                fused
                    .par_iter_mut()
                    .zip(weights.par_iter_mut())
                    .zip(reference.par_iter().zip(candidate.par_iter()))
                    .for_each(|((fused, total), (&r, &c))| {
                        let d = c - r;
                        let w = if tolerance_sq > 0.0 {
                            scale * tolerance_sq / (tolerance_sq + d * d)
                        } else if d == 0.0 {
                            scale
                        } else {
                            0.0
                        };

                        if reset_output {
                            *fused = (r + w * c) / (1.0 + w);
                            *total = 1.0 + w;
                        } else {
                            let sum = *total + w;
                            *fused = (*fused * *total + w * c) / sum;
                            *total = sum;
                        }
                    });
            }
        }

        Ok(())
    }

    fn inverse_transform(&self, pyramid: &WaveletPyramid, params: &InverseParams) -> Result<Vec<u16>> {
        let coarsest = pyramid
            .levels
            .last()
            .ok_or(FusionError::InvalidDimensions(0, 0))?;

        let frame_count = params.frame_count.max(1) as f32;
        let threshold = params.noise_sigma * params.denoise_aggressiveness;
        let denoised_levels = if params.preview_mode { 1 } else { pyramid.levels.len() };

        debug!(
            threshold,
            frame_count = params.frame_count,
            "Inverse transform"
        );

        let mut current = coarsest.plane(Subband::LowLow, 0).to_vec();

        for (index, level) in pyramid.levels.iter().enumerate().rev() {
            let (w, h) = (level.width, level.height);
            let details: Vec<Vec<f32>> = Subband::DETAIL
                .iter()
                .map(|&subband| {
                    let coefficients = level.plane(subband, 0);
                    if index >= denoised_levels || threshold <= 0.0 {
                        return coefficients.to_vec();
                    }

                    // Coefficients that merged fewer frames keep more noise
                    let weights = level.plane(subband, 1);
                    coefficients
                        .par_iter()
                        .zip(weights.par_iter())
                        .map(|(&x, &weight)| {
                            let t = threshold * (frame_count / weight.clamp(1.0, frame_count)).sqrt();
                            x.signum() * (x.abs() - t).max(0.0)
                        })
                        .collect()
                })
                .collect();

            let mut next = vec![0.0f32; w * h * 4];
            next.par_chunks_mut(w * 4).enumerate().for_each(|(y, rows)| {
                let (top, bottom) = rows.split_at_mut(w * 2);
                for x in 0..w {
                    let i = y * w + x;
                    let ll = current[i];
                    let (lh, hl, hh) = (details[0][i], details[1][i], details[2][i]);
                    top[2 * x] = (ll + lh + hl + hh) * 0.5;
                    top[2 * x + 1] = (ll + lh - hl - hh) * 0.5;
                    bottom[2 * x] = (ll - lh + hl - hh) * 0.5;
                    bottom[2 * x + 1] = (ll - lh - hl + hh) * 0.5;
                }
            });
            current = next;
        }

        let black = params.black_level as f32;
        let range = (params.white_level as f32 - black).max(1.0);
        let expanded = params.expanded_range as f32;

        Ok(current
            .par_iter()
            .map(|&v| ((v - black) / range * expanded).round().clamp(0.0, expanded) as u16)
            .collect())
    }
}

fn check_channel(channel: usize) -> Result<()> {
    if channel >= BAYER_CHANNELS {
        return Err(FusionError::InvalidFrameData(format!(
            "channel {} out of range",
            channel
        )));
    }
    Ok(())
}

/// Candidate channel resampled onto the reference grid.
fn warp(candidate: &HalfResRaw, channel: usize, flow: &MotionField) -> Vec<f32> {
    let (width, height) = (candidate.width, candidate.height);
    let plane = candidate.channel(channel);
    let at = |x: usize, y: usize| plane[y * width + x] as f32;

    let mut out = vec![0.0f32; width * height];
    out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
        for (x, value) in row.iter_mut().enumerate() {
            let [dx, dy] = flow.at(x, y);
            let sx = (x as f32 + dx).clamp(0.0, (width - 1) as f32);
            let sy = (y as f32 + dy).clamp(0.0, (height - 1) as f32);
            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(width - 1);
            let y1 = (y0 + 1).min(height - 1);
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
            let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
            *value = top * (1.0 - fy) + bottom * fy;
        }
    });
    out
}

fn decompose(plane: Vec<f32>, width: usize, height: usize) -> Result<WaveletPyramid> {
    let mut pyramid = WaveletPyramid::new(width, height)?;
    let mut current = plane;
    let mut current_width = width;

    for level in pyramid.levels.iter_mut() {
        let (w, h) = (level.width, level.height);
        let mut bands = [
            vec![0.0f32; w * h],
            vec![0.0f32; w * h],
            vec![0.0f32; w * h],
            vec![0.0f32; w * h],
        ];

        {
            let [ll, lh, hl, hh] = &mut bands;
            ll.par_chunks_mut(w)
                .zip(lh.par_chunks_mut(w))
                .zip(hl.par_chunks_mut(w).zip(hh.par_chunks_mut(w)))
                .enumerate()
                .for_each(|(y, ((ll, lh), (hl, hh)))| {
                    let top = &current[(2 * y) * current_width..];
                    let bottom = &current[(2 * y + 1) * current_width..];
                    for x in 0..w {
                        let (a, b) = (top[2 * x], top[2 * x + 1]);
                        let (c, d) = (bottom[2 * x], bottom[2 * x + 1]);
                        ll[x] = (a + b + c + d) * 0.5;
                        lh[x] = (a + b - c - d) * 0.5;
                        hl[x] = (a - b + c - d) * 0.5;
                        hh[x] = (a - b - c + d) * 0.5;
                    }
                });
        }

        for (subband, band) in [Subband::LowLow, Subband::LowHigh, Subband::HighLow, Subband::HighHigh]
            .into_iter()
            .zip(&bands)
        {
            let (coefficients, weights) = level.planes_mut(subband);
            coefficients.copy_from_slice(band);
            weights.fill(1.0);
        }

        let [ll, ..] = bands;
        current = ll;
        current_width = w;
    }

    Ok(pyramid)
}
