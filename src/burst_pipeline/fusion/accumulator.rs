//! Online multi-frame accumulation over wavelet pyramids.

use tracing::{debug, info};

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::fusion::weights::{BlendWeights, select_weights};
use crate::burst_pipeline::motion::flow::FlowEstimator;
use crate::burst_pipeline::motion::statistic::motion_std_dev;
use crate::burst_pipeline::motion::types::GrayPreview;
use crate::burst_pipeline::raw::deinterleave::HalfResRaw;
use crate::burst_pipeline::raw::types::{BAYER_CHANNELS, RawMetadata, SensorArrangement};
use crate::burst_pipeline::wavelet::kernels::{FuseRequest, FusionParameters, InverseParams, WaveletKernels};
use crate::burst_pipeline::wavelet::noise::estimate_noise;
use crate::burst_pipeline::wavelet::types::{EXPANDED_RANGE, WaveletPyramid};

/// What one candidate frame contributed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFusion {
    pub motion_std_dev: f32,
    pub weights: BlendWeights,
}

/// Sensor constants and settings the inverse transform needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishParams {
    pub black_level: [u16; BAYER_CHANNELS],
    pub white_level: u16,
    pub denoise_aggressiveness: f32,
}

/// Accumulation state of one fusion run.
///
/// Built from the reference frame, fed candidates in order, then consumed by [`finish`].
/// Only the reference pyramids, the output pyramids and the reference preview are kept;
/// candidates are borrowed for the duration of [`add_frame`].
///
/// [`finish`]: FusionAccumulator::finish
/// [`add_frame`]: FusionAccumulator::add_frame
pub struct FusionAccumulator<'k, K: WaveletKernels + ?Sized> {
    kernels: &'k K,
    reference_pyramids: Vec<WaveletPyramid>,
    output_pyramids: Option<Vec<WaveletPyramid>>,
    reset_output: bool,
    noise_sigma: [f32; BAYER_CHANNELS],
    frame_count: usize,
    reference_preview: GrayPreview,
    reference_metadata: RawMetadata,
    plane_size: (usize, usize),
    valid_size: (usize, usize),
}

impl<'k, K: WaveletKernels + ?Sized> FusionAccumulator<'k, K> {
    /// Transforms every channel of the reference and estimates its noise.
    ///
    /// `on_channel` runs after each channel transform.
    pub fn new(kernels: &'k K, reference: HalfResRaw, mut on_channel: impl FnMut()) -> Result<Self> {
        let mut reference_pyramids = Vec::with_capacity(BAYER_CHANNELS);
        let mut noise_sigma = [0.0f32; BAYER_CHANNELS];

        for (c, sigma) in noise_sigma.iter_mut().enumerate() {
            let pyramid = kernels.forward_transform(&reference, c)?;
            *sigma = estimate_noise(pyramid.finest_high_high());
            reference_pyramids.push(pyramid);
            on_channel();
        }

        info!(
            width = reference.width,
            height = reference.height,
            noise_sigma = ?noise_sigma,
            "Reference transformed"
        );

        // Only the preview outlives the reference planes
        let HalfResRaw {
            width,
            height,
            valid_width,
            valid_height,
            preview,
            metadata,
            ..
        } = reference;

        Ok(Self {
            kernels,
            reference_pyramids,
            output_pyramids: None,
            reset_output: true,
            noise_sigma,
            frame_count: 1,
            reference_preview: preview,
            reference_metadata: metadata,
            plane_size: (width, height),
            valid_size: (valid_width, valid_height),
        })
    }

    /// Aligns `candidate` to the reference and blends all four channels into the output.
    pub fn add_frame<F: FlowEstimator + ?Sized>(
        &mut self,
        candidate: &HalfResRaw,
        flow_estimator: &F,
        mut on_channel: impl FnMut(),
    ) -> Result<FrameFusion> {
        if (candidate.width, candidate.height) != self.plane_size {
            return Err(FusionError::DimensionMismatch {
                expected: self.plane_size,
                got: (candidate.width, candidate.height),
            });
        }

        let flow = {
            let _span = tracing::debug_span!("estimate_flow").entered();
            flow_estimator.estimate_flow(&self.reference_preview, &candidate.preview)?
        };
        let motion = motion_std_dev(&flow);

        // Capture conditions come from the reference, not the candidate
        let weights = select_weights(
            self.reference_metadata.iso,
            self.reference_metadata.exposure_time_ns,
            motion,
        );

        debug!(
            motion_std_dev = motion,
            difference_weight = weights.difference_weight,
            blend_weight = weights.blend_weight,
            "Fusing frame"
        );

        let (width, height) = self.plane_size;
        let outputs = match self.output_pyramids.take() {
            Some(outputs) => outputs,
            None => (0..BAYER_CHANNELS)
                .map(|_| WaveletPyramid::new(width, height))
                .collect::<Result<Vec<_>>>()?,
        };
        let outputs = self.output_pyramids.insert(outputs);

        for (c, output) in outputs.iter_mut().enumerate() {
            let request = FuseRequest {
                candidate,
                channel: c,
                flow: &flow,
                reference: &self.reference_pyramids[c],
                params: FusionParameters {
                    difference_weight: weights.difference_weight,
                    blend_weight: weights.blend_weight,
                    noise_sigma: self.noise_sigma[c],
                },
                reset_output: self.reset_output,
            };
            self.kernels.fuse(&request, output)?;
            on_channel();
        }

        self.reset_output = false;
        self.frame_count += 1;

        Ok(FrameFusion {
            motion_std_dev: motion,
            weights,
        })
    }

    /// Inverts the output pyramids (the reference pyramids when nothing was fused).
    pub fn finish(self, params: &FinishParams) -> Result<MergedRaw> {
        let frame_count = self.frame_count;
        let scale = (frame_count as f32).sqrt();
        let noise_sigma = self.noise_sigma.map(|sigma| sigma / scale);
        let pyramids = self.output_pyramids.unwrap_or(self.reference_pyramids);

        let mut channels: [Vec<u16>; BAYER_CHANNELS] = Default::default();
        for (c, (pyramid, channel)) in pyramids.iter().zip(channels.iter_mut()).enumerate() {
            let inverse = InverseParams {
                black_level: params.black_level[c],
                white_level: params.white_level,
                expanded_range: EXPANDED_RANGE,
                noise_sigma: noise_sigma[c],
                preview_mode: false,
                frame_count,
                denoise_aggressiveness: params.denoise_aggressiveness,
            };
            *channel = self.kernels.inverse_transform(pyramid, &inverse)?;
        }

        let (width, height) = self.plane_size;
        let (valid_width, valid_height) = self.valid_size;

        info!(frame_count, noise_sigma = ?noise_sigma, "Fusion finished");

        Ok(MergedRaw {
            width,
            height,
            valid_width,
            valid_height,
            channels,
            noise_sigma,
            frame_count,
            metadata: self.reference_metadata,
        })
    }

    /// Frames accumulated so far, reference included.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Per-channel noise of the reference, before frame-count normalisation.
    pub fn noise_sigma(&self) -> [f32; BAYER_CHANNELS] {
        self.noise_sigma
    }

    pub fn reference_pyramid(&self, channel: usize) -> Option<&WaveletPyramid> {
        self.reference_pyramids.get(channel)
    }

    /// `None` until the first candidate is fused.
    pub fn output_pyramid(&self, channel: usize) -> Option<&WaveletPyramid> {
        self.output_pyramids.as_ref().and_then(|pyramids| pyramids.get(channel))
    }

    pub fn reference_preview(&self) -> &GrayPreview {
        &self.reference_preview
    }
}

/// Fused half-resolution planes, black level removed and scaled to `0..=EXPANDED_RANGE`.
#[derive(Debug, Clone)]
pub struct MergedRaw {
    pub width: usize,
    pub height: usize,
    pub valid_width: usize,
    pub valid_height: usize,
    pub channels: [Vec<u16>; BAYER_CHANNELS],
    /// Noise sigma per channel after frame-count normalisation
    pub noise_sigma: [f32; BAYER_CHANNELS],
    pub frame_count: usize,
    /// Reference frame metadata
    pub metadata: RawMetadata,
}

impl MergedRaw {
    pub const BLACK_LEVEL: u16 = 0;
    pub const WHITE_LEVEL: u16 = EXPANDED_RANGE;

    #[inline]
    pub fn at(&self, channel: usize, x: usize, y: usize) -> u16 {
        self.channels[channel][y * self.width + x]
    }

    /// Reassembles the valid area into a full-resolution RGGB mosaic.
    ///
    /// Planes are ordered by cell position of `arrangement`; they are reordered so red always
    /// lands top-left.
    pub fn to_rggb_mosaic(&self, arrangement: SensorArrangement) -> BayerMosaic {
        let order = arrangement.channel_positions();

        let width = self.valid_width * 2;
        let height = self.valid_height * 2;
        let mut data = vec![0u16; width * height];

        for (y, row) in data.chunks_exact_mut(width).enumerate() {
            let ry = y / 2;
            for (x, value) in row.iter_mut().enumerate() {
                let cell = (y % 2) * 2 + x % 2;
                *value = self.at(order[cell], x / 2, ry);
            }
        }

        BayerMosaic {
            width,
            height,
            data,
        }
    }
}

/// Full-resolution RGGB mosaic.
#[derive(Debug, Clone, PartialEq)]
pub struct BayerMosaic {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u16>,
}
