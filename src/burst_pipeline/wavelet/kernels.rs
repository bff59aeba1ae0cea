use crate::burst_pipeline::common::error::Result;
use crate::burst_pipeline::motion::types::MotionField;
use crate::burst_pipeline::raw::deinterleave::HalfResRaw;
use crate::burst_pipeline::wavelet::types::WaveletPyramid;

/// Blend parameters of one channel for one candidate frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParameters {
    pub difference_weight: f32,
    pub blend_weight: f32,
    pub noise_sigma: f32,
}

/// One fusion step: a candidate channel blended into the running output.
pub struct FuseRequest<'a> {
    pub candidate: &'a HalfResRaw,
    pub channel: usize,
    pub flow: &'a MotionField,
    pub reference: &'a WaveletPyramid,
    pub params: FusionParameters,
    /// Ignore whatever `output` holds and start a new accumulation
    pub reset_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InverseParams {
    pub black_level: u16,
    pub white_level: u16,
    pub expanded_range: u16,
    pub noise_sigma: f32,
    pub preview_mode: bool,
    pub frame_count: usize,
    pub denoise_aggressiveness: f32,
}

/// Wavelet transforms and the fusion kernel.
///
/// Implementations must be deterministic. Plane layout inside a level is theirs to define,
/// as long as `forward_transform`, `fuse` and `inverse_transform` agree with each other.
pub trait WaveletKernels {
    /// Decomposes one channel of `raw` into a `DENOISE_LEVELS` pyramid.
    fn forward_transform(&self, raw: &HalfResRaw, channel: usize) -> Result<WaveletPyramid>;

    /// Blends the motion-compensated candidate channel into `output`.
    fn fuse(&self, request: &FuseRequest<'_>, output: &mut WaveletPyramid) -> Result<()>;

    /// Reconstructs a channel plane rescaled to `0..=expanded_range`, black level removed.
    fn inverse_transform(&self, pyramid: &WaveletPyramid, params: &InverseParams) -> Result<Vec<u16>>;
}
