//! Wavelet module
//!
//! Pyramid buffers, the transform/fusion kernel contracts, CPU kernels and noise estimation.

pub mod cpu_kernels;
pub mod kernels;
pub mod noise;
pub mod types;

pub use cpu_kernels::CpuWaveletKernels;
pub use kernels::{FuseRequest, FusionParameters, InverseParams, WaveletKernels};
pub use noise::estimate_noise;
pub use types::{DENOISE_LEVELS, EXPANDED_RANGE, Subband, WaveletLevel, WaveletPyramid};
