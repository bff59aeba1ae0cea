//! Fusion module
//!
//! Blend-weight policy, exposure-driven denoise settings and the multi-frame accumulator.

pub mod accumulator;
pub mod denoise_settings;
pub mod weights;

pub use accumulator::{BayerMosaic, FinishParams, FrameFusion, FusionAccumulator, MergedRaw};
pub use denoise_settings::{DenoiseSettings, exposure_value};
pub use weights::{BlendWeights, select_weights};
