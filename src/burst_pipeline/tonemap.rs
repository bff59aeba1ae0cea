//! Tone-mapping module
//!
//! Colour science, the shared tone curve, RAW previews and the final demosaic + tone map.

pub mod color;
pub mod curve;
pub mod preview;
pub mod tonemapper;

pub use color::{ColorScience, ColorTransform, DngColorScience, Temperature, normalize_as_shot, white_balance_transform};
pub use curve::ToneCurve;
pub use preview::{CpuPreviewRenderer, PreviewRenderer, preview_routine};
pub use tonemapper::{CpuToneMapper, ToneMapper, orient};
