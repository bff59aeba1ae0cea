//! Settings module
//!
//! Tone-mapping settings handed to the post-processing stage, and the configuration of a burst run.

pub mod types;

pub use types::{
    AutoSettingsMode, FusionConfig, FusionConfigBuilder, HistogramThresholds, PostProcessSettings,
};
