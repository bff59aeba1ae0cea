//! Burst fusion pipeline module
//!
//! Merges a burst of RAW frames into one low-noise image: frame selection, motion-compensated
//! wavelet fusion, auto-estimated tone settings, tone mapping and encoding.

pub mod auto_settings;
pub mod common;
pub mod conversions;
pub mod fusion;
pub mod measure;
pub mod motion;
pub mod output;
pub mod raw;
pub mod settings;
pub mod tonemap;
pub mod wavelet;

pub use common::{
    FusionError,
    LoggingProgress,
    NoopProgress,
    PipelineTimings,
    ProgressSink,
    Result,
};

pub use raw::{
    CameraProfile,
    FrameContainer,
    InMemoryContainer,
    ManifestContainer,
    RawFrame,
    RawMetadata,
};

pub use settings::{
    AutoSettingsMode,
    FusionConfig,
    FusionConfigBuilder,
    HistogramThresholds,
    PostProcessSettings,
};

pub use auto_settings::AutoSettingsEstimator;

pub use fusion::{
    BlendWeights,
    FusionAccumulator,
    MergedRaw,
    select_weights,
};

pub use output::TiffCompression;

pub use conversions::{
    BurstProcessor,
    BurstReport,
    CpuBurstProcessor,
    FrameSelection,
    FusedFrame,
};
