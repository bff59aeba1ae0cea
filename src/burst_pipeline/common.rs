//! Common utilities module
//!
//! Shared error taxonomy, stage timings and progress reporting used across the burst pipeline.

pub mod error;
pub mod progress;
pub mod timing;

pub use error::{FusionError, Result};
pub use progress::{LoggingProgress, NoopProgress, ProgressSink, ProgressTracker};
pub use timing::{PipelineTimings, StepTiming, Timer};
