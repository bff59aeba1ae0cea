//! Burst conversions module
//!
//! Orchestration of a whole burst run, from frame selection to the encoded outputs.

mod burst_processor;
mod tests;

pub use burst_processor::{BurstProcessor, BurstReport, CpuBurstProcessor, FrameSelection, FusedFrame};
