//! Motion module
//!
//! Dense flow between frame previews and the motion statistic that gates blend weights.

pub mod flow;
pub mod statistic;
pub mod types;

pub use flow::{FlowEstimator, FlowParams, PatchFlowEstimator};
pub use statistic::motion_std_dev;
pub use types::{GrayPreview, MotionField};
