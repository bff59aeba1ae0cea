//! Progress reporting for a burst run.

use tracing::{debug, error, info};

/// Receives progress milestones from the burst processor.
///
/// Values passed to `on_progress` are in `0..=100` and never decrease within a run.
pub trait ProgressSink {
    fn on_progress(&self, progress: u32);
    fn on_completed(&self);
    fn on_error(&self, message: &str);
}

/// Discards all progress.
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_progress(&self, _progress: u32) {}
    fn on_completed(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// Forwards progress to the tracing log.
pub struct LoggingProgress;

impl ProgressSink for LoggingProgress {
    fn on_progress(&self, progress: u32) {
        info!(progress, "Progress");
    }

    fn on_completed(&self) {
        info!("Processing completed");
    }

    fn on_error(&self, message: &str) {
        error!(message, "Processing failed");
    }
}

const FUSION_SHARE: f64 = 75.0;
const DENOISE_COMPLETED: u32 = 75;
const POST_PROCESS_COMPLETED: u32 = 95;
const IMAGE_SAVED: u32 = 100;

/// Maps pipeline milestones to percentages.
///
/// Fusion occupies the first 75%, split evenly across every channel of every frame
/// (the reference transform counts as one frame).
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    start: u32,
    per_step_increment: f64,
    steps_done: u32,
    last_reported: u32,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink, num_images: usize, start: u32) -> Self {
        let steps = (num_images.max(1) * 4) as f64;
        Self {
            sink,
            start,
            per_step_increment: FUSION_SHARE / steps,
            steps_done: 0,
            last_reported: 0,
        }
    }

    /// One channel of one frame has been transformed or fused.
    pub fn next_fused_channel(&mut self) {
        self.steps_done += 1;
        let value = self.start as f64 + self.per_step_increment * self.steps_done as f64;
        self.report(value as u32);
    }

    pub fn denoise_completed(&mut self) {
        self.report(self.start + DENOISE_COMPLETED);
    }

    pub fn post_process_completed(&mut self) {
        self.report(self.start + POST_PROCESS_COMPLETED);
    }

    pub fn image_saved(&mut self) {
        self.report(IMAGE_SAVED);
        self.sink.on_completed();
    }

    pub fn last_reported(&self) -> u32 {
        self.last_reported
    }

    fn report(&mut self, value: u32) {
        let value = value.clamp(self.last_reported, IMAGE_SAVED);
        debug!(value, "Progress update");
        self.last_reported = value;
        self.sink.on_progress(value);
    }
}
