//! Frame storage seen by the burst processor.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::types::{CameraProfile, FrameId, RawFrame, RawMetadata};
use crate::burst_pipeline::settings::PostProcessSettings;

/// A captured burst: frame metadata is cheap to query, pixel data is loaded on demand
/// and released as soon as the processor is done with a frame.
pub trait FrameContainer {
    fn camera_profile(&self) -> &CameraProfile;

    /// Frame identifiers in capture order.
    fn frame_ids(&self) -> Vec<FrameId>;

    /// The frame chosen as alignment anchor at capture time, if any.
    fn reference_frame(&self) -> Option<FrameId>;

    fn frame_metadata(&self, id: &str) -> Result<RawMetadata>;

    fn load_frame(&self, id: &str) -> Result<Arc<RawFrame>>;

    fn release_frame(&self, id: &str);

    /// Caller-supplied tone-mapping settings; `None` asks for auto estimation.
    fn post_process_settings(&self) -> Option<PostProcessSettings>;
}

/// Container over frames already held in memory.
///
/// Keeps a log of loads and releases so callers can see which frames a run touched.
pub struct InMemoryContainer {
    profile: CameraProfile,
    frames: Vec<Arc<RawFrame>>,
    reference: Option<FrameId>,
    settings: Option<PostProcessSettings>,
    loaded: Mutex<Vec<FrameId>>,
    released: Mutex<Vec<FrameId>>,
}

impl InMemoryContainer {
    pub fn new(profile: CameraProfile, frames: Vec<RawFrame>) -> Self {
        Self {
            profile,
            frames: frames.into_iter().map(Arc::new).collect(),
            reference: None,
            settings: None,
            loaded: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reference(mut self, id: impl Into<FrameId>) -> Self {
        self.reference = Some(id.into());
        self
    }

    pub fn with_settings(mut self, settings: PostProcessSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn loaded_frames(&self) -> Vec<FrameId> {
        self.loaded.lock().clone()
    }

    pub fn released_frames(&self) -> Vec<FrameId> {
        self.released.lock().clone()
    }

    fn find(&self, id: &str) -> Result<&Arc<RawFrame>> {
        self.frames
            .iter()
            .find(|frame| frame.id == id)
            .ok_or_else(|| FusionError::FrameNotFound(id.to_string()))
    }
}

impl FrameContainer for InMemoryContainer {
    fn camera_profile(&self) -> &CameraProfile {
        &self.profile
    }

    fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.iter().map(|frame| frame.id.clone()).collect()
    }

    fn reference_frame(&self) -> Option<FrameId> {
        self.reference.clone()
    }

    fn frame_metadata(&self, id: &str) -> Result<RawMetadata> {
        Ok(self.find(id)?.metadata.clone())
    }

    fn load_frame(&self, id: &str) -> Result<Arc<RawFrame>> {
        let frame = self.find(id)?.clone();
        self.loaded.lock().push(frame.id.clone());
        Ok(frame)
    }

    fn release_frame(&self, id: &str) {
        self.released.lock().push(id.to_string());
    }

    fn post_process_settings(&self) -> Option<PostProcessSettings> {
        self.settings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> RawFrame {
        RawFrame::from_u16(id, 2, 2, &[0; 4], RawMetadata::default())
    }

    #[test]
    fn test_load_and_release_are_logged() {
        let container = InMemoryContainer::new(CameraProfile::default(), vec![frame("a"), frame("b")])
            .with_reference("b");

        assert_eq!(container.frame_ids(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(container.reference_frame().as_deref(), Some("b"));

        let loaded = container.load_frame("a").unwrap();
        assert_eq!(loaded.id, "a");
        container.release_frame("a");

        assert_eq!(container.loaded_frames(), vec!["a".to_string()]);
        assert_eq!(container.released_frames(), vec!["a".to_string()]);
    }

    #[test]
    fn test_missing_frame() {
        let container = InMemoryContainer::new(CameraProfile::default(), vec![frame("a")]);
        assert!(matches!(container.load_frame("z"), Err(FusionError::FrameNotFound(_))));
        assert!(container.frame_metadata("z").is_err());
        assert!(container.post_process_settings().is_none());
    }
}
