//! JSON burst manifest and the file-backed container built from it.
//!
//! A manifest lists the RAW files of one burst with the capture metadata RAW decoders do not
//! expose, and optionally pins the reference frame and the tone-mapping settings:
//!
//! ```json
//! {
//!   "reference": "frame_0",
//!   "frames": [
//!     { "path": "frame_0.dng", "iso": 800, "exposure_time_ns": 10000000 },
//!     { "path": "frame_1.dng", "iso": 800, "exposure_time_ns": 10000000, "exposure_compensation": 0 }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::container::FrameContainer;
use crate::burst_pipeline::raw::rawloader_reader::RawLoaderReader;
use crate::burst_pipeline::raw::reader::RawFrameReader;
use crate::burst_pipeline::raw::types::{
    CameraProfile, FrameId, RawFrame, RawMetadata, ScreenOrientation,
};
use crate::burst_pipeline::settings::PostProcessSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub path: PathBuf,
    /// Defaults to the file stem
    #[serde(default)]
    pub id: Option<FrameId>,
    pub iso: u32,
    pub exposure_time_ns: i64,
    #[serde(default)]
    pub exposure_compensation: i32,
    #[serde(default)]
    pub orientation: ScreenOrientation,
    #[serde(default)]
    pub flipped: bool,
    /// Overrides the white balance found in the RAW file
    #[serde(default)]
    pub as_shot: Option<[f32; 3]>,
}

impl ManifestFrame {
    pub fn frame_id(&self) -> FrameId {
        self.id.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstManifest {
    pub frames: Vec<ManifestFrame>,
    #[serde(default)]
    pub reference: Option<FrameId>,
    #[serde(default)]
    pub post_process: Option<PostProcessSettings>,
}

impl BurstManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FusionError::ManifestError(e.to_string()))
    }
}

/// Container over RAW files listed in a manifest.
///
/// The profile and white balance come from the first decodable frame (the reference when
/// one is pinned); every other frame is decoded lazily on `load_frame` and dropped on release.
pub struct ManifestContainer<R: RawFrameReader = RawLoaderReader> {
    reader: R,
    base_dir: PathBuf,
    manifest: BurstManifest,
    profile: CameraProfile,
    as_shot: [f32; 3],
    cache: Mutex<HashMap<FrameId, Arc<RawFrame>>>,
}

impl ManifestContainer<RawLoaderReader> {
    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        Self::open_with_reader(manifest_path, RawLoaderReader)
    }
}

impl<R: RawFrameReader> ManifestContainer<R> {
    pub fn open_with_reader<P: AsRef<Path>>(manifest_path: P, reader: R) -> Result<Self> {
        let manifest_path = manifest_path.as_ref();
        let json = std::fs::read_to_string(manifest_path).map_err(|e| {
            FusionError::InputReadError(format!("{}: {}", manifest_path.display(), e))
        })?;

        let manifest = BurstManifest::from_json(&json)?;
        let base_dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self::from_manifest(manifest, base_dir, reader)
    }

    pub fn from_manifest(manifest: BurstManifest, base_dir: PathBuf, reader: R) -> Result<Self> {
        let profile_frame = match &manifest.reference {
            Some(reference) => manifest
                .frames
                .iter()
                .find(|frame| &frame.frame_id() == reference)
                .ok_or_else(|| FusionError::FrameNotFound(reference.clone()))?,
            None => manifest.frames.first().ok_or(FusionError::EmptyBurst)?,
        };

        let profile_id = profile_frame.frame_id();
        let data = read_file(&base_dir.join(&profile_frame.path))?;
        let decoded = reader.read_raw(profile_id.clone(), &data)?;

        info!(
            frames = manifest.frames.len(),
            profile_frame = %profile_id,
            "Opened burst manifest"
        );

        let container = Self {
            reader,
            base_dir,
            manifest,
            profile: decoded.profile,
            as_shot: decoded.frame.metadata.as_shot,
            cache: Mutex::new(HashMap::new()),
        };

        // Keep the profile frame decoded so the first load does not read it again
        let mut frame = decoded.frame;
        frame.metadata = container.frame_metadata(&profile_id)?;
        container.cache.lock().insert(profile_id, Arc::new(frame));

        Ok(container)
    }

    fn entry(&self, id: &str) -> Result<&ManifestFrame> {
        self.manifest
            .frames
            .iter()
            .find(|frame| frame.frame_id() == id)
            .ok_or_else(|| FusionError::FrameNotFound(id.to_string()))
    }
}

impl<R: RawFrameReader> FrameContainer for ManifestContainer<R> {
    fn camera_profile(&self) -> &CameraProfile {
        &self.profile
    }

    fn frame_ids(&self) -> Vec<FrameId> {
        self.manifest.frames.iter().map(ManifestFrame::frame_id).collect()
    }

    fn reference_frame(&self) -> Option<FrameId> {
        self.manifest.reference.clone()
    }

    fn frame_metadata(&self, id: &str) -> Result<RawMetadata> {
        let entry = self.entry(id)?;
        Ok(RawMetadata {
            iso: entry.iso,
            exposure_time_ns: entry.exposure_time_ns,
            exposure_compensation: entry.exposure_compensation,
            as_shot: entry.as_shot.unwrap_or(self.as_shot),
            screen_orientation: entry.orientation,
            flipped: entry.flipped,
            ..RawMetadata::default()
        })
    }

    fn load_frame(&self, id: &str) -> Result<Arc<RawFrame>> {
        if let Some(frame) = self.cache.lock().get(id) {
            return Ok(frame.clone());
        }

        let entry = self.entry(id)?;
        let path = self.base_dir.join(&entry.path);
        debug!(frame = id, path = %path.display(), "Loading frame");

        let data = read_file(&path)?;
        let mut decoded = self.reader.read_raw(id.to_string(), &data)?;
        decoded.frame.metadata = self.frame_metadata(id)?;

        let frame = Arc::new(decoded.frame);
        self.cache.lock().insert(id.to_string(), frame.clone());
        Ok(frame)
    }

    fn release_frame(&self, id: &str) {
        if self.cache.lock().remove(id).is_some() {
            debug!(frame = id, "Released frame");
        }
    }

    fn post_process_settings(&self) -> Option<PostProcessSettings> {
        self.manifest.post_process.clone()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| FusionError::InputReadError(format!("{}: {}", path.display(), e)))
}
