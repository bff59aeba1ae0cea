use crate::burst_pipeline::common::error::Result;
use crate::burst_pipeline::raw::types::{CameraProfile, FrameId, RawFrame};

/// A decoded RAW file: the frame plus the sensor constants found in it.
#[derive(Debug, Clone)]
pub struct DecodedRaw {
    pub frame: RawFrame,
    pub profile: CameraProfile,
}

pub trait RawFrameReader {
    fn read_raw(&self, id: FrameId, data: &[u8]) -> Result<DecodedRaw>;
}
