//! RAW module
//!
//! Frame and camera types, RAW file decoding, frame containers and the half-resolution split
//! every later stage works on.

pub mod container;
pub mod deinterleave;
pub mod manifest;
pub mod rawloader_reader;
pub mod reader;
pub mod types;

pub use container::{FrameContainer, InMemoryContainer};
pub use deinterleave::{EDGE_ALIGNMENT, HalfResRaw, deinterleave};
pub use manifest::{BurstManifest, ManifestContainer, ManifestFrame};
pub use rawloader_reader::RawLoaderReader;
pub use reader::{DecodedRaw, RawFrameReader};
pub use types::{
    BAYER_CHANNELS, CameraProfile, FrameId, Illuminant, PixelFormat, RawFrame, RawMetadata,
    ScreenOrientation, SensorArrangement, ShadingMap,
};
