//! RAW frame and camera types

use serde::{Deserialize, Serialize};

use crate::burst_pipeline::common::error::{FusionError, Result};

/// Identifier of a frame inside its container.
pub type FrameId = String;

/// Number of Bayer channels (2x2 cell positions).
pub const BAYER_CHANNELS: usize = 4;

/// Sensor pixel packing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// MIPI packed 10-bit, 4 pixels in 5 bytes
    Raw10,
    /// MIPI packed 12-bit, 2 pixels in 3 bytes
    Raw12,
    /// Little-endian 16-bit
    Raw16,
}

/// Colour filter arrangement of the 2x2 Bayer cell, read left-to-right, top-to-bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SensorArrangement {
    #[default]
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl SensorArrangement {
    /// Cell positions (top-left, top-right, bottom-left, bottom-right) of red, first green,
    /// second green and blue.
    pub fn channel_positions(self) -> [usize; 4] {
        match self {
            SensorArrangement::Rggb => [0, 1, 2, 3],
            SensorArrangement::Grbg => [1, 0, 3, 2],
            SensorArrangement::Gbrg => [2, 0, 3, 1],
            SensorArrangement::Bggr => [3, 1, 2, 0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenOrientation {
    Portrait,
    ReversePortrait,
    #[default]
    Landscape,
    ReverseLandscape,
}

impl ScreenOrientation {
    /// Whether rendering in this orientation swaps width and height.
    pub fn is_portrait(self) -> bool {
        matches!(self, ScreenOrientation::Portrait | ScreenOrientation::ReversePortrait)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Illuminant {
    StandardA,
    StandardB,
    StandardC,
    D50,
    D55,
    #[default]
    D65,
    D75,
}

impl Illuminant {
    /// Correlated colour temperature in Kelvin.
    pub fn temperature(self) -> f32 {
        match self {
            Illuminant::StandardA => 2856.0,
            Illuminant::StandardB => 4874.0,
            Illuminant::StandardC => 6774.0,
            Illuminant::D50 => 5003.0,
            Illuminant::D55 => 5503.0,
            Illuminant::D65 => 6504.0,
            Illuminant::D75 => 7504.0,
        }
    }
}

/// Per-channel lens shading gain grid, sampled bilinearly over the normalised frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadingMap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl ShadingMap {
    pub fn flat(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![1.0; width * height],
        }
    }

    /// Gain at normalised coordinates `u`, `v` in `[0, 1]`.
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }

        let x = (u.clamp(0.0, 1.0) * (self.width - 1) as f32).max(0.0);
        let y = (v.clamp(0.0, 1.0) * (self.height - 1) as f32).max(0.0);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let at = |xx: usize, yy: usize| self.data[yy * self.width + xx];
        let top = at(x0, y0) * (1.0 - fx) + at(x1, y0) * fx;
        let bottom = at(x0, y1) * (1.0 - fx) + at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// Capture metadata attached to every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMetadata {
    pub iso: u32,
    pub exposure_time_ns: i64,
    pub exposure_compensation: i32,
    /// Camera neutral as shot (white balance vector)
    pub as_shot: [f32; 3],
    pub color_correction: [f32; 4],
    pub lens_shading_map: Vec<ShadingMap>,
    pub screen_orientation: ScreenOrientation,
    pub flipped: bool,
}

impl Default for RawMetadata {
    fn default() -> Self {
        Self {
            iso: 100,
            exposure_time_ns: 10_000_000,
            exposure_compensation: 0,
            as_shot: [1.0, 1.0, 1.0],
            color_correction: [1.0; 4],
            lens_shading_map: (0..BAYER_CHANNELS).map(|_| ShadingMap::flat(2, 2)).collect(),
            screen_orientation: ScreenOrientation::Landscape,
            flipped: false,
        }
    }
}

/// A single sensor frame of a burst.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub id: FrameId,
    /// Width of the Bayer mosaic in pixels
    pub width: usize,
    /// Height of the Bayer mosaic in pixels
    pub height: usize,
    pub pixel_format: PixelFormat,
    /// Bytes per row, including padding
    pub row_stride: usize,
    pub data: Vec<u8>,
    pub metadata: RawMetadata,
}

impl RawFrame {
    /// Builds a RAW16 frame from unpacked sensor values.
    pub fn from_u16(
        id: impl Into<FrameId>,
        width: usize,
        height: usize,
        values: &[u16],
        metadata: RawMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            pixel_format: PixelFormat::Raw16,
            row_stride: width * 2,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            metadata,
        }
    }

    /// Checks the frame against the layout invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(FusionError::InvalidDimensions(self.width, self.height));
        }

        if self.pixel_format == PixelFormat::Raw10 && self.width % 4 != 0 {
            return Err(FusionError::InvalidFrameData(format!(
                "RAW10 width {} is not a multiple of 4",
                self.width
            )));
        }

        let min_stride = match self.pixel_format {
            PixelFormat::Raw10 => self.width.div_ceil(4) * 5,
            PixelFormat::Raw12 => self.width.div_ceil(2) * 3,
            PixelFormat::Raw16 => self.width * 2,
        };

        if self.row_stride < min_stride {
            return Err(FusionError::InvalidFrameData(format!(
                "row stride {} is smaller than {} bytes required for width {}",
                self.row_stride, min_stride, self.width
            )));
        }

        if self.data.len() < self.row_stride * (self.height - 1) + min_stride {
            return Err(FusionError::InvalidFrameData(format!(
                "{} bytes is too small for {}x{} with stride {}",
                self.data.len(),
                self.width,
                self.height,
                self.row_stride
            )));
        }

        if self.metadata.lens_shading_map.len() != BAYER_CHANNELS {
            return Err(FusionError::InvalidLensShadingMap(self.metadata.lens_shading_map.len()));
        }

        Ok(())
    }

    /// Unpacked sensor value at `(x, y)`. Coordinates must be inside the frame.
    #[inline]
    pub fn sample(&self, x: usize, y: usize) -> u16 {
        let row = &self.data[y * self.row_stride..];
        match self.pixel_format {
            PixelFormat::Raw16 => u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]),
            PixelFormat::Raw10 => {
                let block = (x / 4) * 5;
                let i = x % 4;
                let high = row[block + i] as u16;
                let low = (row[block + 4] >> (i * 2)) & 0x03;
                (high << 2) | low as u16
            }
            PixelFormat::Raw12 => {
                let block = (x / 2) * 3;
                let i = x % 2;
                let high = row[block + i] as u16;
                let low = (row[block + 2] >> (i * 4)) & 0x0F;
                (high << 4) | low as u16
            }
        }
    }
}

/// Static per-device constants, loaded once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraProfile {
    pub black_level: [u16; 4],
    pub white_level: u16,
    pub sensor_arrangement: SensorArrangement,
    pub color_matrix1: [[f32; 3]; 3],
    pub color_matrix2: [[f32; 3]; 3],
    pub forward_matrix1: [[f32; 3]; 3],
    pub forward_matrix2: [[f32; 3]; 3],
    pub illuminant1: Illuminant,
    pub illuminant2: Illuminant,
}

const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

impl Default for CameraProfile {
    fn default() -> Self {
        Self {
            black_level: [64; 4],
            white_level: 1023,
            sensor_arrangement: SensorArrangement::Rggb,
            color_matrix1: IDENTITY,
            color_matrix2: IDENTITY,
            forward_matrix1: IDENTITY,
            forward_matrix2: IDENTITY,
            illuminant1: Illuminant::StandardA,
            illuminant2: Illuminant::D65,
        }
    }
}
