//! RAW frame reader implementation using the rawloader library.
//!
//! Decodes camera RAW files (ARW, CR2, NEF, DNG, ...) into RAW16 frames and extracts the
//! sensor constants the burst engine needs: black and white levels, the Bayer arrangement,
//! the as-shot white balance and the colour matrix.

use std::io::Cursor;

use rawloader::RawImageData as RawloaderImageData;
use tracing::debug;

use crate::burst_pipeline::common::error::{FusionError, Result};
use crate::burst_pipeline::raw::reader::{DecodedRaw, RawFrameReader};
use crate::burst_pipeline::raw::types::{
    CameraProfile, FrameId, Illuminant, RawFrame, RawMetadata, SensorArrangement,
};

/// RAW reader that uses the rawloader library for decoding.
///
/// Capture metadata that rawloader does not expose (ISO, exposure time, exposure
/// compensation) is left at its defaults and is expected to be supplied by the container.
pub struct RawLoaderReader;

/// rawloader colour index for red, green and blue.
const CFA_RED: usize = 0;
const CFA_BLUE: usize = 2;

impl RawFrameReader for RawLoaderReader {
    fn read_raw(&self, id: FrameId, data: &[u8]) -> Result<DecodedRaw> {
        debug!("Decoding RAW image {}, {} bytes", id, data.len());

        let decoded = rawloader::decode(&mut Cursor::new(data))
            .map_err(|e| FusionError::DecodeError(e.to_string()))?;

        if decoded.cpp != 1 {
            return Err(FusionError::DecodeError(format!(
                "{} has {} components per pixel, expected a Bayer mosaic",
                id, decoded.cpp
            )));
        }

        // The engine works on whole 2x2 cells
        let width = decoded.width & !1;
        let height = decoded.height & !1;

        debug!("Decoded image: {}x{} (cropped to {}x{})", decoded.width, decoded.height, width, height);

        let values: Vec<u16> = match &decoded.data {
            RawloaderImageData::Integer(values) => values.clone(),
            // Float data is normalised to 0.0-1.0, scale it to the white level
            RawloaderImageData::Float(values) => {
                let white = decoded.whitelevels[0].max(1) as f32;
                values.iter().map(|&v| (v * white).clamp(0.0, u16::MAX as f32) as u16).collect()
            }
        };

        let mut cropped = Vec::with_capacity(width * height);
        for row in values.chunks_exact(decoded.width).take(height) {
            cropped.extend_from_slice(&row[..width]);
        }

        let sensor_arrangement = arrangement_from_cfa(&decoded.cfa)?;

        let black_level = cell_black_levels(decoded.blacklevels, sensor_arrangement);
        let white_level = decoded.whitelevels.iter().copied().max().unwrap_or(u16::MAX);

        let metadata = RawMetadata {
            as_shot: as_shot_neutral(decoded.wb_coeffs),
            ..RawMetadata::default()
        };

        let color_matrix = [
            decoded.xyz_to_cam[0],
            decoded.xyz_to_cam[1],
            decoded.xyz_to_cam[2],
        ];

        let profile = CameraProfile {
            black_level,
            white_level,
            sensor_arrangement,
            color_matrix1: color_matrix,
            color_matrix2: color_matrix,
            illuminant1: Illuminant::D65,
            illuminant2: Illuminant::D65,
            ..CameraProfile::default()
        };

        debug!(
            "Sensor {:?}, black {:?}, white {}",
            sensor_arrangement, black_level, white_level
        );

        Ok(DecodedRaw {
            frame: RawFrame::from_u16(id, width, height, &cropped, metadata),
            profile,
        })
    }
}

fn arrangement_from_cfa(cfa: &rawloader::CFA) -> Result<SensorArrangement> {
    let top_left = cfa.color_at(0, 0);
    let top_right = cfa.color_at(0, 1);
    let bottom_left = cfa.color_at(1, 0);

    match (top_left, top_right, bottom_left) {
        (CFA_RED, _, _) => Ok(SensorArrangement::Rggb),
        (CFA_BLUE, _, _) => Ok(SensorArrangement::Bggr),
        (_, CFA_RED, _) => Ok(SensorArrangement::Grbg),
        (_, CFA_BLUE, _) => Ok(SensorArrangement::Gbrg),
        _ => Err(FusionError::DecodeError(format!(
            "unsupported colour filter array {}",
            cfa.name
        ))),
    }
}

/// rawloader reports black levels per CFA colour (red, green, blue, second green); the engine
/// wants them per cell position.
fn cell_black_levels(levels: [u16; 4], arrangement: SensorArrangement) -> [u16; 4] {
    let by_color = [levels[0], levels[1], levels[3], levels[2]];
    let positions = arrangement.channel_positions();
    let mut out = [0u16; 4];
    for (color, &position) in positions.iter().enumerate() {
        out[position] = by_color[color];
    }
    out
}

/// White balance multipliers are the inverse of the camera neutral.
fn as_shot_neutral(wb_coeffs: [f32; 4]) -> [f32; 3] {
    let inv = |v: f32| if v.is_finite() && v > 0.0 { 1.0 / v } else { 0.0 };
    let neutral = [inv(wb_coeffs[0]), inv(wb_coeffs[1]), inv(wb_coeffs[2])];
    let max = neutral.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        [neutral[0] / max, neutral[1] / max, neutral[2] / max]
    } else {
        [1.0, 1.0, 1.0]
    }
}
