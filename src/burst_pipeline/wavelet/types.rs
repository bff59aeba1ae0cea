//! Wavelet pyramid buffers

use crate::burst_pipeline::common::error::{FusionError, Result};

/// Decomposition levels of every pyramid.
pub const DENOISE_LEVELS: usize = 6;

/// Output range of the inverse transform; merged RAW values are rescaled to `0..=EXPANDED_RANGE`.
pub const EXPANDED_RANGE: u16 = 16384;

pub const SUBBANDS: usize = 4;

/// Coefficient planes per subband.
pub const PLANES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subband {
    LowLow = 0,
    LowHigh = 1,
    HighLow = 2,
    HighHigh = 3,
}

impl Subband {
    pub const DETAIL: [Subband; 3] = [Subband::LowHigh, Subband::HighLow, Subband::HighHigh];
}

/// One decomposition level: four subbands, each with two coefficient planes.
///
/// Plane semantics belong to the kernels that fill them.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveletLevel {
    pub width: usize,
    pub height: usize,
    data: Vec<f32>,
}

impl WaveletLevel {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height * SUBBANDS * PLANES],
        }
    }

    fn offset(&self, subband: Subband, plane: usize) -> usize {
        (subband as usize * PLANES + plane) * self.width * self.height
    }

    pub fn plane(&self, subband: Subband, plane: usize) -> &[f32] {
        let start = self.offset(subband, plane);
        &self.data[start..start + self.width * self.height]
    }

    pub fn plane_mut(&mut self, subband: Subband, plane: usize) -> &mut [f32] {
        let start = self.offset(subband, plane);
        let len = self.width * self.height;
        &mut self.data[start..start + len]
    }

    /// Both planes of a subband as `(plane 0, plane 1)`.
    pub fn planes_mut(&mut self, subband: Subband) -> (&mut [f32], &mut [f32]) {
        let start = self.offset(subband, 0);
        let len = self.width * self.height;
        let (first, second) = self.data[start..start + 2 * len].split_at_mut(len);
        (first, second)
    }
}

/// Levels of one channel, finest first.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveletPyramid {
    pub levels: Vec<WaveletLevel>,
}

impl WaveletPyramid {
    /// Allocates a zeroed pyramid for a `width` x `height` channel plane.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        let alignment = 1 << DENOISE_LEVELS;
        if width == 0 || height == 0 || width % alignment != 0 || height % alignment != 0 {
            return Err(FusionError::InvalidDimensions(width, height));
        }

        let levels = (0..DENOISE_LEVELS)
            .map(|level| WaveletLevel::new(width >> (level + 1), height >> (level + 1)))
            .collect();

        Ok(Self { levels })
    }

    /// Size of the channel plane the pyramid decomposes.
    pub fn plane_size(&self) -> (usize, usize) {
        self.levels
            .first()
            .map(|level| (level.width * 2, level.height * 2))
            .unwrap_or((0, 0))
    }

    /// High-high subband of the finest level, the input to noise estimation.
    pub fn finest_high_high(&self) -> &[f32] {
        match self.levels.first() {
            Some(level) => level.plane(Subband::HighHigh, 0),
            None => &[],
        }
    }

    /// Whether `other` has the same level count and level geometry.
    pub fn same_shape(&self, other: &WaveletPyramid) -> bool {
        self.levels.len() == other.levels.len()
            && self
                .levels
                .iter()
                .zip(&other.levels)
                .all(|(a, b)| a.width == b.width && a.height == b.height)
    }
}
