//! Motion field types

use image::GrayImage;

/// 8-bit single-channel preview frames are compared in.
pub type GrayPreview = GrayImage;

/// Dense displacement field: for each reference pixel `(x, y)`, the matching candidate pixel
/// is at `(x + dx, y + dy)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionField {
    pub width: usize,
    pub height: usize,
    pub data: Vec<[f32; 2]>,
}

impl MotionField {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![[0.0; 2]; width * height],
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> [f32; 2] {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with pixel-centre alignment, clamped at the borders.
    pub fn sample(&self, x: f32, y: f32) -> [f32; 2] {
        let x = x.clamp(0.0, (self.width - 1) as f32);
        let y = y.clamp(0.0, (self.height - 1) as f32);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let mut out = [0.0; 2];
        for (k, value) in out.iter_mut().enumerate() {
            let top = self.at(x0, y0)[k] * (1.0 - fx) + self.at(x1, y0)[k] * fx;
            let bottom = self.at(x0, y1)[k] * (1.0 - fx) + self.at(x1, y1)[k] * fx;
            *value = top * (1.0 - fy) + bottom * fy;
        }
        out
    }

    /// Bilinear resize of the field to `width` x `height`.
    ///
    /// Vectors are resampled, not rescaled; use [`MotionField::scaled`] to change their length.
    pub fn resized(&self, width: usize, height: usize) -> Self {
        if self.width == 0 || self.height == 0 {
            return Self::zeros(width, height);
        }

        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            let src_y = (y as f32 + 0.5) * sy - 0.5;
            for x in 0..width {
                let src_x = (x as f32 + 0.5) * sx - 0.5;
                data.push(self.sample(src_x, src_y));
            }
        }

        Self { width, height, data }
    }

    pub fn scaled(mut self, factor: f32) -> Self {
        for v in &mut self.data {
            v[0] *= factor;
            v[1] *= factor;
        }
        self
    }

    pub fn magnitudes(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().map(|v| v[0].hypot(v[1]))
    }
}
