//! Blend weights from capture conditions and measured motion.

/// Difference tolerance and temporal blend strength handed to the fusion kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub difference_weight: f32,
    pub blend_weight: f32,
}

impl BlendWeights {
    pub const DEFAULT: BlendWeights = BlendWeights::new(16.0, 8.0);
    /// High ISO, long exposure, little motion
    pub const STATIC_NOISY: BlendWeights = BlendWeights::new(16.0, 16.0);
    /// Low ISO, fast shutter
    pub const LOW_NOISE: BlendWeights = BlendWeights::new(4.0, 4.0);
    pub const HIGH_MOTION: BlendWeights = BlendWeights::new(2.0, 8.0);

    pub const fn new(difference_weight: f32, blend_weight: f32) -> Self {
        Self {
            difference_weight,
            blend_weight,
        }
    }
}

const HIGH_ISO: u32 = 800;
const LONG_EXPOSURE_NS: i64 = 8_000_000;
const LOW_ISO: u32 = 200;
const FAST_EXPOSURE_NS: i64 = 1_250_000;
const MOTION_LIMIT: f32 = 10.0;

/// Picks blend weights for one candidate frame. The first matching rule wins:
///
/// | condition                                    | difference | blend |
/// |----------------------------------------------|-----------:|------:|
/// | iso >= 800, exposure >= 8 ms, motion < 10    | 16         | 16    |
/// | iso <= 200, exposure <= 1.25 ms              | 4          | 4     |
/// | motion > 10                                  | 2          | 8     |
/// | otherwise                                    | 16         | 8     |
///
/// `iso` and `exposure_time_ns` are the reference frame's.
pub fn select_weights(iso: u32, exposure_time_ns: i64, motion_std_dev: f32) -> BlendWeights {
    if iso >= HIGH_ISO && exposure_time_ns >= LONG_EXPOSURE_NS && motion_std_dev < MOTION_LIMIT {
        BlendWeights::STATIC_NOISY
    } else if iso <= LOW_ISO && exposure_time_ns <= FAST_EXPOSURE_NS {
        BlendWeights::LOW_NOISE
    } else if motion_std_dev > MOTION_LIMIT {
        BlendWeights::HIGH_MOTION
    } else {
        BlendWeights::DEFAULT
    }
}
