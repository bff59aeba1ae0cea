use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("No frames found")]
    EmptyBurst,

    #[error("Invalid lens shading map: expected 4 channels, got {0}")]
    InvalidLensShadingMap(usize),

    #[error("Camera white balance vector is zero")]
    ZeroWhiteBalance,

    #[error("Colour matrix is not invertible")]
    SingularColorMatrix,

    #[error("Invalid downscale factor: {0}")]
    UnsupportedDownscale(u32),

    #[error("Invalid image dimensions: width={0}, height={1}")]
    InvalidDimensions(usize, usize),

    #[error("Frame dimensions {got:?} do not match reference {expected:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    #[error("Invalid frame data: {0}")]
    InvalidFrameData(String),

    #[error("Failed to read input file: {0}")]
    InputReadError(String),

    #[error("Failed to write output file: {0}")]
    OutputWriteError(String),

    #[error("Failed to decode RAW image: {0}")]
    DecodeError(String),

    #[error("Failed to encode image: {0}")]
    EncodeError(String),

    #[error("Invalid burst manifest: {0}")]
    ManifestError(String),

    #[error("Processing cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FusionError {
    /// Errors caused by the burst itself rather than by I/O or codecs.
    pub fn is_fatal_input(&self) -> bool {
        matches!(
            self,
            FusionError::EmptyBurst
                | FusionError::InvalidLensShadingMap(_)
                | FusionError::ZeroWhiteBalance
                | FusionError::SingularColorMatrix
                | FusionError::UnsupportedDownscale(_)
                | FusionError::InvalidDimensions(..)
                | FusionError::DimensionMismatch { .. }
                | FusionError::FrameNotFound(_)
                | FusionError::InvalidFrameData(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
