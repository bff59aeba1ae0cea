//! Output module
//!
//! Encoders for the final JPEG and the optional merged Bayer TIFF.

pub mod jpeg_writer;
pub mod tiff_writer;
pub mod types;
pub mod writer;

pub use jpeg_writer::JpegWriter;
pub use tiff_writer::BayerTiffWriter;
pub use types::TiffCompression;
pub use writer::{ImageWriter, MosaicWriter};
