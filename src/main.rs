use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use burstfuse_rs::burst_pipeline::{
    AutoSettingsMode, CpuBurstProcessor, FusionConfig, LoggingProgress, TiffCompression,
};
use burstfuse_rs::logger;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AutoMode {
    /// White balance, shadows, black and white point
    Basic,
    /// Basic plus exposure, scene luminance and noise
    Full,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RawCompression {
    None,
    Lzw,
    Deflate,
}

#[derive(Parser)]
#[command(name = "burstfuse")]
#[command(about = "Fuse a burst of RAW frames into one low-noise JPEG")]
struct Cli {
    /// Burst manifest (JSON) listing the RAW frames
    manifest: PathBuf,

    /// Output JPEG
    #[arg(short, long, default_value = "output.jpg")]
    output: PathBuf,

    /// Also write the merged RAW as a 16-bit Bayer TIFF
    #[arg(long)]
    raw_output: Option<PathBuf>,

    /// Compression of the merged RAW TIFF
    #[arg(long, value_enum, default_value = "none")]
    raw_compression: RawCompression,

    /// Auto-settings estimator used when the manifest carries no settings
    #[arg(long, value_enum, default_value = "full")]
    auto: AutoMode,

    /// Fuse no more frames than the exposure calls for
    #[arg(long)]
    limit_merge: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init("info");

    let config = FusionConfig::builder()
        .auto_settings(match cli.auto {
            AutoMode::Basic => AutoSettingsMode::Basic,
            AutoMode::Full => AutoSettingsMode::Full,
        })
        .raw_compression(match cli.raw_compression {
            RawCompression::None => TiffCompression::None,
            RawCompression::Lzw => TiffCompression::Lzw,
            RawCompression::Deflate => TiffCompression::DeflateBalanced,
        })
        .limit_merge_frames(cli.limit_merge)
        .build();

    let processor = CpuBurstProcessor::new(config);
    info!(manifest = %cli.manifest.display(), "Burst processor initialized");

    let report = processor
        .process_file(&cli.manifest, &cli.output, cli.raw_output.as_deref(), &LoggingProgress)
        .with_context(|| format!("failed to process {}", cli.manifest.display()))?;

    info!(
        reference = %report.selection.reference,
        fused = report.fused.len(),
        excluded = report.selection.excluded.len(),
        width = report.width,
        height = report.height,
        output = %cli.output.display(),
        "Saved fused image"
    );

    Ok(())
}
