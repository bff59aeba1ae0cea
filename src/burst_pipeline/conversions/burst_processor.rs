use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};

use crate::burst_pipeline::{
    auto_settings::AutoSettingsEstimator,
    common::error::{FusionError, Result},
    common::progress::{ProgressSink, ProgressTracker},
    common::timing::PipelineTimings,
    fusion::{DenoiseSettings, FinishParams, FrameFusion, FusionAccumulator, MergedRaw},
    measure::{CpuImageMeasure, ImageMeasure},
    motion::{FlowEstimator, PatchFlowEstimator},
    output::{BayerTiffWriter, ImageWriter, JpegWriter, MosaicWriter},
    raw::{BAYER_CHANNELS, FrameContainer, FrameId, HalfResRaw, ManifestContainer, RawFrame, deinterleave},
    settings::{FusionConfig, PostProcessSettings},
    tonemap::{
        ColorScience, CpuPreviewRenderer, CpuToneMapper, DngColorScience, PreviewRenderer, ToneMapper,
    },
    wavelet::{CpuWaveletKernels, WaveletKernels},
};

/// Frames taking part in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSelection {
    pub reference: FrameId,
    /// Frames fused into the reference, in container order
    pub candidates: Vec<FrameId>,
    /// Frames of another exposure group, or beyond the merge limit
    pub excluded: Vec<FrameId>,
}

impl FrameSelection {
    /// Fused frames, reference included.
    pub fn frame_count(&self) -> usize {
        self.candidates.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedFrame {
    pub id: FrameId,
    pub fusion: FrameFusion,
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct BurstReport {
    pub selection: FrameSelection,
    pub fused: Vec<FusedFrame>,
    /// Noise sigma handed to the inverse transform, per channel
    pub noise_sigma: [f32; BAYER_CHANNELS],
    pub settings: PostProcessSettings,
    pub width: u32,
    pub height: u32,
    pub timings: PipelineTimings,
}

pub type CpuBurstProcessor = BurstProcessor<
    CpuWaveletKernels,
    PatchFlowEstimator,
    CpuToneMapper,
    CpuPreviewRenderer,
    CpuImageMeasure,
    DngColorScience,
>;

/// Fuses a burst into one image: picks the reference and its exposure group, accumulates every
/// candidate into the reference's wavelet pyramids, then tone maps and encodes the merged RAW.
pub struct BurstProcessor<K, F, T, P, M, C>
where
    K: WaveletKernels,
    F: FlowEstimator,
    T: ToneMapper,
    P: PreviewRenderer,
    M: ImageMeasure,
    C: ColorScience,
{
    kernels: K,
    flow: F,
    tone_mapper: T,
    renderer: P,
    measure: M,
    color: C,
    config: FusionConfig,
    cancelled: Arc<AtomicBool>,
}

impl CpuBurstProcessor {
    pub fn new(config: FusionConfig) -> Self {
        Self::with_custom(
            CpuWaveletKernels,
            PatchFlowEstimator::new(config.flow),
            CpuToneMapper::new(),
            CpuPreviewRenderer::new(),
            CpuImageMeasure::new(),
            DngColorScience::new(),
            config,
        )
    }
}

impl<K, F, T, P, M, C> BurstProcessor<K, F, T, P, M, C>
where
    K: WaveletKernels,
    F: FlowEstimator,
    T: ToneMapper,
    P: PreviewRenderer,
    M: ImageMeasure,
    C: ColorScience,
{
    pub fn with_custom(
        kernels: K,
        flow: F,
        tone_mapper: T,
        renderer: P,
        measure: M,
        color: C,
        config: FusionConfig,
    ) -> Self {
        Self {
            kernels,
            flow,
            tone_mapper,
            renderer,
            measure,
            color,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares `flag` as the cancellation signal. Setting it stops the run before the next frame.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Picks the reference and the frames of its exposure group.
    ///
    /// Without a container reference the sharpest frame wins, first one on ties.
    pub fn select_frames(&self, container: &dyn FrameContainer) -> Result<FrameSelection> {
        let ids = container.frame_ids();
        if ids.is_empty() {
            return Err(FusionError::EmptyBurst);
        }

        let reference = match container.reference_frame() {
            Some(id) => id,
            None => self.sharpest_frame(container, &ids)?,
        };
        let reference_metadata = container.frame_metadata(&reference)?;

        let mut candidates = Vec::new();
        let mut excluded = Vec::new();
        for id in ids.into_iter().filter(|id| *id != reference) {
            let metadata = container.frame_metadata(&id)?;
            if metadata.exposure_compensation == reference_metadata.exposure_compensation {
                candidates.push(id);
            } else {
                debug!(
                    frame = %id,
                    exposure_compensation = metadata.exposure_compensation,
                    "Frame outside the reference exposure group"
                );
                excluded.push(id);
            }
        }

        if self.config.limit_merge_frames {
            let shadows = container
                .post_process_settings()
                .map_or(PostProcessSettings::default().shadows, |settings| settings.shadows);
            let denoise = DenoiseSettings::new(
                reference_metadata.iso,
                reference_metadata.exposure_time_ns,
                shadows,
            );
            let keep = denoise.merge_images.saturating_sub(1);
            if candidates.len() > keep {
                debug!(merge_images = denoise.merge_images, "Limiting fused frames");
                excluded.extend(candidates.drain(keep..));
            }
        }

        info!(
            reference = %reference,
            candidates = candidates.len(),
            excluded = excluded.len(),
            "Frames selected"
        );

        Ok(FrameSelection {
            reference,
            candidates,
            excluded,
        })
    }

    fn sharpest_frame(&self, container: &dyn FrameContainer, ids: &[FrameId]) -> Result<FrameId> {
        let mut best: Option<(&FrameId, f32)> = None;
        for id in ids {
            let sharpness = with_frame(container, id, |frame| self.measure.measure_sharpness(frame))?;
            debug!(frame = %id, sharpness, "Measured sharpness");
            if best.is_none_or(|(_, highest)| sharpness > highest) {
                best = Some((id, sharpness));
            }
        }

        best.map(|(id, _)| id.clone()).ok_or(FusionError::EmptyBurst)
    }

    /// Settings supplied by the container, or estimated from the reference.
    fn resolve_settings(&self, container: &dyn FrameContainer, reference: &RawFrame) -> Result<PostProcessSettings> {
        if let Some(settings) = container.post_process_settings() {
            debug!("Using supplied post-process settings");
            return Ok(settings);
        }

        let mut settings = AutoSettingsEstimator::new(&self.renderer, &self.measure, &self.color, self.config.thresholds)
            .estimate(self.config.auto_settings, reference, container.camera_profile())?;

        let denoise = DenoiseSettings::new(
            reference.metadata.iso,
            reference.metadata.exposure_time_ns,
            settings.shadows,
        );
        settings.spatial_denoise_aggressiveness = denoise.spatial_weight;
        settings.chroma_eps = denoise.chroma_eps;
        debug!(
            spatial_weight = denoise.spatial_weight,
            chroma_eps = denoise.chroma_eps,
            "Denoise strength from reference exposure"
        );

        Ok(settings)
    }

    fn check_dimensions(&self, expected: (usize, usize), frame: &RawFrame) -> Result<()> {
        if !self.config.validate_dimensions {
            return Ok(());
        }

        if frame.width == 0 || frame.height == 0 {
            return Err(FusionError::InvalidDimensions(frame.width, frame.height));
        }

        if (frame.width, frame.height) != expected {
            return Err(FusionError::DimensionMismatch {
                expected,
                got: (frame.width, frame.height),
            });
        }

        Ok(())
    }

    /// Accumulates every candidate into the reference pyramids and inverts the result.
    fn fuse(
        &self,
        container: &dyn FrameContainer,
        selection: &FrameSelection,
        reference: HalfResRaw,
        reference_size: (usize, usize),
        settings: &PostProcessSettings,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<(MergedRaw, Vec<FusedFrame>)> {
        let profile = container.camera_profile();
        let mut accumulator = FusionAccumulator::new(&self.kernels, reference, || tracker.next_fused_channel())?;
        let mut fused = Vec::with_capacity(selection.candidates.len());

        for id in &selection.candidates {
            if self.cancelled.load(Ordering::Relaxed) {
                warn!(frame = %id, "Cancelled before fusing frame");
                return Err(FusionError::Cancelled);
            }

            let _span = tracing::debug_span!("fuse_frame", frame = %id).entered();
            let fusion = with_frame(container, id, |frame| {
                self.check_dimensions(reference_size, frame)?;
                let candidate = deinterleave(frame, profile, true)?;
                accumulator.add_frame(&candidate, &self.flow, || tracker.next_fused_channel())
            })?;

            fused.push(FusedFrame {
                id: id.clone(),
                fusion,
            });
        }

        let merged = accumulator.finish(&FinishParams {
            black_level: profile.black_level,
            white_level: profile.white_level,
            denoise_aggressiveness: settings.spatial_denoise_aggressiveness,
        })?;

        Ok((merged, fused))
    }

    /// Runs the whole burst, writing the JPEG to `output` and, when given, the merged
    /// Bayer TIFF to `raw_output`. Failures are also reported to `progress`.
    #[instrument(skip_all)]
    pub fn process(
        &self,
        container: &dyn FrameContainer,
        output: &mut dyn Write,
        raw_output: Option<&mut dyn Write>,
        progress: &dyn ProgressSink,
    ) -> Result<BurstReport> {
        info!("Starting burst processing");

        let result = self.run(container, output, raw_output, progress);
        if let Err(e) = &result {
            progress.on_error(&e.to_string());
        }
        result
    }

    fn run(
        &self,
        container: &dyn FrameContainer,
        output: &mut dyn Write,
        raw_output: Option<&mut dyn Write>,
        progress: &dyn ProgressSink,
    ) -> Result<BurstReport> {
        let mut timings = PipelineTimings::new();
        let profile = container.camera_profile();

        let selection = {
            let _span = tracing::info_span!("select_frames").entered();
            timings.measure("select_frames", || self.select_frames(container))?
        };

        let mut tracker = ProgressTracker::new(progress, selection.frame_count(), 0);

        let (settings, reference, reference_size) = {
            let _span = tracing::info_span!("load_reference", frame = %selection.reference).entered();
            with_frame(container, &selection.reference, |frame| {
                let settings = timings.measure("auto_settings", || self.resolve_settings(container, frame))?;
                let reference = timings.measure("deinterleave", || deinterleave(frame, profile, true))?;
                Ok((settings, reference, (frame.width, frame.height)))
            })?
        };

        let (merged, fused) = {
            let _span = tracing::info_span!("fuse", frames = selection.frame_count()).entered();
            timings.measure("fuse", || {
                self.fuse(container, &selection, reference, reference_size, &settings, &mut tracker)
            })?
        };
        tracker.denoise_completed();

        let raw_tiff = if raw_output.is_some() {
            let _span = tracing::info_span!("encode_raw").entered();
            let mosaic = merged.to_rggb_mosaic(profile.sensor_arrangement);
            let mut buffer = Vec::new();
            timings.measure("encode_raw", || {
                BayerTiffWriter::new(self.config.raw_compression).write_mosaic(&mosaic, &mut buffer)
            })?;
            Some(buffer)
        } else {
            None
        };

        let image = {
            let _span = tracing::info_span!("tone_map").entered();
            timings.measure("tone_map", || self.tone_mapper.tone_map(&merged, profile, &settings))?
        };
        tracker.post_process_completed();

        let mut jpeg = Vec::new();
        {
            let _span = tracing::info_span!("encode_jpeg", quality = settings.jpeg_quality).entered();
            timings.measure("encode_jpeg", || JpegWriter.write_image(&image, settings.jpeg_quality, &mut jpeg))?;
        }

        // Nothing reaches the sinks until every stage has succeeded
        timings.measure("write_output", || -> Result<()> {
            output.write_all(&jpeg)?;
            if let (Some(raw_output), Some(raw_tiff)) = (raw_output, &raw_tiff) {
                raw_output.write_all(raw_tiff)?;
            }
            Ok(())
        })?;
        tracker.image_saved();

        timings.log_summary();
        info!(
            width = image.width(),
            height = image.height(),
            frames = merged.frame_count,
            "Burst processing complete"
        );

        Ok(BurstReport {
            selection,
            fused,
            noise_sigma: merged.noise_sigma,
            settings,
            width: image.width(),
            height: image.height(),
            timings,
        })
    }

    /// Processes the burst described by a manifest file.
    #[instrument(skip(self, manifest_path, output_path, raw_output_path, progress))]
    pub fn process_file<P1: AsRef<Path>, P2: AsRef<Path>>(
        &self,
        manifest_path: P1,
        output_path: P2,
        raw_output_path: Option<&Path>,
        progress: &dyn ProgressSink,
    ) -> Result<BurstReport> {
        let manifest_path = manifest_path.as_ref();
        let output_path = output_path.as_ref();

        info!(
            manifest = %manifest_path.display(),
            output = %output_path.display(),
            "Processing burst"
        );

        let container = {
            let _span = tracing::info_span!("open_manifest").entered();
            ManifestContainer::open(manifest_path).inspect_err(|e| progress.on_error(&e.to_string()))?
        };

        self.process_into_files(&container, output_path, raw_output_path, progress)
    }

    /// Runs the burst in memory and creates the output files only once it has succeeded.
    pub fn process_into_files(
        &self,
        container: &dyn FrameContainer,
        output_path: &Path,
        raw_output_path: Option<&Path>,
        progress: &dyn ProgressSink,
    ) -> Result<BurstReport> {
        let mut jpeg = Vec::new();
        let mut raw_tiff = Vec::new();
        let report = self.process(
            container,
            &mut jpeg,
            raw_output_path.is_some().then_some(&mut raw_tiff as &mut dyn Write),
            progress,
        )?;

        let _span = tracing::info_span!("write_output_files").entered();
        write_file(output_path, &jpeg).inspect_err(|e| progress.on_error(&e.to_string()))?;
        if let Some(raw_output_path) = raw_output_path {
            write_file(raw_output_path, &raw_tiff).inspect_err(|e| progress.on_error(&e.to_string()))?;
        }

        Ok(report)
    }
}

/// Loads `id`, runs `f` on it and releases the frame whether or not `f` succeeded.
fn with_frame<T>(
    container: &dyn FrameContainer,
    id: &str,
    f: impl FnOnce(&RawFrame) -> Result<T>,
) -> Result<T> {
    let frame = container.load_frame(id)?;
    let result = f(&frame);
    drop(frame);
    container.release_frame(id);
    result
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|e| FusionError::OutputWriteError(format!("{}: {}", path.display(), e)))
}
