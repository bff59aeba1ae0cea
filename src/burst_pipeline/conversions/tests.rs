#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use image::RgbImage;
    use parking_lot::Mutex;

    use crate::burst_pipeline::common::error::{FusionError, Result};
    use crate::burst_pipeline::common::progress::ProgressSink;
    use crate::burst_pipeline::conversions::BurstProcessor;
    use crate::burst_pipeline::fusion::{BlendWeights, MergedRaw};
    use crate::burst_pipeline::measure::CpuImageMeasure;
    use crate::burst_pipeline::motion::{FlowEstimator, GrayPreview, MotionField};
    use crate::burst_pipeline::raw::{
        BAYER_CHANNELS, CameraProfile, HalfResRaw, InMemoryContainer, RawFrame, RawMetadata, deinterleave,
    };
    use crate::burst_pipeline::settings::{AutoSettingsMode, FusionConfig, PostProcessSettings};
    use crate::burst_pipeline::tonemap::{CpuPreviewRenderer, DngColorScience, ToneMapper};
    use crate::burst_pipeline::wavelet::{
        CpuWaveletKernels, FuseRequest, FusionParameters, InverseParams, WaveletKernels, WaveletPyramid,
        estimate_noise,
    };

    #[derive(Clone, Copy, Debug)]
    struct FuseCall {
        channel: usize,
        params: FusionParameters,
        reset_output: bool,
    }

    /// CPU kernels that log every call.
    #[derive(Default)]
    struct RecordingKernels {
        forward_calls: Arc<Mutex<usize>>,
        fuse_calls: Arc<Mutex<Vec<FuseCall>>>,
        inverse_calls: Arc<Mutex<Vec<InverseParams>>>,
    }

    impl WaveletKernels for RecordingKernels {
        fn forward_transform(&self, raw: &HalfResRaw, channel: usize) -> Result<WaveletPyramid> {
            *self.forward_calls.lock() += 1;
            CpuWaveletKernels.forward_transform(raw, channel)
        }

        fn fuse(&self, request: &FuseRequest<'_>, output: &mut WaveletPyramid) -> Result<()> {
            self.fuse_calls.lock().push(FuseCall {
                channel: request.channel,
                params: request.params,
                reset_output: request.reset_output,
            });
            CpuWaveletKernels.fuse(request, output)
        }

        fn inverse_transform(&self, pyramid: &WaveletPyramid, params: &InverseParams) -> Result<Vec<u16>> {
            self.inverse_calls.lock().push(*params);
            CpuWaveletKernels.inverse_transform(pyramid, params)
        }
    }

    struct ZeroFlow;

    impl FlowEstimator for ZeroFlow {
        fn estimate_flow(&self, reference: &GrayPreview, _candidate: &GrayPreview) -> Result<MotionField> {
            let (width, height) = reference.dimensions();
            Ok(MotionField::zeros(width as usize, height as usize))
        }
    }

    struct MockToneMapper {
        should_fail: bool,
        merged: Arc<Mutex<Vec<(usize, [f32; BAYER_CHANNELS])>>>,
    }

    impl MockToneMapper {
        fn new(should_fail: bool) -> Self {
            Self {
                should_fail,
                merged: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ToneMapper for MockToneMapper {
        fn tone_map(&self, merged: &MergedRaw, _profile: &CameraProfile, _settings: &PostProcessSettings) -> Result<RgbImage> {
            if self.should_fail {
                return Err(FusionError::DecodeError("Mock tone map error".to_string()));
            }
            self.merged.lock().push((merged.frame_count, merged.noise_sigma));
            Ok(RgbImage::new(8, 4))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        values: RefCell<Vec<u32>>,
        completed: RefCell<bool>,
        errors: RefCell<Vec<String>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, progress: u32) {
            self.values.borrow_mut().push(progress);
        }

        fn on_completed(&self) {
            *self.completed.borrow_mut() = true;
        }

        fn on_error(&self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
    }

    type TestProcessor = BurstProcessor<
        RecordingKernels,
        ZeroFlow,
        MockToneMapper,
        CpuPreviewRenderer,
        CpuImageMeasure,
        DngColorScience,
    >;

    fn processor(kernels: RecordingKernels, tone_mapper: MockToneMapper, config: FusionConfig) -> TestProcessor {
        BurstProcessor::with_custom(
            kernels,
            ZeroFlow,
            tone_mapper,
            CpuPreviewRenderer::new(),
            CpuImageMeasure::new(),
            DngColorScience::new(),
            config,
        )
    }

    fn noisy_values(width: usize, height: usize) -> Vec<u16> {
        (0..width * height)
            .map(|i| 200 + ((i as u32).wrapping_mul(2_654_435_761) >> 24) as u16)
            .collect()
    }

    fn frame(id: &str, width: usize, height: usize, metadata: RawMetadata) -> RawFrame {
        RawFrame::from_u16(id, width, height, &noisy_values(width, height), metadata)
    }

    /// Identical 64x64 frames `f0..fN` with `f0` as reference and supplied settings.
    fn burst(count: usize, metadata: RawMetadata) -> InMemoryContainer {
        let frames = (0..count)
            .map(|i| frame(&format!("f{}", i), 64, 64, metadata.clone()))
            .collect();
        InMemoryContainer::new(CameraProfile::default(), frames)
            .with_reference("f0")
            .with_settings(PostProcessSettings::default())
    }

    /// Per-channel noise of the reference every `burst` shares.
    fn reference_sigma() -> [f32; BAYER_CHANNELS] {
        let reference = frame("f0", 64, 64, RawMetadata::default());
        let half = deinterleave(&reference, &CameraProfile::default(), true).unwrap();
        std::array::from_fn(|c| {
            estimate_noise(CpuWaveletKernels.forward_transform(&half, c).unwrap().finest_high_high())
        })
    }

    #[test]
    fn test_successful_burst() {
        let container = burst(3, RawMetadata::default());
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let mut output = Vec::new();
        let report = pipeline.process(&container, &mut output, None, &sink).unwrap();

        assert_eq!(report.selection.reference, "f0");
        assert_eq!(report.fused.len(), 2);
        assert_eq!((report.width, report.height), (8, 4));
        assert_eq!(&output[..2], &[0xFF, 0xD8]);
        assert!(report.timings.get_step("fuse").is_some());
        assert!(sink.errors.borrow().is_empty());
    }

    #[test]
    fn test_exposure_group_filtering() {
        let frames = [0, 0, 0, 1]
            .iter()
            .enumerate()
            .map(|(i, &exposure_compensation)| {
                let metadata = RawMetadata {
                    exposure_compensation,
                    ..RawMetadata::default()
                };
                frame(&format!("f{}", i), 64, 64, metadata)
            })
            .collect();
        let container = InMemoryContainer::new(CameraProfile::default(), frames)
            .with_reference("f0")
            .with_settings(PostProcessSettings::default());

        let kernels = RecordingKernels::default();
        let inverse_calls = kernels.inverse_calls.clone();
        let pipeline = processor(kernels, MockToneMapper::new(false), FusionConfig::default());

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        assert_eq!(report.selection.candidates, vec!["f1".to_string(), "f2".to_string()]);
        assert_eq!(report.selection.excluded, vec!["f3".to_string()]);
        assert!(!container.loaded_frames().contains(&"f3".to_string()));
        assert!(inverse_calls.lock().iter().all(|params| params.frame_count == 3));
    }

    #[test]
    fn test_single_frame_uses_reference_pyramid() {
        let container = burst(1, RawMetadata::default());
        let kernels = RecordingKernels::default();
        let forward_calls = kernels.forward_calls.clone();
        let fuse_calls = kernels.fuse_calls.clone();
        let inverse_calls = kernels.inverse_calls.clone();
        let pipeline = processor(kernels, MockToneMapper::new(false), FusionConfig::default());

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        assert!(report.fused.is_empty());
        assert_eq!(*forward_calls.lock(), BAYER_CHANNELS);
        assert!(fuse_calls.lock().is_empty());

        let initial = reference_sigma();
        let inverse_calls = inverse_calls.lock();
        assert_eq!(inverse_calls.len(), BAYER_CHANNELS);
        for (c, params) in inverse_calls.iter().enumerate() {
            assert_eq!(params.frame_count, 1);
            assert_eq!(params.noise_sigma, initial[c]);
            assert!(!params.preview_mode);
        }
    }

    #[test]
    fn test_noise_sigma_scales_with_frame_count() {
        for count in 1..=4 {
            let container = burst(count, RawMetadata::default());
            let initial = reference_sigma();
            let kernels = RecordingKernels::default();
            let inverse_calls = kernels.inverse_calls.clone();
            let pipeline = processor(kernels, MockToneMapper::new(false), FusionConfig::default());

            pipeline
                .process(&container, &mut Vec::new(), None, &RecordingSink::default())
                .unwrap();

            for (c, params) in inverse_calls.lock().iter().enumerate() {
                let expected = initial[c] / (count as f32).sqrt();
                assert!(initial[c] > 0.0);
                assert!(
                    (params.noise_sigma - expected).abs() <= expected * 1e-5,
                    "frames={} channel={} got {} expected {}",
                    count,
                    c,
                    params.noise_sigma,
                    expected
                );
                assert_eq!(params.frame_count, count);
            }
        }
    }

    #[test]
    fn test_low_iso_fast_shutter_scenario() {
        let metadata = RawMetadata {
            iso: 100,
            exposure_time_ns: 1_000_000,
            ..RawMetadata::default()
        };
        let frames = (0..4)
            .map(|i| frame(&format!("f{}", i), 128, 96, metadata.clone()))
            .collect();
        let container = InMemoryContainer::new(CameraProfile::default(), frames)
            .with_reference("f0")
            .with_settings(PostProcessSettings::default());

        let kernels = RecordingKernels::default();
        let fuse_calls = kernels.fuse_calls.clone();
        let tone_mapper = MockToneMapper::new(false);
        let merged = tone_mapper.merged.clone();
        let pipeline = processor(kernels, tone_mapper, FusionConfig::default());

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        assert_eq!(report.fused.len(), 3);
        for fused in &report.fused {
            assert_eq!(fused.fusion.weights, BlendWeights::LOW_NOISE);
            assert_eq!(fused.fusion.motion_std_dev, 0.0);
        }

        let fuse_calls = fuse_calls.lock();
        assert_eq!(fuse_calls.len(), 3 * BAYER_CHANNELS);
        for (i, call) in fuse_calls.iter().enumerate() {
            assert_eq!(call.channel, i % BAYER_CHANNELS);
            assert_eq!(call.params.difference_weight, 4.0);
            assert_eq!(call.params.blend_weight, 4.0);
            // Only the first candidate starts a fresh accumulation
            assert_eq!(call.reset_output, i < BAYER_CHANNELS);
        }

        let (frame_count, sigma) = merged.lock()[0];
        assert_eq!(frame_count, 4);
        assert_eq!(sigma, report.noise_sigma);
    }

    #[test]
    fn test_empty_burst() {
        let container = InMemoryContainer::new(CameraProfile::default(), Vec::new());
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let mut output = Vec::new();
        let result = pipeline.process(&container, &mut output, None, &sink);

        assert!(matches!(result, Err(FusionError::EmptyBurst)));
        assert_eq!(*sink.errors.borrow(), vec!["No frames found".to_string()]);
        assert!(sink.values.borrow().is_empty());
        assert!(output.is_empty());
    }

    #[test]
    fn test_cancellation_between_frames() {
        let container = burst(3, RawMetadata::default());
        let sink = RecordingSink::default();
        let flag = Arc::new(AtomicBool::new(false));
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default())
            .with_cancellation(flag.clone());

        flag.store(true, Ordering::Relaxed);
        let mut output = Vec::new();
        let result = pipeline.process(&container, &mut output, None, &sink);

        assert!(matches!(result, Err(FusionError::Cancelled)));
        assert_eq!(*sink.errors.borrow(), vec!["Processing cancelled".to_string()]);
        assert_eq!(container.loaded_frames(), vec!["f0".to_string()]);
        assert!(!*sink.completed.borrow());
        assert!(output.is_empty());
    }

    #[test]
    fn test_frames_released_after_use() {
        let container = burst(3, RawMetadata::default());
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        let expected: Vec<String> = ["f0", "f1", "f2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(container.loaded_frames(), expected);
        assert_eq!(container.released_frames(), expected);
    }

    #[test]
    fn test_progress_is_monotonic_and_completes() {
        let container = burst(3, RawMetadata::default());
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        pipeline.process(&container, &mut Vec::new(), None, &sink).unwrap();

        let values = sink.values.borrow();
        // Four channel steps per frame, then denoise, post-process and save
        assert_eq!(values.len(), 3 * BAYER_CHANNELS + 3);
        assert!(values.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(values[3 * BAYER_CHANNELS - 1], 75);
        assert_eq!(&values[values.len() - 3..], &[75, 95, 100]);
        assert!(*sink.completed.borrow());
    }

    #[test]
    fn test_reference_picked_by_sharpness() {
        let flat = |id: &str| RawFrame::from_u16(id, 64, 64, &[400; 64 * 64], RawMetadata::default());
        let edges: Vec<u16> = (0..64 * 64).map(|i| if (i % 64) < 32 { 100 } else { 900 }).collect();
        let frames = vec![
            flat("f0"),
            RawFrame::from_u16("f1", 64, 64, &edges, RawMetadata::default()),
            flat("f2"),
        ];
        let container = InMemoryContainer::new(CameraProfile::default(), frames);
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let selection = pipeline.select_frames(&container).unwrap();

        assert_eq!(selection.reference, "f1");
        assert_eq!(selection.candidates, vec!["f0".to_string(), "f2".to_string()]);
        assert_eq!(container.released_frames().len(), 3);
    }

    #[test]
    fn test_limit_merge_frames() {
        // Bright exposure: the denoise table asks for two frames
        let metadata = RawMetadata {
            iso: 100,
            exposure_time_ns: 1_000_000,
            ..RawMetadata::default()
        };
        let container = burst(4, metadata);
        let config = FusionConfig::builder().limit_merge_frames(true).build();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), config);

        let selection = pipeline.select_frames(&container).unwrap();

        assert_eq!(selection.candidates, vec!["f1".to_string()]);
        assert_eq!(selection.excluded, vec!["f2".to_string(), "f3".to_string()]);
        assert_eq!(selection.frame_count(), 2);
    }

    #[test]
    fn test_tone_mapper_failure() {
        let container = burst(2, RawMetadata::default());
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(true), FusionConfig::default());

        let mut output = Vec::new();
        let mut raw_output = Vec::new();
        let result = pipeline.process(
            &container,
            &mut output,
            Some(&mut raw_output as &mut dyn std::io::Write),
            &sink,
        );

        assert!(matches!(result, Err(FusionError::DecodeError(_))));
        assert_eq!(sink.errors.borrow().len(), 1);
        assert!(output.is_empty());
        assert!(raw_output.is_empty());
        assert_eq!(sink.values.borrow().last(), Some(&75));
    }

    #[test]
    fn test_failed_run_creates_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("out.jpg");
        let raw_path = dir.path().join("out.tiff");
        let container = burst(2, RawMetadata::default());
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(true), FusionConfig::default());

        let result = pipeline.process_into_files(&container, &output_path, Some(&raw_path), &sink);

        assert!(matches!(result, Err(FusionError::DecodeError(_))));
        assert!(!output_path.exists());
        assert!(!raw_path.exists());
    }

    #[test]
    fn test_successful_run_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("out.jpg");
        let raw_path = dir.path().join("out.tiff");
        let container = burst(2, RawMetadata::default());
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        pipeline
            .process_into_files(&container, &output_path, Some(&raw_path), &RecordingSink::default())
            .unwrap();

        assert_eq!(&std::fs::read(&output_path).unwrap()[..2], &[0xFF, 0xD8]);
        assert_eq!(&std::fs::read(&raw_path).unwrap()[..4], b"II*\0");
    }

    #[test]
    fn test_weights_follow_reference_metadata() {
        let reference = RawMetadata {
            iso: 100,
            exposure_time_ns: 1_000_000,
            ..RawMetadata::default()
        };
        let candidate = RawMetadata {
            iso: 3200,
            exposure_time_ns: 50_000_000,
            ..RawMetadata::default()
        };
        let frames = (0..4)
            .map(|i| {
                let metadata = if i == 0 { reference.clone() } else { candidate.clone() };
                frame(&format!("f{}", i), 64, 64, metadata)
            })
            .collect();
        let container = InMemoryContainer::new(CameraProfile::default(), frames)
            .with_reference("f0")
            .with_settings(PostProcessSettings::default());

        let kernels = RecordingKernels::default();
        let fuse_calls = kernels.fuse_calls.clone();
        let pipeline = processor(kernels, MockToneMapper::new(false), FusionConfig::default());

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        // Candidates alone would select the static noisy weights
        assert_eq!(report.fused.len(), 3);
        for fused in &report.fused {
            assert_eq!(fused.fusion.weights, BlendWeights::LOW_NOISE);
        }
        let fuse_calls = fuse_calls.lock();
        assert_eq!(fuse_calls.len(), 3 * BAYER_CHANNELS);
        for call in fuse_calls.iter() {
            assert_eq!((call.params.difference_weight, call.params.blend_weight), (4.0, 4.0));
        }
    }

    #[test]
    fn test_raw_output_written() {
        let container = burst(2, RawMetadata::default());
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let mut output = Vec::new();
        let mut raw_output = Vec::new();
        pipeline
            .process(&container, &mut output, Some(&mut raw_output as &mut dyn std::io::Write), &RecordingSink::default())
            .unwrap();

        assert_eq!(&raw_output[..4], b"II*\0");
        assert_eq!(&output[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let frames = vec![
            frame("f0", 64, 64, RawMetadata::default()),
            frame("f1", 32, 32, RawMetadata::default()),
        ];
        let container = InMemoryContainer::new(CameraProfile::default(), frames)
            .with_reference("f0")
            .with_settings(PostProcessSettings::default());
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let result = pipeline.process(&container, &mut Vec::new(), None, &RecordingSink::default());

        assert!(matches!(
            result,
            Err(FusionError::DimensionMismatch {
                expected: (64, 64),
                got: (32, 32)
            })
        ));
        assert!(container.released_frames().contains(&"f1".to_string()));
    }

    #[test]
    fn test_auto_settings_when_none_supplied() {
        let frames = (0..2)
            .map(|i| frame(&format!("f{}", i), 64, 64, RawMetadata::default()))
            .collect();
        let container = InMemoryContainer::new(CameraProfile::default(), frames).with_reference("f0");
        let config = FusionConfig::builder().auto_settings(AutoSettingsMode::Basic).build();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), config);

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        assert!((2.0..=14.0).contains(&report.settings.shadows));
        assert!(report.settings.blacks >= 0.02);
        assert!(report.timings.get_step("auto_settings").is_some());
        // ISO 100 at 1/100 s
        assert_eq!(report.settings.spatial_denoise_aggressiveness, 1.0);
        assert_eq!(report.settings.chroma_eps, 4.0);
    }

    #[test]
    fn test_auto_settings_denoise_follows_exposure() {
        let metadata = RawMetadata {
            iso: 100,
            exposure_time_ns: 1_000_000,
            ..RawMetadata::default()
        };
        let frames = (0..2)
            .map(|i| frame(&format!("f{}", i), 64, 64, metadata.clone()))
            .collect();
        let container = InMemoryContainer::new(CameraProfile::default(), frames).with_reference("f0");
        let kernels = RecordingKernels::default();
        let inverse_calls = kernels.inverse_calls.clone();
        let pipeline = processor(kernels, MockToneMapper::new(false), FusionConfig::default());

        let report = pipeline
            .process(&container, &mut Vec::new(), None, &RecordingSink::default())
            .unwrap();

        assert_eq!(report.settings.spatial_denoise_aggressiveness, 0.0);
        assert_eq!(report.settings.chroma_eps, 2.0);
        let inverse_calls = inverse_calls.lock();
        assert_eq!(inverse_calls.len(), BAYER_CHANNELS);
        assert!(inverse_calls.iter().all(|params| params.denoise_aggressiveness == 0.0));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let pipeline = processor(RecordingKernels::default(), MockToneMapper::new(false), FusionConfig::default());

        let result = pipeline.process_file(
            dir.path().join("missing.json"),
            dir.path().join("out.jpg"),
            None,
            &sink,
        );

        assert!(matches!(result, Err(FusionError::InputReadError(_))));
        assert_eq!(sink.errors.borrow().len(), 1);
        assert!(!dir.path().join("out.jpg").exists());
    }
}
