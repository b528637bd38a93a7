//! pipeline — decode → detect → suppress → crop → classify → draw → encode
//!
//! The driver is synchronous and runs one video start to finish. It has two
//! states: running while the source yields frames, done once it is exhausted
//! or unreadable. Output geometry and frame rate are fixed by the first frame.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classification::{
    ChannelOrder, ClassificationResult, HelmetClassifier, HelmetLabel, RegionClassifier,
    head_region,
};
use crate::detection::{
    BBox, DEFAULT_CONFIDENCE_THRESHOLD, Detection, Detector, DetectorManifest, RIDER_CLASS_ID,
    RegionProposer,
};
use crate::rendering::Annotator;
use crate::storage::{UploadStore, UploadedVideo};
use crate::suppression::{DEFAULT_NMS_THRESHOLD, DEFAULT_SCORE_THRESHOLD, non_max_suppression};
use crate::video::{
    FrameGeometry, FrameRate, FrameScaler, FrameSink, FrameSource, RgbFrame, VideoReader,
    VideoWriter,
};

/// Every frame is resized to this width before anything else happens.
pub const TARGET_WIDTH: u32 = 640;
/// Frame rate used when the container does not report one.
pub const FALLBACK_FPS: u32 = 20;
/// Frames between timing log lines.
const PROFILE_EVERY: u64 = 300;

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub target_width: u32,
    pub confidence_threshold: f32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub fallback_fps: u32,
    pub rider_class_id: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_width: TARGET_WIDTH,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            fallback_fps: FALLBACK_FPS,
            rider_class_id: RIDER_CLASS_ID,
        }
    }
}

/// Model artifacts consumed at startup.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub detector_config: PathBuf,
    pub classifier: PathBuf,
    pub channel_order: ChannelOrder,
}

// ── Inference service ────────────────────────────────────────────────────────

/// The two models, loaded once and shared by every run.
///
/// Thread-safety: each model sits behind its own mutex, so concurrent runs
/// serialize on every model invocation. A run holds a lock only for the
/// duration of a single call.
pub struct InferenceService {
    proposer: Mutex<Box<dyn RegionProposer>>,
    classifier: Mutex<Box<dyn RegionClassifier>>,
}

impl InferenceService {
    pub fn new(proposer: Box<dyn RegionProposer>, classifier: Box<dyn RegionClassifier>) -> Self {
        Self {
            proposer: Mutex::new(proposer),
            classifier: Mutex::new(classifier),
        }
    }

    /// Load the ONNX detector and classifier. Returns the parsed detector
    /// manifest alongside so callers can pick up its rider class.
    pub fn load(paths: &ModelPaths, confidence_threshold: f32) -> Result<(Self, DetectorManifest)> {
        let manifest = DetectorManifest::load(&paths.detector_config)?;
        let detector = Detector::load(&paths.detector, manifest.clone(), confidence_threshold)?;
        let classifier = HelmetClassifier::load(&paths.classifier, paths.channel_order)?;
        info!(
            detector = %paths.detector.display(),
            classifier = %paths.classifier.display(),
            rider_class = manifest.rider_class_id,
            "models loaded"
        );
        Ok((Self::new(Box::new(detector), Box::new(classifier)), manifest))
    }

    pub fn propose(&self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        let mut proposer = self
            .proposer
            .lock()
            .map_err(|_| anyhow!("region proposer lock poisoned"))?;
        proposer.propose(frame)
    }

    pub fn classify(&self, crop: &RgbFrame) -> Result<ClassificationResult> {
        let mut classifier = self
            .classifier
            .lock()
            .map_err(|_| anyhow!("region classifier lock poisoned"))?;
        classifier.classify(crop)
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Counters for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub width: u32,
    pub height: u32,
    pub fps_numerator: i32,
    pub fps_denominator: i32,
    pub frames_written: u64,
    pub detections_kept: u64,
    pub riders_classified: u64,
    pub empty_crops: u64,
    pub helmets: u64,
    pub no_helmets: u64,
}

impl RunSummary {
    fn new(geometry: FrameGeometry, rate: FrameRate) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            fps_numerator: rate.numerator,
            fps_denominator: rate.denominator,
            frames_written: 0,
            detections_kept: 0,
            riders_classified: 0,
            empty_crops: 0,
            helmets: 0,
            no_helmets: 0,
        }
    }

    fn record(&mut self, label: HelmetLabel) {
        self.riders_classified += 1;
        match label {
            HelmetLabel::Helmet => self.helmets += 1,
            HelmetLabel::NoHelmet => self.no_helmets += 1,
        }
    }
}

/// An annotated output stored next to its upload.
#[derive(Debug, Clone)]
pub struct ProcessedVideo {
    pub file_name: String,
    pub path: PathBuf,
    pub summary: RunSummary,
}

#[derive(Default)]
struct Profile {
    frames: u64,
    detect: Duration,
    classify: Duration,
}

impl Profile {
    fn tick(&mut self) {
        self.frames += 1;
        if self.frames % PROFILE_EVERY == 0 {
            let frames = self.frames as f64;
            info!(
                frames = self.frames,
                detect_ms = self.detect.as_secs_f64() * 1000.0 / frames,
                classify_ms = self.classify.as_secs_f64() * 1000.0 / frames,
                "pipeline timings"
            );
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Called with the running count of written frames.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

pub struct HelmetPipeline {
    inference: Arc<InferenceService>,
    annotator: Arc<Annotator>,
    settings: PipelineSettings,
    on_frame: Option<ProgressFn>,
}

impl HelmetPipeline {
    pub fn new(
        inference: Arc<InferenceService>,
        annotator: Arc<Annotator>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            inference,
            annotator,
            settings,
            on_frame: None,
        }
    }

    pub fn with_progress(mut self, on_frame: ProgressFn) -> Self {
        self.on_frame = Some(on_frame);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Process a stored upload into `output_<name>` beside it.
    ///
    /// `Ok(None)` means the upload could not be decoded and no output exists.
    pub fn process_upload(
        &self,
        upload: &UploadedVideo,
        store: &UploadStore,
    ) -> Result<Option<ProcessedVideo>> {
        let output_path = store.output_path_for(upload);
        let Some(summary) = self.process_file(&upload.path, &output_path)? else {
            return Ok(None);
        };
        let file_name = output_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .context("output path has no file name")?;
        Ok(Some(ProcessedVideo {
            file_name,
            path: output_path,
            summary,
        }))
    }

    /// Decode `input`, annotate every frame, and encode into `output`.
    pub fn process_file(&self, input: &Path, output: &Path) -> Result<Option<RunSummary>> {
        let mut source = match VideoReader::open(input) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(input = %input.display(), "cannot open video: {e:#}");
                return Ok(None);
            }
        };

        self.run(&mut source, |geometry, rate| {
            VideoWriter::create(output, geometry, rate).inspect_err(|_| {
                // A half-initialised container is not an output.
                let _ = std::fs::remove_file(output);
            })
        })
    }

    /// Drive `source` through the pipeline into the sink built by `open_sink`.
    ///
    /// The sink is opened only after the first frame decodes, so an
    /// unreadable source never produces one. Read or write failures end the
    /// stream early and keep what was written; model failures are returned
    /// after the sink is finalized.
    pub fn run<S, K, F>(&self, source: &mut S, open_sink: F) -> Result<Option<RunSummary>>
    where
        S: FrameSource,
        K: FrameSink,
        F: FnOnce(FrameGeometry, FrameRate) -> Result<K>,
    {
        let probe = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("video has no decodable frames");
                return Ok(None);
            }
            Err(e) => {
                warn!("first frame unreadable: {e:#}");
                return Ok(None);
            }
        };

        let geometry =
            FrameGeometry::scaled_to_width(probe.width, probe.height, self.settings.target_width);
        let frame_rate = source
            .frame_rate()
            .unwrap_or_else(|| FrameRate::whole(self.settings.fallback_fps));
        drop(probe);

        source.rewind().context("failed to rewind video")?;
        let mut sink = open_sink(geometry, frame_rate)?;

        info!(
            width = geometry.width,
            height = geometry.height,
            fps = frame_rate.as_f64(),
            "pipeline running"
        );

        let mut summary = RunSummary::new(geometry, frame_rate);
        let mut scaler = FrameScaler::new();
        let mut profile = Profile::default();

        let outcome: Result<()> = loop {
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => {
                    warn!(frames = summary.frames_written, "read failed, ending stream: {e:#}");
                    break Ok(());
                }
            };

            let mut frame = match scaler.scale(frame, geometry) {
                Ok(frame) => frame,
                Err(e) => break Err(e),
            };

            if let Err(e) = self.process_frame(&mut frame, &mut summary, &mut profile) {
                break Err(e);
            }

            if let Err(e) = sink.write_frame(&frame) {
                warn!(frames = summary.frames_written, "write failed, ending stream: {e:#}");
                break Ok(());
            }
            summary.frames_written += 1;
            profile.tick();
            if let Some(on_frame) = &self.on_frame {
                on_frame(summary.frames_written);
            }
        };

        let finished = sink.finish();
        outcome?;
        finished.context("failed to finalize output video")?;

        info!(
            frames = summary.frames_written,
            riders = summary.riders_classified,
            helmets = summary.helmets,
            no_helmets = summary.no_helmets,
            "pipeline done"
        );
        Ok(Some(summary))
    }

    fn process_frame(
        &self,
        frame: &mut RgbFrame,
        summary: &mut RunSummary,
        profile: &mut Profile,
    ) -> Result<()> {
        let detect_start = Instant::now();
        let detections = self.inference.propose(frame)?;
        profile.detect += detect_start.elapsed();

        let boxes: Vec<BBox> = detections.iter().map(|d| d.bbox).collect();
        let scores: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        let mut keep = non_max_suppression(
            &boxes,
            &scores,
            self.settings.score_threshold,
            self.settings.nms_threshold,
        );
        // Annotate in proposal order.
        keep.sort_unstable();
        summary.detections_kept += keep.len() as u64;

        // Classify on clean pixels first, draw afterwards, so one rider's
        // annotation never leaks into a neighbour's crop.
        let classify_start = Instant::now();
        let mut labelled: Vec<(BBox, HelmetLabel)> = Vec::new();
        for idx in keep {
            let detection = &detections[idx];
            if !detection.is_rider(self.settings.rider_class_id) {
                continue;
            }
            let Some(region) = head_region(&detection.bbox, frame.width, frame.height) else {
                debug!(bbox = ?detection.bbox, "empty head region, skipping");
                summary.empty_crops += 1;
                continue;
            };
            let crop = frame.crop(region.x, region.y, region.width, region.height);
            let result = self.inference.classify(&crop)?;
            summary.record(result.label);
            labelled.push((detection.bbox, result.label));
        }
        profile.classify += classify_start.elapsed();

        for (bbox, label) in &labelled {
            self.annotator.annotate(frame, bbox, *label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendering::{BOX_COLOR, LABEL_GAP, SWATCH_HEIGHT};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Fakes ────────────────────────────────────────────────────────────

    /// In-memory clip: `frames` copies of a grey frame.
    struct MemorySource {
        frames: Vec<RgbFrame>,
        cursor: usize,
        rate: Option<FrameRate>,
        rewinds: usize,
        fail_at: Option<usize>,
    }

    impl MemorySource {
        fn clip(count: usize, width: u32, height: u32) -> Self {
            Self {
                frames: (0..count)
                    .map(|i| {
                        let mut f = RgbFrame::filled(width, height, [90, 90, 90]);
                        f.pts = i as i64;
                        f
                    })
                    .collect(),
                cursor: 0,
                rate: Some(FrameRate::whole(25)),
                rewinds: 0,
                fail_at: None,
            }
        }
    }

    impl FrameSource for MemorySource {
        fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
            if self.fail_at == Some(self.cursor) {
                anyhow::bail!("corrupt packet");
            }
            let frame = self.frames.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(frame)
        }

        fn rewind(&mut self) -> Result<()> {
            self.cursor = 0;
            self.rewinds += 1;
            Ok(())
        }

        fn frame_rate(&self) -> Option<FrameRate> {
            self.rate
        }
    }

    #[derive(Default)]
    struct MemorySink {
        opened: Option<(FrameGeometry, FrameRate)>,
        frames: Vec<RgbFrame>,
        finished: bool,
        fail_after: Option<usize>,
    }

    impl FrameSink for &mut MemorySink {
        fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
            if self.fail_after == Some(self.frames.len()) {
                anyhow::bail!("disk full");
            }
            self.frames.push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<u64> {
            self.finished = true;
            Ok(self.frames.len() as u64)
        }
    }

    /// Returns the same proposals for every frame.
    struct FixedProposer(Vec<Detection>);

    impl RegionProposer for FixedProposer {
        fn propose(&mut self, _frame: &RgbFrame) -> Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    struct FailingProposer;

    impl RegionProposer for FailingProposer {
        fn propose(&mut self, _frame: &RgbFrame) -> Result<Vec<Detection>> {
            anyhow::bail!("session crashed")
        }
    }

    /// Always answers `label`, counting invocations.
    struct CountingClassifier {
        label: HelmetLabel,
        calls: Arc<AtomicUsize>,
    }

    impl RegionClassifier for CountingClassifier {
        fn classify(&mut self, _crop: &RgbFrame) -> Result<ClassificationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ClassificationResult {
                label: self.label,
                confidence: 0.9,
            })
        }
    }

    fn rider(x: i32, y: i32, w: i32, h: i32, confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, y, w, h),
            class_id: RIDER_CLASS_ID,
            confidence,
        }
    }

    fn pipeline(
        proposals: Vec<Detection>,
        label: HelmetLabel,
    ) -> (HelmetPipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inference = InferenceService::new(
            Box::new(FixedProposer(proposals)),
            Box::new(CountingClassifier {
                label,
                calls: Arc::clone(&calls),
            }),
        );
        (
            HelmetPipeline::new(
                Arc::new(inference),
                Arc::new(Annotator::new()),
                PipelineSettings::default(),
            ),
            calls,
        )
    }

    fn run_into(
        pipeline: &HelmetPipeline,
        source: &mut impl FrameSource,
        sink: &mut MemorySink,
    ) -> Result<Option<RunSummary>> {
        pipeline.run(source, move |geometry, rate| {
            sink.opened = Some((geometry, rate));
            Ok(sink)
        })
    }

    fn run_without_sink(
        pipeline: &HelmetPipeline,
        source: &mut impl FrameSource,
    ) -> Result<Option<RunSummary>> {
        pipeline.run::<_, &mut MemorySink, _>(source, |_, _| {
            panic!("sink opened for an unreadable source")
        })
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[test]
    fn ten_frame_clip_gets_a_box_in_every_frame() {
        let (pipeline, calls) = pipeline(vec![rider(100, 80, 120, 200, 0.9)], HelmetLabel::Helmet);
        let mut source = MemorySource::clip(10, 1280, 720);
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        let (geometry, rate) = sink.opened.unwrap();
        assert_eq!((geometry.width, geometry.height), (640, 360));
        assert_eq!(rate, FrameRate::whole(25));
        assert_eq!(source.rewinds, 1);

        assert!(sink.finished);
        assert_eq!(sink.frames.len(), 10);
        assert_eq!(summary.frames_written, 10);
        assert_eq!(summary.helmets, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let swatch_y = (80 - LABEL_GAP - SWATCH_HEIGHT as i32 / 2) as u32;
        for frame in &sink.frames {
            assert_eq!((frame.width, frame.height), (640, 360));
            assert_eq!(frame.pixel(100, 150), Some(BOX_COLOR.0));
            assert_eq!(frame.pixel(220, 150), Some(BOX_COLOR.0));
            assert_eq!(frame.pixel(160, 80), Some(BOX_COLOR.0));
            assert_eq!(frame.pixel(102, swatch_y), Some([0, 255, 0]));
            assert_eq!(frame.pixel(160, 180), Some([90, 90, 90]));
        }
    }

    #[test]
    fn progress_hook_sees_every_written_frame() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let pipeline = pipeline.with_progress(Arc::new(move |n| {
            counter.store(n as usize, Ordering::SeqCst);
        }));
        let mut source = MemorySource::clip(7, 320, 240);
        let mut sink = MemorySink::default();

        run_into(&pipeline, &mut source, &mut sink).unwrap().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn frames_without_detections_are_still_written() {
        let (pipeline, calls) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = MemorySource::clip(4, 640, 480);
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(summary.frames_written, 4);
        assert_eq!(sink.frames.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sink.frames.iter().all(|f| f.pixel(5, 5) == Some([90, 90, 90])));
    }

    #[test]
    fn empty_source_opens_no_sink() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = MemorySource::clip(0, 640, 480);
        let result = run_without_sink(&pipeline, &mut source).unwrap();

        assert!(result.is_none());
    }

    #[test]
    fn unreadable_first_frame_opens_no_sink() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = MemorySource::clip(5, 640, 480);
        source.fail_at = Some(0);
        let result = run_without_sink(&pipeline, &mut source).unwrap();

        assert!(result.is_none());
    }

    #[test]
    fn missing_frame_rate_falls_back_to_twenty() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = MemorySource::clip(2, 640, 480);
        source.rate = None;
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(sink.opened.unwrap().1, FrameRate::whole(20));
        assert_eq!((summary.fps_numerator, summary.fps_denominator), (20, 1));
    }

    #[test]
    fn corrupt_packet_ends_the_stream_early() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = CorruptAfter {
            inner: MemorySource::clip(6, 640, 480),
            good_frames_after_rewind: 3,
            rewound: false,
        };
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(summary.frames_written, 3);
        assert!(sink.finished);
    }

    /// Reads cleanly for the probe, then fails after a few frames.
    struct CorruptAfter {
        inner: MemorySource,
        good_frames_after_rewind: usize,
        rewound: bool,
    }

    impl FrameSource for CorruptAfter {
        fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
            if self.rewound && self.inner.cursor == self.good_frames_after_rewind {
                anyhow::bail!("corrupt packet");
            }
            self.inner.read_frame()
        }

        fn rewind(&mut self) -> Result<()> {
            self.rewound = true;
            self.inner.rewind()
        }

        fn frame_rate(&self) -> Option<FrameRate> {
            self.inner.frame_rate()
        }
    }

    #[test]
    fn write_error_ends_the_stream_and_finalizes() {
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);
        let mut source = MemorySource::clip(6, 640, 480);
        let mut sink = MemorySink {
            fail_after: Some(2),
            ..Default::default()
        };

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(summary.frames_written, 2);
        assert_eq!(sink.frames.len(), 2);
        assert!(sink.finished);
    }

    #[test]
    fn model_failure_is_reported_after_finalizing() {
        let inference = InferenceService::new(
            Box::new(FailingProposer),
            Box::new(CountingClassifier {
                label: HelmetLabel::Helmet,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        );
        let pipeline = HelmetPipeline::new(
            Arc::new(inference),
            Arc::new(Annotator::new()),
            PipelineSettings::default(),
        );
        let mut source = MemorySource::clip(3, 640, 480);
        let mut sink = MemorySink::default();

        let err = run_into(&pipeline, &mut source, &mut sink).unwrap_err();

        assert!(format!("{err:#}").contains("session crashed"));
        assert!(sink.finished);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn empty_crop_skips_the_classifier() {
        // Strip above the top edge: y = -80, h = 100 → y1 = -55.
        let (pipeline, calls) = pipeline(vec![rider(50, -80, 60, 100, 0.9)], HelmetLabel::NoHelmet);
        let mut source = MemorySource::clip(2, 640, 480);
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.empty_crops, 2);
        assert_eq!(summary.riders_classified, 0);
        assert_eq!(sink.frames[0].pixel(50, 10), Some([90, 90, 90]));
    }

    #[test]
    fn non_rider_classes_are_not_classified() {
        let mut other = rider(100, 100, 80, 80, 0.9);
        other.class_id = RIDER_CLASS_ID + 1;
        let (pipeline, calls) = pipeline(vec![other], HelmetLabel::Helmet);
        let mut source = MemorySource::clip(1, 640, 480);
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(summary.detections_kept, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overlapping_riders_are_classified_once() {
        let (pipeline, calls) = pipeline(
            vec![rider(100, 100, 80, 120, 0.9), rider(104, 104, 80, 120, 0.6)],
            HelmetLabel::NoHelmet,
        );
        let mut source = MemorySource::clip(1, 640, 480);
        let mut sink = MemorySink::default();

        let summary = run_into(&pipeline, &mut source, &mut sink)
            .unwrap()
            .unwrap();

        assert_eq!(summary.detections_kept, 1);
        assert_eq!(summary.no_helmets, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let swatch_y = (100 - LABEL_GAP - SWATCH_HEIGHT as i32 / 2) as u32;
        assert_eq!(sink.frames[0].pixel(102, swatch_y), Some([255, 0, 0]));
    }

    #[test]
    fn unreadable_file_produces_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path()).unwrap();
        let upload = store.persist(b"this is not a video").unwrap();
        let (pipeline, _) = pipeline(Vec::new(), HelmetLabel::Helmet);

        let result = pipeline.process_upload(&upload, &store).unwrap();

        assert!(result.is_none());
        assert!(!store.output_path_for(&upload).exists());
    }

    #[test]
    fn encoded_clip_round_trips_through_process_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path()).unwrap();
        let upload = store.allocate();
        {
            let geometry = FrameGeometry {
                width: 960,
                height: 540,
            };
            let mut writer =
                VideoWriter::create(&upload.path, geometry, FrameRate::whole(20)).unwrap();
            for _ in 0..10 {
                writer
                    .write_frame(&RgbFrame::filled(960, 540, [30, 60, 90]))
                    .unwrap();
            }
            writer.finish().unwrap();
        }
        let (pipeline, calls) = pipeline(vec![rider(60, 40, 100, 160, 0.95)], HelmetLabel::Helmet);

        let processed = pipeline.process_upload(&upload, &store).unwrap().unwrap();

        assert_eq!(processed.file_name, format!("output_{}", upload.file_name));
        assert_eq!(processed.summary.frames_written, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        let mut reader = VideoReader::open(&processed.path).unwrap();
        let mut count = 0;
        while let Some(frame) = reader.read_frame().unwrap() {
            assert_eq!((frame.width, frame.height), (640, 360));
            count += 1;
        }
        assert_eq!(count, 10);
    }
}
