//! detection — rider/vehicle region proposals from a YOLOv3-style detector
//!
//! The detector is an ONNX export of a Darknet YOLOv3 network. Every output
//! tensor is read as rows of `[cx, cy, w, h, objectness, class scores...]`
//! in coordinates normalised to the input frame, the layout OpenCV's region
//! layer produces.

use anyhow::{Context, Result, bail, ensure};
use fast_image_resize as fr;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::runtime::build_ort_session;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Default square network input size.
pub const DEFAULT_INPUT_SIZE: u32 = 416;
/// Proposals at or below this confidence never reach suppression.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
/// Index of the "bike" class in the shipped detector's label schema.
///
/// Only detections of this class get a helmet crop. The value is a property
/// of the pretrained weights' class ordering; swapping the detector requires
/// checking it again.
pub const RIDER_CLASS_ID: usize = 0;
/// Leading row entries before the class scores: cx, cy, w, h, objectness.
const BOX_FIELDS: usize = 5;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned box in integer pixel coordinates of the resized frame.
/// `x`/`y` may be negative when a proposal spills over the frame edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// `x + w`, saturating for boxes decoded from non-finite outputs.
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.h)
    }

    pub fn area(&self) -> i64 {
        self.w.max(0) as i64 * self.h.max(0) as i64
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x.max(other.x) as i64;
        let iy1 = self.y.max(other.y) as i64;
        let ix2 = self.right().min(other.right()) as i64;
        let iy2 = self.bottom().min(other.bottom()) as i64;
        let inter = (ix2 - ix1).max(0) * (iy2 - iy1).max(0);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

/// One region proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub confidence: f32,
}

impl Detection {
    pub fn is_rider(&self, rider_class_id: usize) -> bool {
        self.class_id == rider_class_id
    }
}

/// Produces candidate boxes for one frame.
///
/// Implementations are stateful (inference sessions reuse buffers) and are
/// not required to be `Sync`; callers serialize access.
pub trait RegionProposer: Send {
    fn propose(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>>;
}

// ── Detector configuration ───────────────────────────────────────────────────

/// Sidecar JSON describing the detector network layout.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DetectorManifest {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub class_names: Vec<String>,
    #[serde(default = "default_rider_class")]
    pub rider_class_id: usize,
}

fn default_input_size() -> u32 {
    DEFAULT_INPUT_SIZE
}

fn default_rider_class() -> usize {
    RIDER_CLASS_ID
}

impl Default for DetectorManifest {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            class_names: Vec::new(),
            rider_class_id: RIDER_CLASS_ID,
        }
    }
}

impl DetectorManifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detector config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid detector config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw).context("malformed detector JSON")?;
        ensure!(manifest.input_size > 0, "input_size must be positive");
        if !manifest.class_names.is_empty() {
            ensure!(
                manifest.rider_class_id < manifest.class_names.len(),
                "rider_class_id {} is outside the {} declared classes",
                manifest.rider_class_id,
                manifest.class_names.len()
            );
        }
        Ok(manifest)
    }

    pub fn class_name(&self, class_id: usize) -> Option<&str> {
        self.class_names.get(class_id).map(String::as_str)
    }
}

// ── Detector ─────────────────────────────────────────────────────────────────

/// Wraps the YOLOv3 ONNX session.
pub struct Detector {
    session: Session,
    input_name: String,
    manifest: DetectorManifest,
    confidence_threshold: f32,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl Detector {
    /// Load a YOLOv3 ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        manifest: DetectorManifest,
        confidence_threshold: f32,
    ) -> Result<Self> {
        let session =
            build_ort_session(model_path.as_ref(), "failed to load detector ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("detector model declares no inputs")?;
        let side = manifest.input_size;
        debug!(%input_name, side, classes = manifest.class_names.len(), "detector loaded");

        Ok(Self {
            session,
            input_name,
            manifest,
            confidence_threshold,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (side * side * 3) as usize],
        })
    }

    pub fn manifest(&self) -> &DetectorManifest {
        &self.manifest
    }

    /// Stretch to the square network input, scale to [0, 1], NCHW.
    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let side = self.manifest.input_size;
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create detector resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            side,
            side,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create detector resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("detector input resize failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        let size = (side * side) as usize;
        let mut tensor_data = vec![0f32; 3 * size];

        let (r_plane, gb_plane) = tensor_data.split_at_mut(size);
        let (g_plane, b_plane) = gb_plane.split_at_mut(size);
        rayon::join(
            || {
                r_plane
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(idx, out)| *out = raw[idx * 3] as f32 / 255.0)
            },
            || {
                rayon::join(
                    || {
                        g_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 1] as f32 / 255.0)
                    },
                    || {
                        b_plane
                            .par_iter_mut()
                            .enumerate()
                            .for_each(|(idx, out)| *out = raw[idx * 3 + 2] as f32 / 255.0)
                    },
                )
            },
        );

        let shape = [1usize, 3, side as usize, side as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn())
    }
}

impl RegionProposer for Detector {
    fn propose(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .context("detector inference failed")?;

        let mut detections = Vec::new();
        for (name, value) in outputs.iter() {
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("failed to extract detector output {name}"))?;
            let row_len = shape
                .last()
                .copied()
                .filter(|&n| n > BOX_FIELDS as i64)
                .with_context(|| format!("detector output {name} has unexpected shape {shape:?}"))?
                as usize;
            detections.extend(decode_proposals(
                data,
                row_len,
                frame.width,
                frame.height,
                self.confidence_threshold,
            )?);
        }

        debug!(proposals = detections.len(), "detector proposals above threshold");
        Ok(detections)
    }
}

// ── Post-processing ──────────────────────────────────────────────────────────

/// Turn raw detector rows into pixel-space detections.
///
/// The class is the arg-max of the class scores and its score is the
/// confidence; rows scoring at or below `confidence_threshold` are dropped.
/// Conversions truncate toward zero, so a box hanging off the left edge keeps
/// its negative `x`.
pub fn decode_proposals(
    data: &[f32],
    row_len: usize,
    frame_width: u32,
    frame_height: u32,
    confidence_threshold: f32,
) -> Result<Vec<Detection>> {
    if row_len <= BOX_FIELDS {
        bail!("detector rows need more than {BOX_FIELDS} fields, got {row_len}");
    }
    ensure!(
        data.len() % row_len == 0,
        "detector output of {} values is not a multiple of the {row_len}-value row",
        data.len()
    );

    let width = frame_width as f32;
    let height = frame_height as f32;

    Ok(data
        .par_chunks_exact(row_len)
        .filter_map(|row| {
            let (class_id, confidence) = arg_max(&row[BOX_FIELDS..])?;
            if confidence <= confidence_threshold {
                return None;
            }

            let center_x = (row[0] * width) as i32;
            let center_y = (row[1] * height) as i32;
            let w = (row[2] * width) as i32;
            let h = (row[3] * height) as i32;
            let x = (center_x as f32 - w as f32 / 2.0) as i32;
            let y = (center_y as f32 - h as f32 / 2.0) as i32;

            Some(Detection {
                bbox: BBox { x, y, w, h },
                class_id,
                confidence,
            })
        })
        .collect())
}

/// Index and value of the largest score; the first maximum wins ties.
pub(crate) fn arg_max(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((idx, score));
        }
    }
    best
}
