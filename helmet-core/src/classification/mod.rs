//! classification — helmet / no-helmet decision on a head-region crop
//!
//! The classifier is an ONNX export of a small Keras CNN that takes a 50×50
//! patch in NHWC layout with values in [0, 1]. Its output is either a score
//! per class or a single sigmoid scalar.

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use image::Rgb;
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::detection::{arg_max, BBox};
use crate::runtime::build_ort_session;
use crate::video::RgbFrame;

/// Side of the square classifier input patch.
pub const PATCH_SIZE: u32 = 50;
/// Cut-off for single-scalar classifier outputs.
const SCALAR_THRESHOLD: f32 = 0.5;
/// The helmet is searched in the top `1 / HEAD_STRIP_DIVISOR` of a rider box.
/// Tied to how the shipped detector frames riders.
const HEAD_STRIP_DIVISOR: i32 = 4;

// ── Labels ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HelmetLabel {
    Helmet,
    NoHelmet,
}

impl HelmetLabel {
    /// Class 0 is "Helmet"; every other class index means "No Helmet".
    pub fn from_class(class_id: usize) -> Self {
        if class_id == 0 {
            HelmetLabel::Helmet
        } else {
            HelmetLabel::NoHelmet
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            HelmetLabel::Helmet => "Helmet",
            HelmetLabel::NoHelmet => "No Helmet",
        }
    }

    /// Annotation colour (RGB): green for Helmet, red for No Helmet.
    pub fn color(&self) -> Rgb<u8> {
        match self {
            HelmetLabel::Helmet => Rgb([0, 255, 0]),
            HelmetLabel::NoHelmet => Rgb([255, 0, 0]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub label: HelmetLabel,
    /// Winning class score, or the sigmoid value for scalar models.
    pub confidence: f32,
}

/// Map raw classifier scores to a label: arg-max for multi-class outputs,
/// `> 0.5` → class 1 for a single scalar.
pub fn decide_label(scores: &[f32]) -> Result<ClassificationResult> {
    match scores {
        [] => bail!("classifier returned an empty output"),
        [scalar] => {
            let class_id = usize::from(*scalar > SCALAR_THRESHOLD);
            Ok(ClassificationResult {
                label: HelmetLabel::from_class(class_id),
                confidence: *scalar,
            })
        }
        many => {
            let (class_id, confidence) =
                arg_max(many).context("classifier returned no scores")?;
            Ok(ClassificationResult {
                label: HelmetLabel::from_class(class_id),
                confidence,
            })
        }
    }
}

// ── Crop region ──────────────────────────────────────────────────────────────

/// Pixel rectangle inside a frame, guaranteed non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Upper quarter-height strip of `bbox`, clamped to the frame.
///
/// Returns `None` when nothing of the strip lies inside the frame; the
/// classifier must not be called in that case.
pub fn head_region(bbox: &BBox, frame_width: u32, frame_height: u32) -> Option<CropRect> {
    let x0 = bbox.x.max(0) as i64;
    let y0 = bbox.y.max(0) as i64;
    let x1 = (bbox.right() as i64).min(frame_width as i64);
    let y1 = (bbox.y as i64 + bbox.h.div_euclid(HEAD_STRIP_DIVISOR) as i64)
        .min(frame_height as i64);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(CropRect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

// ── Classifier seam ──────────────────────────────────────────────────────────

/// Labels a cropped patch.
pub trait RegionClassifier: Send {
    fn classify(&mut self, crop: &RgbFrame) -> Result<ClassificationResult>;
}

/// Channel order the classifier was trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// OpenCV's native order; what a model trained on `cv2.imread` data expects.
    #[default]
    Bgr,
    Rgb,
}

impl FromStr for ChannelOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bgr" => Ok(ChannelOrder::Bgr),
            "rgb" => Ok(ChannelOrder::Rgb),
            other => bail!("unknown channel order '{other}' (expected 'bgr' or 'rgb')"),
        }
    }
}

/// Wraps the helmet CNN ONNX session.
pub struct HelmetClassifier {
    session: Session,
    input_name: String,
    channel_order: ChannelOrder,
    resizer: fr::Resizer,
    patch_buf: Vec<u8>,
}

impl HelmetClassifier {
    pub fn load<P: AsRef<Path>>(model_path: P, channel_order: ChannelOrder) -> Result<Self> {
        let session =
            build_ort_session(model_path.as_ref(), "failed to load classifier ONNX model")?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("classifier model declares no inputs")?;
        tracing::debug!(%input_name, ?channel_order, "classifier loaded");

        Ok(Self {
            session,
            input_name,
            channel_order,
            resizer: fr::Resizer::new(),
            patch_buf: vec![0u8; (PATCH_SIZE * PATCH_SIZE * 3) as usize],
        })
    }

    fn preprocess(&mut self, crop: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(crop.width, crop.height, &crop.data, fr::PixelType::U8x3)
                .context("failed to create classifier resize source")?;
        let mut dst = fr::images::Image::from_vec_u8(
            PATCH_SIZE,
            PATCH_SIZE,
            std::mem::take(&mut self.patch_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create classifier resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("classifier patch resize failed")?;
        self.patch_buf = dst.into_vec();

        let tensor_data = patch_to_nhwc(&self.patch_buf, self.channel_order);
        let shape = [1usize, PATCH_SIZE as usize, PATCH_SIZE as usize, 3];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create classifier input tensor")?
            .into_dyn())
    }
}

impl RegionClassifier for HelmetClassifier {
    fn classify(&mut self, crop: &RgbFrame) -> Result<ClassificationResult> {
        let input = self.preprocess(crop)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("classifier inference failed")?;

        let first = outputs
            .iter()
            .next()
            .context("classifier produced no outputs")?
            .1;
        let (_shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract classifier output tensor")?;

        decide_label(data)
    }
}

/// Packed RGB24 bytes → NHWC floats in [0, 1], channel order as requested.
fn patch_to_nhwc(rgb: &[u8], order: ChannelOrder) -> Vec<f32> {
    let mut out = Vec::with_capacity(rgb.len());
    for px in rgb.chunks_exact(3) {
        let [r, g, b] = [px[0], px[1], px[2]].map(|v| v as f32 / 255.0);
        match order {
            ChannelOrder::Bgr => out.extend_from_slice(&[b, g, r]),
            ChannelOrder::Rgb => out.extend_from_slice(&[r, g, b]),
        }
    }
    out
}
