//! rendering — draw classified rider boxes onto a frame
//!
//! Each classified rider gets a cyan outline and a label above the box in
//! the label colour. Label text needs a TrueType/OpenType font; without one a
//! solid swatch in the label colour marks the box instead.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result, anyhow};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use crate::classification::HelmetLabel;
use crate::detection::BBox;
use crate::video::RgbFrame;

/// Outline colour (RGB cyan).
pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
/// Outline thickness in pixels.
pub const BOX_THICKNESS: i32 = 2;
/// Vertical gap between the label's bottom edge and the box's top edge.
pub const LABEL_GAP: i32 = 10;
/// Label text height in pixels.
const LABEL_SCALE: f32 = 18.0;
/// Fallback marker size when no font is configured.
pub const SWATCH_WIDTH: u32 = 48;
pub const SWATCH_HEIGHT: u32 = 8;

/// Draws rider annotations. Cheap to share: holds only the optional font.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Annotator without label text.
    pub fn new() -> Self {
        Self { font: None }
    }

    /// Annotator rendering label text with the font at `path`.
    pub fn with_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read label font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes).map_err(|_| {
            anyhow!("{} is not a valid TrueType/OpenType font", path.display())
        })?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Outline `bbox` and label it, mutating `frame` in place.
    pub fn annotate(&self, frame: &mut RgbFrame, bbox: &BBox, label: HelmetLabel) {
        let expected = (frame.width * frame.height * 3) as usize;
        if frame.data.len() != expected {
            tracing::warn!(
                len = frame.data.len(),
                expected,
                "frame buffer does not match its geometry; skipping annotation"
            );
            return;
        }

        // Borrow the frame's buffer; it is handed back below.
        let Some(mut img): Option<RgbImage> =
            ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
        else {
            return;
        };

        self.draw_label(&mut img, bbox, label);
        draw_outline(&mut img, bbox);

        frame.data = img.into_raw();
    }

    fn draw_label(&self, img: &mut RgbImage, bbox: &BBox, label: HelmetLabel) {
        let color = label.color();
        let span = img.width() as i32;
        let left = bbox.x.clamp(-span, span);
        match &self.font {
            Some(font) => {
                let scale = PxScale::from(LABEL_SCALE);
                let (_, text_h) = text_size(scale, font, label.text());
                let top = bbox.y.saturating_sub(LABEL_GAP + text_h as i32);
                draw_text_mut(img, color, left, top, scale, font, label.text());
            }
            None => {
                let top = bbox.y.saturating_sub(LABEL_GAP + SWATCH_HEIGHT as i32);
                let rect = Rect::at(left, top).of_size(SWATCH_WIDTH, SWATCH_HEIGHT);
                draw_filled_rect_mut(img, rect, color);
            }
        }
    }
}

/// Rectangle from `(x, y)` to `(x + w, y + h)` inclusive, thickened outward.
fn draw_outline(img: &mut RgbImage, bbox: &BBox) {
    if bbox.w < 0 || bbox.h < 0 {
        return;
    }
    // Edges far off-canvas are pulled in to just outside the border.
    let margin = i64::from(BOX_THICKNESS);
    let (width, height) = (i64::from(img.width()), i64::from(img.height()));
    let clamp_x = |v: i64| v.clamp(-margin, width + margin);
    let clamp_y = |v: i64| v.clamp(-margin, height + margin);

    for t in 0..i64::from(BOX_THICKNESS) {
        let left = clamp_x(i64::from(bbox.x) - t);
        let top = clamp_y(i64::from(bbox.y) - t);
        let right = clamp_x(i64::from(bbox.x) + i64::from(bbox.w) + t);
        let bottom = clamp_y(i64::from(bbox.y) + i64::from(bbox.h) + t);
        let rect = Rect::at(left as i32, top as i32)
            .of_size((right - left + 1) as u32, (bottom - top + 1) as u32);
        draw_hollow_rect_mut(img, rect, BOX_COLOR);
    }
}
