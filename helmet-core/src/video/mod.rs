//! video — FFmpeg bridge
//!
//! Decodes an input file into packed RGB24 frames and encodes annotated RGB24
//! frames back into an MP4 container (MPEG-4 Part 2, the `mp4v` fourcc).
//!
//! The pipeline only sees the [`FrameSource`] / [`FrameSink`] traits, so the
//! frame loop can be driven from memory in tests and from FFmpeg in production.

use anyhow::{Context, Result, ensure};
use fast_image_resize as fr;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Output pixel format for the encoder.
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Pixel-format conversion filter.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Target bit rate handed to the MPEG-4 encoder.
const OUTPUT_BIT_RATE: &str = "4000k";
/// MPEG-4 Part 2 stores the time-base denominator in 16 bits.
const MPEG4_MAX_TIME_BASE: i32 = 65535;

// ── Frames ───────────────────────────────────────────────────────────────────

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A black frame of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    /// A frame filled with a single colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
            pts: 0,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry {
            width: self.width,
            height: self.height,
        }
    }

    /// RGB value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    /// Copy the `width × height` rectangle starting at `(x, y)` into a new
    /// frame. The caller guarantees the rectangle lies inside the frame.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> RgbFrame {
        let src_stride = (self.width * 3) as usize;
        let dst_stride = (width * 3) as usize;
        let mut data = vec![0u8; dst_stride * height as usize];
        for row in 0..height as usize {
            let src_start = (y as usize + row) * src_stride + x as usize * 3;
            let dst_start = row * dst_stride;
            data[dst_start..dst_start + dst_stride]
                .copy_from_slice(&self.data[src_start..src_start + dst_stride]);
        }
        RgbFrame {
            data,
            width,
            height,
            pts: self.pts,
        }
    }
}

/// Width and height of a frame in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    /// Proportional resize to `target_width`; the height is truncated, so a
    /// 1920×1080 source maps to 640×360 and a 1080×1920 source to 640×1137.
    pub fn scaled_to_width(src_width: u32, src_height: u32, target_width: u32) -> Self {
        let height = (src_height as u64 * target_width as u64 / src_width.max(1) as u64) as u32;
        Self {
            width: target_width,
            height: height.max(1),
        }
    }
}

/// Average frame rate as a rational number of frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub numerator: i32,
    pub denominator: i32,
}

impl FrameRate {
    /// `None` when the container does not report a usable rate (0/0, 0/1...).
    pub fn new(numerator: i32, denominator: i32) -> Option<Self> {
        (numerator > 0 && denominator > 0).then_some(Self {
            numerator,
            denominator,
        })
    }

    pub fn whole(fps: u32) -> Self {
        Self {
            numerator: fps.max(1) as i32,
            denominator: 1,
        }
    }

    pub fn as_f64(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Closest rate whose numerator and denominator are both at most `max`.
    /// Averages such as `1016250/33883` from variable-rate recordings are
    /// approximated; rates that already fit come back unchanged.
    pub fn limited(self, max: i32) -> Self {
        if self.numerator <= max && self.denominator <= max {
            return self;
        }
        let reduced = Rational::new(self.numerator, self.denominator)
            .reduce_with_limit(max)
            .unwrap_or_else(|approx| approx);
        Self::new(reduced.numerator(), reduced.denominator())
            .unwrap_or_else(|| Self::whole(self.as_f64().round() as u32))
    }
}

// ── Seams ────────────────────────────────────────────────────────────────────

/// Sequential frame reader.
pub trait FrameSource {
    /// Next decoded frame, or `None` once the stream is exhausted.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;

    /// Reposition on the first frame.
    fn rewind(&mut self) -> Result<()>;

    /// Average frame rate reported by the container, if any.
    fn frame_rate(&self) -> Option<FrameRate>;
}

/// Incremental frame writer with a geometry fixed at creation.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()>;

    /// Flush and close the stream. Returns the number of frames written.
    fn finish(&mut self) -> Result<u64>;
}

// ── Resizing ─────────────────────────────────────────────────────────────────

/// Reusable resize context so the per-frame resize does not allocate.
pub struct FrameScaler {
    resizer: fr::Resizer,
    buf: Vec<u8>,
}

impl FrameScaler {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
            buf: Vec::new(),
        }
    }

    /// Resize `frame` to exactly `geometry`. Frames that already match are
    /// returned untouched.
    pub fn scale(&mut self, frame: RgbFrame, geometry: FrameGeometry) -> Result<RgbFrame> {
        if frame.geometry() == geometry {
            return Ok(frame);
        }

        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create resize source")?;

        let out_len = (geometry.width * geometry.height * 3) as usize;
        if self.buf.len() != out_len {
            self.buf.resize(out_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            geometry.width,
            geometry.height,
            std::mem::take(&mut self.buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("frame resize failed")?;

        // Hand the old frame buffer back for the next call.
        self.buf = frame.data;
        Ok(RgbFrame {
            data: dst.into_vec(),
            width: geometry.width,
            height: geometry.height,
            pts: frame.pts,
        })
    }
}

impl Default for FrameScaler {
    fn default() -> Self {
        Self::new()
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// FFmpeg-backed [`FrameSource`] over the best video stream of a file.
pub struct VideoReader {
    path: PathBuf,
    ictx: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    frame_rate: Option<FrameRate>,
    // Built on the first decoded frame; some decoders only learn the pixel
    // format once data arrives.
    to_rgb: Option<scaling::Context>,
    decoded: frame::Video,
    rgb: frame::Video,
    eof_sent: bool,
    frames_read: u64,
}

impl VideoReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let path = path.as_ref().to_path_buf();
        let ictx = format::input(&path)
            .with_context(|| format!("could not open input file {}", path.display()))?;

        let (stream_index, frame_rate, parameters) = {
            let stream = ictx
                .streams()
                .best(media::Type::Video)
                .context("no video stream found in input")?;
            let rate = stream.avg_frame_rate();
            (
                stream.index(),
                FrameRate::new(rate.numerator(), rate.denominator()),
                stream.parameters(),
            )
        };

        let decoder_ctx = codec::context::Context::from_parameters(parameters)
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        info!(
            path = %path.display(),
            width = decoder.width(),
            height = decoder.height(),
            fps = frame_rate.map(|r| r.as_f64()),
            "opened input video stream"
        );

        Ok(Self {
            path,
            ictx,
            decoder,
            stream_index,
            frame_rate,
            to_rgb: None,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            eof_sent: false,
            frames_read: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn convert_decoded(&mut self) -> Result<RgbFrame> {
        let width = self.decoded.width();
        let height = self.decoded.height();
        let format = self.decoded.format();

        let stale = self.to_rgb.as_ref().is_none_or(|ctx| {
            let input = ctx.input();
            input.width != width || input.height != height || input.format != format
        });
        if stale {
            self.to_rgb = Some(
                scaling::Context::get(
                    format,
                    width,
                    height,
                    format::Pixel::RGB24,
                    width,
                    height,
                    SCALE_FLAGS,
                )
                .context("failed to create to-RGB scaler")?,
            );
        }
        let to_rgb = self.to_rgb.as_mut().context("to-RGB scaler missing")?;
        to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let row_len = width as usize * 3;
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames_read as i64);
        self.frames_read += 1;
        Ok(RgbFrame {
            data,
            width,
            height,
            pts,
        })
    }
}

impl FrameSource for VideoReader {
    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let next = self
                .ictx
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("decoder send_packet")?;
                }
                Some(_) => {}
                None => {
                    self.decoder.send_eof().context("decoder send_eof")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    /// Reopens the file.
    fn rewind(&mut self) -> Result<()> {
        let path = self.path.clone();
        *self = Self::open(path)?;
        Ok(())
    }

    fn frame_rate(&self) -> Option<FrameRate> {
        self.frame_rate
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// FFmpeg-backed [`FrameSink`] writing MPEG-4 video into an MP4 container.
///
/// Dropping an unfinished writer still flushes the encoder and writes the
/// trailer, so early exits leave a playable file behind.
pub struct VideoWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    geometry: FrameGeometry,
    frames_written: u64,
    finished: bool,
}

impl VideoWriter {
    pub fn create<P: AsRef<Path>>(
        output_path: P,
        geometry: FrameGeometry,
        frame_rate: FrameRate,
    ) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let mut octx =
            format::output(&output_path).context("could not create output context")?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::MPEG4)
            .context("MPEG-4 encoder not found in this FFmpeg build")?;

        let requested = frame_rate;
        let frame_rate = requested.limited(MPEG4_MAX_TIME_BASE);
        if frame_rate != requested {
            debug!(
                from = ?requested,
                to = ?frame_rate,
                "approximated frame rate for the MPEG-4 time base"
            );
        }

        // One tick per frame.
        let time_base = Rational::new(frame_rate.denominator, frame_rate.numerator);

        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut builder = encoder_ctx
            .encoder()
            .video()
            .context("failed to create video encoder context")?;
        builder.set_width(geometry.width);
        builder.set_height(geometry.height);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(time_base);
        builder.set_frame_rate(Some(Rational::new(
            frame_rate.numerator,
            frame_rate.denominator,
        )));
        if global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("b", OUTPUT_BIT_RATE)]),
            )
            .context("failed to open MPEG-4 encoder")?;

        let stream_index = {
            let mut stream = octx
                .add_stream(encoder_codec)
                .context("failed to add output video stream")?;
            stream.set_parameters(&video_encoder);
            stream.set_time_base(time_base);
            stream.index()
        };

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            geometry.width,
            geometry.height,
            ENCODE_FORMAT,
            geometry.width,
            geometry.height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .context("failed to write output header")?;

        info!(
            path = %output_path.as_ref().display(),
            width = geometry.width,
            height = geometry.height,
            fps = frame_rate.as_f64(),
            "opened output video stream"
        );

        Ok(Self {
            octx,
            encoder: video_encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, geometry.width, geometry.height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            geometry,
            frames_written: 0,
            finished: false,
        })
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .octx
            .stream(self.stream_index)
            .context("output video stream missing")?
            .time_base();
        let mut encoded = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, stream_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

impl FrameSink for VideoWriter {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        ensure!(!self.finished, "output stream already finished");
        ensure!(
            frame.geometry() == self.geometry,
            "frame is {}x{} but the output stream is {}x{}",
            frame.width,
            frame.height,
            self.geometry.width,
            self.geometry.height
        );

        let row_len = self.geometry.width as usize * 3;
        let out_stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.geometry.height as usize {
            let dst_start = row * out_stride;
            let src_start = row * row_len;
            plane[dst_start..dst_start + row_len]
                .copy_from_slice(&frame.data[src_start..src_start + row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.frames_written as i64));

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_packets()?;

        self.frames_written += 1;
        if self.frames_written % 100 == 0 {
            debug!(frames = self.frames_written, "encoded frames");
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        if self.finished {
            return Ok(self.frames_written);
        }
        self.finished = true;

        self.encoder.send_eof().context("encoder send_eof")?;
        self.drain_packets()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;

        info!(frames = self.frames_written, "output video finalized");
        Ok(self.frames_written)
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                tracing::warn!("failed to finalize output video on drop: {e:#}");
            }
        }
    }
}

// ── Probing ──────────────────────────────────────────────────────────────────

/// Return the approximate total frame count for a video file (used for
/// progress reporting).  Falls back to 0 if the count cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 && fps.denominator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}
