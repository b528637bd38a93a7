use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helmet_core::{
    classification::ChannelOrder,
    pipeline::{HelmetPipeline, InferenceService, ModelPaths, PipelineSettings},
    rendering::Annotator,
    runtime::configure_ort_dylib,
    storage::output_name,
    video::{FrameGeometry, FrameSource, VideoReader, total_frames},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "helmet-watch",
    version,
    about = "Annotate riders with helmet / no-helmet labels in a video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on a local file and write `output_<name>`.
    Detect {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Directory the annotated video is written to
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Rider detector ONNX model path
        #[arg(long, env = "DETECTOR_MODEL", default_value = "models/yolov3-custom.onnx")]
        detector: PathBuf,

        /// Detector manifest (input size, class names, rider class)
        #[arg(long, env = "DETECTOR_CONFIG", default_value = "models/yolov3-custom.json")]
        detector_config: PathBuf,

        /// Helmet classifier ONNX model path
        #[arg(long, env = "CLASSIFIER_MODEL", default_value = "models/helmet-nohelmet.onnx")]
        classifier: PathBuf,

        /// TrueType/OpenType font for label text
        #[arg(long, env = "LABEL_FONT")]
        font: Option<PathBuf>,

        /// Channel order the classifier was trained on (bgr | rgb)
        #[arg(long, env = "CLASSIFIER_CHANNEL_ORDER", default_value = "bgr")]
        channel_order: ChannelOrder,
    },

    /// Print frame count, frame rate and output geometry of a video.
    Probe {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            input,
            output_dir,
            detector,
            detector_config,
            classifier,
            font,
            channel_order,
        } => {
            let models = ModelPaths {
                detector,
                detector_config,
                classifier,
                channel_order,
            };
            cmd_detect(&input, &output_dir, &models, font.as_deref())
        }
        Commands::Probe { input } => cmd_probe(&input),
    }
}

// ── detect ────────────────────────────────────────────────────────────────────

fn cmd_detect(
    input: &Path,
    output_dir: &Path,
    models: &ModelPaths,
    font: Option<&Path>,
) -> Result<()> {
    configure_ort_dylib();

    let file_name = input
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("input has no usable file name: {}", input.display()))?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let output = output_dir.join(output_name(file_name));

    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());

    let mut settings = PipelineSettings::default();
    let (inference, manifest) = InferenceService::load(models, settings.confidence_threshold)?;
    settings.rider_class_id = manifest.rider_class_id;

    let annotator = match font {
        Some(path) => Annotator::with_font_file(path)?,
        None => {
            warn!("no label font configured; drawing colour swatches instead of text");
            Annotator::new()
        }
    };

    let pb = progress(total_frames(input));
    let pb2 = pb.clone();
    let pipeline = HelmetPipeline::new(Arc::new(inference), Arc::new(annotator), settings)
        .with_progress(Arc::new(move |frames| pb2.set_position(frames)));

    match pipeline.process_file(input, &output)? {
        Some(summary) => {
            pb.finish_with_message("Done.");
            info!(
                frames = summary.frames_written,
                riders = summary.riders_classified,
                helmets = summary.helmets,
                no_helmets = summary.no_helmets,
                "wrote {}",
                output.display()
            );
        }
        None => {
            pb.abandon_with_message("Unreadable video.");
            warn!("{} has no decodable frames; nothing written", input.display());
        }
    }
    Ok(())
}

// ── probe ─────────────────────────────────────────────────────────────────────

fn cmd_probe(input: &Path) -> Result<()> {
    let mut reader = VideoReader::open(input)?;
    let first = reader
        .read_frame()
        .context("failed to decode first frame")?
        .context("video has no frames")?;
    let geometry = FrameGeometry::scaled_to_width(
        first.width,
        first.height,
        PipelineSettings::default().target_width,
    );

    println!("file     : {}", input.display());
    println!("frames   : {}", total_frames(input));
    println!("source   : {}x{}", first.width, first.height);
    println!("output   : {}x{}", geometry.width, geometry.height);
    match reader.frame_rate() {
        Some(rate) => println!("fps      : {:.3}", rate.as_f64()),
        None => println!("fps      : unknown"),
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress(total: u64) -> ProgressBar {
    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {pos} frames [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        pb
    };
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
