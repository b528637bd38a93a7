use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use helmet_core::pipeline::ModelPaths;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Inputs and outputs both live here; served under `/uploads`.
    pub upload_dir: PathBuf,
    pub models: ModelPaths,
    /// Without a font, labels are drawn as colour swatches.
    pub label_font: Option<PathBuf>,
    /// Request body cap for `POST /upload`.
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                            |
    /// |----------------------------|------------------------------------|
    /// | `HOST`                     | `0.0.0.0`                          |
    /// | `PORT`                     | `5000`                             |
    /// | `UPLOAD_DIR`               | `static/uploads`                   |
    /// | `DETECTOR_MODEL`           | `<models>/yolov3-custom.onnx`      |
    /// | `DETECTOR_CONFIG`          | `<models>/yolov3-custom.json`      |
    /// | `CLASSIFIER_MODEL`         | `<models>/helmet-nohelmet.onnx`    |
    /// | `CLASSIFIER_CHANNEL_ORDER` | `bgr`                              |
    /// | `LABEL_FONT`               | unset                              |
    /// | `MAX_UPLOAD_BYTES`         | `536870912` (512 MiB)              |
    ///
    /// `<models>` is the nearest `models/` directory above the executable,
    /// else `./models`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path_or =
            |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        let models_dir = model_dir();

        let models = ModelPaths {
            detector: path_or("DETECTOR_MODEL", models_dir.join("yolov3-custom.onnx")),
            detector_config: path_or("DETECTOR_CONFIG", models_dir.join("yolov3-custom.json")),
            classifier: path_or("CLASSIFIER_MODEL", models_dir.join("helmet-nohelmet.onnx")),
            channel_order: parse_var(
                &var("CLASSIFIER_CHANNEL_ORDER", "bgr"),
                "CLASSIFIER_CHANNEL_ORDER",
            )?,
        };

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port: parse_var(&var("PORT", "5000"), "PORT")?,
            upload_dir: PathBuf::from(var("UPLOAD_DIR", "static/uploads")),
            models,
            label_font: lookup("LABEL_FONT")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            max_upload_bytes: parse_var(
                &var("MAX_UPLOAD_BYTES", "536870912"),
                "MAX_UPLOAD_BYTES",
            )?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("{key} has an invalid value '{raw}'"))
}

/// Nearest `models/` directory above the running binary, falling back to
/// `models/` relative to the working directory.
fn model_dir() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            let candidate = d.join("models");
            if candidate.is_dir() {
                return candidate;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    PathBuf::from("models")
}
