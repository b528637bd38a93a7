use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use helmet_core::pipeline::{HelmetPipeline, InferenceService, PipelineSettings};
use helmet_core::rendering::Annotator;
use helmet_core::storage::UploadStore;
use tracing::warn;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; the models sit inside the pipeline's `InferenceService`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<HelmetPipeline>,
    pub store: Arc<UploadStore>,
}

impl AppState {
    pub fn new(pipeline: HelmetPipeline, store: UploadStore) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
        }
    }

    /// Create the upload directory and load both models. Blocking.
    pub fn load(config: &ServerConfig) -> Result<Self> {
        let store = UploadStore::open(&config.upload_dir)?;

        let mut settings = PipelineSettings::default();
        let (inference, manifest) =
            InferenceService::load(&config.models, settings.confidence_threshold)?;
        settings.rider_class_id = manifest.rider_class_id;

        let annotator = load_annotator(config.label_font.as_deref())?;
        let pipeline = HelmetPipeline::new(Arc::new(inference), Arc::new(annotator), settings);
        Ok(Self::new(pipeline, store))
    }
}

fn load_annotator(font: Option<&Path>) -> Result<Annotator> {
    match font {
        Some(path) => Annotator::with_font_file(path),
        None => {
            warn!("LABEL_FONT not set; labels are drawn as colour swatches");
            Ok(Annotator::new())
        }
    }
}
