#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use http_body_util::BodyExt;
use tower::ServiceExt;

use helmet_core::Result;
use helmet_core::classification::{
    ChannelOrder, ClassificationResult, HelmetLabel, RegionClassifier,
};
use helmet_core::detection::{BBox, Detection, RIDER_CLASS_ID, RegionProposer};
use helmet_core::pipeline::{HelmetPipeline, InferenceService, ModelPaths, PipelineSettings};
use helmet_core::rendering::Annotator;
use helmet_core::storage::UploadStore;
use helmet_core::video::RgbFrame;
use helmet_server::config::ServerConfig;
use helmet_server::router::build_router;
use helmet_server::state::AppState;

pub const BOUNDARY: &str = "helmet-test-boundary";

/// One rider in the top-left corner of every frame.
struct OneRider;

impl RegionProposer for OneRider {
    fn propose(&mut self, _frame: &RgbFrame) -> Result<Vec<Detection>> {
        Ok(vec![Detection {
            bbox: BBox::new(40, 40, 80, 160),
            class_id: RIDER_CLASS_ID,
            confidence: 0.9,
        }])
    }
}

struct AlwaysHelmet;

impl RegionClassifier for AlwaysHelmet {
    fn classify(&mut self, _crop: &RgbFrame) -> Result<ClassificationResult> {
        Ok(ClassificationResult {
            label: HelmetLabel::Helmet,
            confidence: 0.99,
        })
    }
}

/// Build a test `ServerConfig` pointing at `upload_dir`.
pub fn test_config(upload_dir: PathBuf, max_upload_bytes: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upload_dir,
        models: ModelPaths {
            detector: PathBuf::from("unused.onnx"),
            detector_config: PathBuf::from("unused.json"),
            classifier: PathBuf::from("unused.onnx"),
            channel_order: ChannelOrder::Bgr,
        },
        label_font: None,
        max_upload_bytes,
    }
}

/// Full router over fake models, storing uploads under `config.upload_dir`.
pub fn build_test_app(config: &ServerConfig) -> Router {
    let inference = InferenceService::new(Box::new(OneRider), Box::new(AlwaysHelmet));
    let pipeline = HelmetPipeline::new(
        Arc::new(inference),
        Arc::new(Annotator::new()),
        PipelineSettings::default(),
    );
    let store = UploadStore::open(&config.upload_dir).unwrap();
    build_router(AppState::new(pipeline, store), config)
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// POST a multipart body made of `(field name, filename, bytes)` parts.
pub async fn post_multipart(
    app: Router,
    uri: &str,
    parts: &[(&str, Option<&str>, &[u8])],
) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, data) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Stored inputs (`<hex>.mp4`) and outputs (`output_*`) in `dir`.
pub fn stored_files(dir: &std::path::Path) -> (Vec<String>, Vec<String>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name().into_string().unwrap();
        if name.starts_with("output_") {
            outputs.push(name);
        } else {
            inputs.push(name);
        }
    }
    (inputs, outputs)
}
