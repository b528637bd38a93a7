//! ONNX Runtime plumbing shared by both models.

use anyhow::{Context, Result};
use ort::execution_providers as ep;
use ort::session::Session;
use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const ORT_LIBRARY: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIBRARY: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIBRARY: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<library> near current exe/cwd
/// 3) the platform's usual system library directories
///
/// Must run before the first session is built.
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    for candidate in ort_candidates() {
        if candidate.is_file() {
            // SAFETY: called once at startup before any ORT session exists and
            // before worker threads are spawned, so no concurrent env access.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
            return;
        }
    }

    tracing::warn!(
        library = ORT_LIBRARY,
        "could not locate the ONNX Runtime shared library; set ORT_DYLIB_PATH"
    );
}

fn ort_candidates() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIBRARY));
        candidates.push(root.join("models").join(ORT_LIBRARY));
    }

    for system_dir in ["/usr/local/lib", "/usr/lib", "/opt/homebrew/lib"] {
        candidates.push(Path::new(system_dir).join(ORT_LIBRARY));
    }
    candidates
}

/// Single-threaded CPU session; the service runs one inference at a time.
pub(crate) fn build_ort_session(model_path: &Path, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder = builder
        .with_execution_providers([ep::CPUExecutionProvider::default().build()])
        .context("failed to register execution providers")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("{load_error}: {}", model_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_cover_models_dir_and_system_paths() {
        let candidates = ort_candidates();
        assert!(candidates
            .iter()
            .any(|c| c.ends_with(Path::new("models").join(ORT_LIBRARY))));
        assert!(candidates
            .iter()
            .any(|c| c == &Path::new("/usr/lib").join(ORT_LIBRARY)));
    }
}
