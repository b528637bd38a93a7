//! Upload directory layout: inputs are `<32 hex>.mp4`, outputs are
//! `output_<input name>`, both side by side under one root.
//!
//! Nothing here ever deletes a file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Prefix prepended to an input's file name to form its output name.
pub const OUTPUT_PREFIX: &str = "output_";
/// Extension given to every stored upload, whatever the client sent.
pub const UPLOAD_EXTENSION: &str = "mp4";

/// A stored upload. Written once on intake, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedVideo {
    pub id: String,
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    /// Use `root` as the upload directory, creating it if needed.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create upload directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a fresh, collision-resistant name. Nothing is written yet.
    pub fn allocate(&self) -> UploadedVideo {
        let id = Uuid::new_v4().simple().to_string();
        let file_name = format!("{id}.{UPLOAD_EXTENSION}");
        UploadedVideo {
            path: self.root.join(&file_name),
            id,
            file_name,
        }
    }

    /// Allocate a name and write `bytes` under it.
    pub fn persist(&self, bytes: &[u8]) -> Result<UploadedVideo> {
        let upload = self.allocate();
        std::fs::write(&upload.path, bytes)
            .with_context(|| format!("failed to store upload {}", upload.path.display()))?;
        Ok(upload)
    }

    pub fn output_path_for(&self, upload: &UploadedVideo) -> PathBuf {
        self.root.join(output_name(&upload.file_name))
    }
}

pub fn output_name(input_file_name: &str) -> String {
    format!("{OUTPUT_PREFIX}{input_file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_names_are_hex_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path()).unwrap();
        let upload = store.allocate();

        assert_eq!(upload.id.len(), 32);
        assert!(upload.id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(upload.file_name, format!("{}.mp4", upload.id));
        assert_eq!(upload.path, dir.path().join(&upload.file_name));
        assert!(!upload.path.exists());
    }

    #[test]
    fn allocations_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path()).unwrap();
        let a = store.allocate();
        let b = store.allocate();
        assert_ne!(a.file_name, b.file_name);
    }

    #[test]
    fn persist_writes_bytes_and_output_sits_beside_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::open(dir.path().join("nested/uploads")).unwrap();
        let upload = store.persist(b"abc").unwrap();

        assert_eq!(std::fs::read(&upload.path).unwrap(), b"abc");
        let output = store.output_path_for(&upload);
        assert_eq!(output.parent(), upload.path.parent());
        assert_eq!(
            output.file_name().unwrap().to_str().unwrap(),
            format!("output_{}", upload.file_name)
        );
    }
}
