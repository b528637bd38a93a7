pub mod classification;
pub mod detection;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod storage;
pub mod suppression;
pub mod video;

// Callers only need `helmet_core::Error` / `helmet_core::Result`.
pub use anyhow::Error;
pub use anyhow::Result;
