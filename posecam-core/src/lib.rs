pub mod camera;
pub mod config;
pub mod estimation;
pub mod overlay;
pub mod pipeline;
pub mod pose;
pub mod runtime;
pub mod video;

// Re-export the top-level error type so callers only need `posecam_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
