//! Error taxonomy for the rendering pipeline.
//!
//! Every failure in asset loading, program building, resource allocation and
//! frame submission is reported through [`RenderError`]. Startup code
//! propagates these with `?`; the binary turns them into a non-zero exit.

use std::path::PathBuf;

use crate::device::ShaderStage;

/// Errors produced by the rendering pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("asset not found: {0}")]
    AssetNotFound(PathBuf),

    #[error("asset is empty: {0}")]
    AssetEmpty(PathBuf),

    #[error("I/O error reading '{0}': {1}")]
    AssetReadError(PathBuf, #[source] std::io::Error),

    #[error("{stage} shader failed to compile: {log}")]
    ShaderCompileError { stage: ShaderStage, log: String },

    #[error("program failed to link: {log}")]
    ShaderLinkError { log: String },

    #[error("GPU allocation failed: {0}")]
    GpuAllocationError(String),

    #[error("failed to map persistent uniform buffer at slot {slot}")]
    MappingFailure { slot: u32 },

    #[error("failed to import scene: {message}")]
    SceneImportError { message: String },

    #[error("failed to decode image: {message}")]
    ImageDecodeError { message: String },

    #[error("frame submission failed: {message}")]
    FrameError { message: String },

    #[error("surface error: {message}")]
    Surface { message: String },
}

impl RenderError {
    /// Shorthand for a [`RenderError::GpuAllocationError`].
    pub fn allocation(message: impl Into<String>) -> Self {
        RenderError::GpuAllocationError(message.into())
    }
}
