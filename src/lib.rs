//! # Workshop
//!
//! **A small real-time rendering harness.**
//!
//! Loads a pair of precompiled SPIR-V shaders and a glTF scene, uploads the
//! meshes to the GPU and draws them as a grid of instances under an orbiting
//! camera, with an egui panel for tweaking the projection.
//!
//! ## Quick Start
//!
//! ```no_run
//! use workshop::HarnessConfig;
//!
//! fn main() -> Result<(), workshop::AppError> {
//!     let mut config = HarnessConfig::default();
//!     config.scene.grid_size = 3;
//!     workshop::run(config)
//! }
//! ```
//!
//! ## Layout
//!
//! - [`RenderDevice`] is the seam between the harness and the GPU. [`GpuContext`]
//!   drives wgpu; [`HeadlessDevice`] records calls for tests.
//! - [`Program`], [`MeshGpu`] and [`UniformBuffer`] own their device objects
//!   and release them on drop.
//! - [`FrameLoop`] owns the per-frame and per-object uniform arenas and runs
//!   one frame per [`FrameLoop::tick`].

mod app;
mod camera;
mod config;
mod device;
mod error;
mod frame;
mod gpu;
pub mod headless;
mod mesh;
mod overlay;
pub mod scene;
mod shader;
mod texture;
mod uniform;

pub use app::{AppError, run};
pub use camera::{MAX_FOV_DEGREES, MIN_FOV_DEGREES, OrbitCamera};
pub use config::{
    AssetConfig, ConfigError, DEFAULT_CONFIG_FILE, HarnessConfig, SceneConfig, WindowConfig,
};
pub use device::{
    AttributeFormat, BufferId, BufferKind, PersistentMapping, ProgramId, RenderDevice, ShaderStage,
    ShaderStageId, StageStatus, VertexArrayId, VertexAttribute, VertexLayout,
};
pub use error::RenderError;
pub use frame::{
    FrameLoop, FrameParams, FrameSettings, FrameStats, LoopState, NoOverlay, Overlay,
    instance_grid,
};
pub use gpu::GpuContext;
pub use headless::HeadlessDevice;
pub use mesh::{Mesh, MeshGpu, Vertex};
pub use overlay::DebugOverlay;
pub use scene::{Scene, flatten, import_scene};
pub use shader::{Program, load_program, read_binary, spirv_words};
pub use texture::{ImageInfo, probe_image};
pub use uniform::{
    PER_FRAME_SLOT, PER_OBJECT_SLOT, PerFrameData, PerObjectData, UniformBlock, UniformBuffer,
};

// Re-export math types for convenience
pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

pub use winit::keyboard::KeyCode;
