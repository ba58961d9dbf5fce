//! The rendering device abstraction.
//!
//! [`RenderDevice`] is the one context object every pipeline component is
//! handed explicitly. It exposes a small, handle-based command set: shader
//! stages and programs, fixed-size buffers, persistently mapped uniform
//! buffers, vertex arrays, and the per-frame bind/draw/present commands.
//!
//! Two implementations ship with the crate:
//! - [`GpuContext`](crate::GpuContext) drives a real window through wgpu.
//! - [`HeadlessDevice`](crate::HeadlessDevice) keeps everything in memory and
//!   journals every call, which is what the tests run against.
//!
//! All methods take `&self`. The model is single-threaded: one thread owns
//! the device, the frame loop and every handle.

use std::fmt;
use std::ptr::NonNull;

use crate::error::RenderError;

/// Handle to a shader stage object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderStageId(pub(crate) u32);

/// Handle to a linked program object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub(crate) u32);

/// Handle to a GPU buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

/// Handle to a vertex array object (vertex layout plus its bound buffers).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexArrayId(pub(crate) u32);

/// A programmable pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// Result of a compile or link step as reported by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageStatus {
    pub ok: bool,
    /// Driver diagnostic text. Empty on success for most drivers.
    pub log: String,
}

impl StageStatus {
    pub fn success() -> Self {
        Self {
            ok: true,
            log: String::new(),
        }
    }

    pub fn failure(log: impl Into<String>) -> Self {
        Self {
            ok: false,
            log: log.into(),
        }
    }
}

/// What a fixed-size buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
}

/// Component format of a single vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeFormat {
    Float32x2,
    Float32x3,
}

impl AttributeFormat {
    /// Size of the attribute in bytes.
    pub const fn size(self) -> u64 {
        match self {
            AttributeFormat::Float32x2 => 8,
            AttributeFormat::Float32x3 => 12,
        }
    }
}

/// One attribute of a vertex layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: AttributeFormat,
    pub offset: u64,
}

/// Description of how bytes in a vertex buffer map to shader inputs.
///
/// A single interleaved binding is assumed: every attribute lives in the
/// same buffer and the whole vertex advances by `stride` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u64,
    pub attributes: &'static [VertexAttribute],
}

impl VertexLayout {
    /// Whether the attributes are tightly packed and fill the stride exactly.
    pub fn is_tightly_packed(&self) -> bool {
        let mut expected = 0;
        for attribute in self.attributes {
            if attribute.offset != expected {
                return false;
            }
            expected += attribute.format.size();
        }
        expected == self.stride
    }
}

/// Host-visible view of a persistent buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistentMapping {
    pub ptr: NonNull<u8>,
    /// Number of bytes readable and writable from `ptr`.
    pub len: usize,
}

/// The GPU context every pipeline component is constructed against.
///
/// Object creation returns opaque handles; the caller owns each handle and is
/// responsible for the matching `delete_*` call. The crate's scoped types
/// ([`Program`](crate::Program), [`MeshGpu`](crate::MeshGpu),
/// [`UniformBuffer`](crate::UniformBuffer)) do this on drop.
///
/// # Safety
///
/// [`UniformBuffer`](crate::UniformBuffer) reads and writes through the
/// pointer returned by [`map_persistent`](Self::map_persistent) without
/// further checks. Implementors must guarantee that a returned
/// [`PersistentMapping`] addresses `len` bytes of initialized memory, valid
/// for reads and writes and not aliased by any Rust reference, from the call
/// until [`delete_buffer`](Self::delete_buffer) is called for that buffer.
pub unsafe trait RenderDevice {
    /// Submits a precompiled (SPIR-V) blob as a new shader stage object.
    ///
    /// The blob is not validated here; problems surface through
    /// [`shader_status`](Self::shader_status) after specialization.
    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        binary: &[u8],
    ) -> Result<ShaderStageId, RenderError>;

    /// Selects the entry point and specialization constants of a stage.
    fn specialize_shader(&self, id: ShaderStageId, entry_point: &str, constants: &[(u32, u32)]);

    /// Compile status of a specialized stage.
    fn shader_status(&self, id: ShaderStageId) -> StageStatus;

    fn delete_shader_stage(&self, id: ShaderStageId);

    /// Links a vertex and a fragment stage into a program object.
    ///
    /// The returned program exists even when linking failed; query
    /// [`program_status`](Self::program_status) and delete it either way.
    fn link_program(
        &self,
        vertex: ShaderStageId,
        fragment: ShaderStageId,
    ) -> Result<ProgramId, RenderError>;

    fn program_status(&self, id: ProgramId) -> StageStatus;

    fn delete_program(&self, id: ProgramId);

    /// Required alignment, in bytes, of uniform sub-range offsets.
    fn uniform_offset_alignment(&self) -> u64;

    /// Allocates a fixed-size buffer, optionally filled with `contents`.
    fn create_buffer(
        &self,
        kind: BufferKind,
        size: u64,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, RenderError>;

    /// Allocates a uniform buffer that stays mapped for its whole lifetime and
    /// binds it to `slot`. `binding_size` is the size of one bound sub-range.
    fn create_persistent_buffer(
        &self,
        slot: u32,
        size: u64,
        binding_size: u64,
    ) -> Result<BufferId, RenderError>;

    /// Returns the coherent mapping of a persistent buffer.
    ///
    /// Writes through it are visible to every draw submitted afterwards
    /// without any further call. See the trait's safety contract.
    fn map_persistent(&self, id: BufferId) -> Option<PersistentMapping>;

    fn delete_buffer(&self, id: BufferId);

    fn create_vertex_array(
        &self,
        layout: &VertexLayout,
        vertex_buffer: BufferId,
        index_buffer: BufferId,
    ) -> Result<VertexArrayId, RenderError>;

    fn delete_vertex_array(&self, id: VertexArrayId);

    /// Starts a frame that clears the color target to `clear_color` and the
    /// depth target to the far plane.
    ///
    /// Returns `Ok(false)` when the frame has to be skipped (for example the
    /// surface was reconfigured); no other frame command may follow then.
    fn begin_frame(&self, clear_color: [f32; 4]) -> Result<bool, RenderError>;

    fn bind_program(&self, id: ProgramId);

    /// Binds `[offset, offset + size)` of `buffer` to uniform `slot`.
    fn bind_uniform_range(&self, slot: u32, buffer: BufferId, offset: u64, size: u64);

    fn bind_vertex_array(&self, id: VertexArrayId);

    /// Draws an indexed triangle list over the first `index_count` indices of
    /// the bound vertex array.
    fn draw_indexed(&self, index_count: u32);

    /// Submits everything recorded since [`begin_frame`](Self::begin_frame).
    fn submit_geometry(&self) -> Result<(), RenderError>;

    /// Drops the active frame without presenting it. Called when a step
    /// between `begin_frame` and `present` fails; a no-op outside a frame.
    fn abort_frame(&self);

    /// Presents the frame and reports any device error raised while it ran.
    fn present(&self) -> Result<(), RenderError>;
}

/// Host memory standing in for a persistent mapping.
///
/// The memory is only ever touched through the raw pointer it was created
/// with, so the pointer handed out by `map_persistent` remains valid while
/// the backend reads the same bytes.
pub(crate) struct HostMapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl HostMapping {
    pub(crate) fn zeroed(len: usize) -> Self {
        let memory: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::from(memory).cast::<u8>(),
            len,
        }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn mapping(&self) -> PersistentMapping {
        PersistentMapping {
            ptr: self.ptr,
            len: self.len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Copies `size` bytes starting at `offset`, clamped to the mapping.
    pub(crate) fn read(&self, offset: usize, size: usize) -> Vec<u8> {
        let start = offset.min(self.len);
        let end = offset.saturating_add(size).min(self.len);
        // SAFETY: `start..end` lies inside the allocation owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), end - start).to_vec() }
    }

    /// Borrows the whole mapping.
    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation is `len` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: `ptr`/`len` came from `Box::leak` of a boxed slice of this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl fmt::Debug for HostMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMapping").field("len", &self.len).finish()
    }
}
