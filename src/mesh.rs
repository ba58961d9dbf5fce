//! CPU meshes and their GPU-resident counterparts.
//!
//! - [`Vertex`]: the single vertex format every mesh uses
//! - [`Mesh`]: plain vertex and index arrays produced by scene ingestion
//! - [`MeshGpu`]: the uploaded geometry (vertex buffer, index buffer, vertex array)
//!
//! # Vertex Layout
//!
//! Each vertex occupies 32 bytes:
//!
//! | Attribute | Format    | Offset | Shader Location |
//! |-----------|-----------|--------|-----------------|
//! | position  | Float32x3 | 0      | 0               |
//! | normal    | Float32x3 | 12     | 1               |
//! | texCoord  | Float32x2 | 24     | 2               |
//!
//! The layout is exposed as [`Vertex::LAYOUT`].

use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::device::{
    AttributeFormat, BufferId, BufferKind, RenderDevice, VertexArrayId, VertexAttribute,
    VertexLayout,
};
use crate::error::RenderError;

/// A vertex with position, normal, and texture coordinates.
///
/// `#[repr(C)]` plus [`bytemuck::Pod`] lets a slice of vertices be handed to
/// the device as raw bytes without copying.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    /// Position in model space.
    pub position: [f32; 3],
    /// Surface normal. Zero when the source carried none.
    pub normal: [f32; 3],
    /// First texture coordinate set.
    pub tex_coord: [f32; 2],
}

const _: () = assert!(std::mem::size_of::<Vertex>() == 32);

impl Vertex {
    /// Attribute layout of a vertex buffer holding [`Vertex`] values.
    pub const LAYOUT: VertexLayout = VertexLayout {
        stride: std::mem::size_of::<Vertex>() as u64,
        attributes: &[
            // position
            VertexAttribute {
                location: 0,
                format: AttributeFormat::Float32x3,
                offset: 0,
            },
            // normal
            VertexAttribute {
                location: 1,
                format: AttributeFormat::Float32x3,
                offset: 12,
            },
            // texCoord
            VertexAttribute {
                location: 2,
                format: AttributeFormat::Float32x2,
                offset: 24,
            },
        ],
    };

    pub fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coord,
        }
    }
}

/// CPU-side geometry: a vertex array and a triangle-list index array.
///
/// Produced once by [`flatten`](crate::scene::flatten) and never mutated
/// afterwards.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    /// Triangle list, three indices per face.
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// GPU-resident geometry for one [`Mesh`].
///
/// Buffers are sized exactly to the source data and written once at
/// construction. Dropping a `MeshGpu` deletes the vertex array and both
/// buffers; a differently sized mesh needs a new upload.
pub struct MeshGpu<D: RenderDevice> {
    device: Rc<D>,
    vertex_array: VertexArrayId,
    vertex_buffer: BufferId,
    index_buffer: BufferId,
    num_vertices: usize,
    num_indices: usize,
}

impl<D: RenderDevice> MeshGpu<D> {
    /// Uploads a mesh into fresh vertex and index buffers.
    ///
    /// Allocation happens in the order vertex buffer, index buffer, vertex
    /// array. If any step fails, whatever was already allocated is released
    /// before the error is returned.
    pub fn upload(device: &Rc<D>, mesh: &Mesh) -> Result<Self, RenderError> {
        if mesh.vertices.is_empty() || mesh.indices.is_empty() {
            return Err(RenderError::allocation("cannot upload an empty mesh"));
        }
        if u32::try_from(mesh.indices.len()).is_err() {
            return Err(RenderError::allocation(format!(
                "mesh has {} indices, more than one draw can address",
                mesh.indices.len()
            )));
        }

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);

        let vertex_buffer = device.create_buffer(
            BufferKind::Vertex,
            vertex_bytes.len() as u64,
            Some(vertex_bytes),
        )?;

        let index_buffer = match device.create_buffer(
            BufferKind::Index,
            index_bytes.len() as u64,
            Some(index_bytes),
        ) {
            Ok(id) => id,
            Err(e) => {
                device.delete_buffer(vertex_buffer);
                return Err(e);
            }
        };

        let vertex_array =
            match device.create_vertex_array(&Vertex::LAYOUT, vertex_buffer, index_buffer) {
                Ok(id) => id,
                Err(e) => {
                    device.delete_buffer(index_buffer);
                    device.delete_buffer(vertex_buffer);
                    return Err(e);
                }
            };

        debug!(
            "uploaded mesh: {} vertices, {} indices",
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok(Self {
            device: Rc::clone(device),
            vertex_array,
            vertex_buffer,
            index_buffer,
            num_vertices: mesh.vertices.len(),
            num_indices: mesh.indices.len(),
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    pub fn num_indices(&self) -> usize {
        self.num_indices
    }

    pub fn vertex_array(&self) -> VertexArrayId {
        self.vertex_array
    }

    pub fn vertex_buffer(&self) -> BufferId {
        self.vertex_buffer
    }

    pub fn index_buffer(&self) -> BufferId {
        self.index_buffer
    }

    /// Binds the vertex array and draws the full index range.
    pub fn draw(&self) {
        self.device.bind_vertex_array(self.vertex_array);
        // Checked against u32 at upload.
        self.device.draw_indexed(self.num_indices as u32);
    }
}

impl<D: RenderDevice> Drop for MeshGpu<D> {
    fn drop(&mut self) {
        self.device.delete_vertex_array(self.vertex_array);
        self.device.delete_buffer(self.index_buffer);
        self.device.delete_buffer(self.vertex_buffer);
    }
}

impl<D: RenderDevice> fmt::Debug for MeshGpu<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshGpu")
            .field("vertex_array", &self.vertex_array)
            .field("num_vertices", &self.num_vertices)
            .field("num_indices", &self.num_indices)
            .finish()
    }
}
