//! An in-memory [`RenderDevice`] that journals every call.
//!
//! `HeadlessDevice` never talks to a GPU. Buffers are plain host memory,
//! shader binaries are checked for a SPIR-V header, and each draw records a
//! snapshot of the uniform bytes that were bound when it was issued. Faults
//! can be injected to drive the error paths of the pipeline.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

use crate::device::{
    BufferId, BufferKind, HostMapping, PersistentMapping, ProgramId, RenderDevice, ShaderStage,
    ShaderStageId, StageStatus, VertexArrayId, VertexLayout,
};
use crate::error::RenderError;
use crate::shader::{SPIRV_MAGIC, spirv_words};

const DEFAULT_ALIGNMENT: u64 = 256;

/// One entry in the call journal.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceCall {
    CreateShaderStage(ShaderStage, ShaderStageId),
    SpecializeShader {
        id: ShaderStageId,
        entry_point: String,
    },
    DeleteShaderStage(ShaderStageId),
    LinkProgram(ProgramId),
    DeleteProgram(ProgramId),
    CreateBuffer(BufferKind, BufferId, u64),
    CreatePersistentBuffer {
        id: BufferId,
        slot: u32,
        size: u64,
    },
    MapPersistent(BufferId),
    DeleteBuffer(BufferId),
    CreateVertexArray(VertexArrayId),
    DeleteVertexArray(VertexArrayId),
    BeginFrame,
    BindProgram(ProgramId),
    BindUniformRange {
        slot: u32,
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    BindVertexArray(VertexArrayId),
    DrawIndexed(u32),
    SubmitGeometry,
    AbortFrame,
    Present,
}

/// A draw as the device saw it.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub program: Option<ProgramId>,
    pub vertex_array: Option<VertexArrayId>,
    pub index_count: u32,
    /// Bytes of every bound uniform range at the time of the draw, by slot.
    pub uniforms: BTreeMap<u32, Vec<u8>>,
}

/// Failures the device reports on purpose.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Stage whose compilation always fails.
    pub compile_failure: Option<ShaderStage>,
    pub link_failure: bool,
    /// Number of buffer allocations that succeed before every further one fails.
    pub fail_allocation_after: Option<usize>,
    /// `map_persistent` returns no pointer.
    pub mapping_failure: bool,
    /// `map_persistent` reports half of the buffer as mapped.
    pub short_mapping: bool,
    /// `present` reports a device error.
    pub frame_failure: bool,
}

struct StageRecord {
    stage: ShaderStage,
    words: Result<Vec<u32>, String>,
    status: StageStatus,
}

struct BufferRecord {
    kind: BufferKind,
    memory: HostMapping,
}

#[derive(Default)]
struct HeadlessState {
    next_id: u32,
    calls: Vec<DeviceCall>,
    stages: HashMap<ShaderStageId, StageRecord>,
    programs: HashMap<ProgramId, StageStatus>,
    buffers: HashMap<BufferId, BufferRecord>,
    allocations: usize,
    vertex_arrays: HashMap<VertexArrayId, (VertexLayout, BufferId, BufferId)>,
    bound_program: Option<ProgramId>,
    bound_vertex_array: Option<VertexArrayId>,
    bound_ranges: BTreeMap<u32, (BufferId, u64, u64)>,
    in_frame: bool,
    draws: Vec<DrawRecord>,
    frames_presented: u64,
}

impl HeadlessState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn allocate(&mut self, size: u64, faults: &Faults) -> Result<HostMapping, RenderError> {
        if faults
            .fail_allocation_after
            .is_some_and(|limit| self.allocations >= limit)
        {
            return Err(RenderError::allocation("injected allocation failure"));
        }
        if size == 0 {
            return Err(RenderError::allocation("zero-sized buffer"));
        }
        self.allocations += 1;
        Ok(HostMapping::zeroed(size as usize))
    }
}

/// Recording device for tests and offline runs.
pub struct HeadlessDevice {
    state: RefCell<HeadlessState>,
    faults: Faults,
    alignment: u64,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_faults(Faults::default())
    }

    pub fn with_faults(faults: Faults) -> Self {
        Self {
            state: RefCell::new(HeadlessState::default()),
            faults,
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    /// Overrides the reported uniform offset alignment.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.borrow().calls.clone()
    }

    pub fn draws(&self) -> Vec<DrawRecord> {
        self.state.borrow().draws.clone()
    }

    pub fn clear_journal(&self) {
        let mut state = self.state.borrow_mut();
        state.calls.clear();
        state.draws.clear();
    }

    pub fn frames_presented(&self) -> u64 {
        self.state.borrow().frames_presented
    }

    pub fn live_shader_stages(&self) -> usize {
        self.state.borrow().stages.len()
    }

    pub fn live_programs(&self) -> usize {
        self.state.borrow().programs.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_vertex_arrays(&self) -> usize {
        self.state.borrow().vertex_arrays.len()
    }

    /// Kind of a live buffer.
    pub fn buffer_kind(&self, id: BufferId) -> Option<BufferKind> {
        self.state.borrow().buffers.get(&id).map(|b| b.kind)
    }

    /// Copies the current contents of a live buffer.
    pub fn read_buffer(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .buffers
            .get(&id)
            .map(|b| b.memory.bytes().to_vec())
    }

    fn record(&self, call: DeviceCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

// SAFETY: mappings point into the `HostMapping` of a live buffer record,
// which is only freed when `delete_buffer` removes the record.
unsafe impl RenderDevice for HeadlessDevice {
    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        binary: &[u8],
    ) -> Result<ShaderStageId, RenderError> {
        let mut state = self.state.borrow_mut();
        let id = ShaderStageId(state.next_id());
        state.stages.insert(
            id,
            StageRecord {
                stage,
                words: spirv_words(binary),
                status: StageStatus::failure("stage has not been specialized"),
            },
        );
        state.calls.push(DeviceCall::CreateShaderStage(stage, id));
        Ok(id)
    }

    fn specialize_shader(&self, id: ShaderStageId, entry_point: &str, _constants: &[(u32, u32)]) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.stages.get_mut(&id) {
            record.status = match &record.words {
                Err(log) => StageStatus::failure(log.clone()),
                Ok(_) if self.faults.compile_failure == Some(record.stage) => {
                    StageStatus::failure(format!("injected {} compile failure", record.stage))
                }
                Ok(_) if entry_point.is_empty() => {
                    StageStatus::failure("entry point name is empty")
                }
                Ok(_) => StageStatus::success(),
            };
        }
        state.calls.push(DeviceCall::SpecializeShader {
            id,
            entry_point: entry_point.to_string(),
        });
    }

    fn shader_status(&self, id: ShaderStageId) -> StageStatus {
        self.state
            .borrow()
            .stages
            .get(&id)
            .map(|r| r.status.clone())
            .unwrap_or_else(|| StageStatus::failure("unknown shader stage"))
    }

    fn delete_shader_stage(&self, id: ShaderStageId) {
        let mut state = self.state.borrow_mut();
        state.stages.remove(&id);
        state.calls.push(DeviceCall::DeleteShaderStage(id));
    }

    fn link_program(
        &self,
        vertex: ShaderStageId,
        fragment: ShaderStageId,
    ) -> Result<ProgramId, RenderError> {
        let mut state = self.state.borrow_mut();
        let id = ProgramId(state.next_id());

        let attached_ok = |stage_id: ShaderStageId, expected: ShaderStage| {
            state
                .stages
                .get(&stage_id)
                .is_some_and(|r| r.stage == expected && r.status.ok)
        };
        let status = if !attached_ok(vertex, ShaderStage::Vertex) {
            StageStatus::failure("attached vertex stage is not compiled")
        } else if !attached_ok(fragment, ShaderStage::Fragment) {
            StageStatus::failure("attached fragment stage is not compiled")
        } else if self.faults.link_failure {
            StageStatus::failure("injected link failure")
        } else {
            StageStatus::success()
        };

        state.programs.insert(id, status);
        state.calls.push(DeviceCall::LinkProgram(id));
        Ok(id)
    }

    fn program_status(&self, id: ProgramId) -> StageStatus {
        self.state
            .borrow()
            .programs
            .get(&id)
            .cloned()
            .unwrap_or_else(|| StageStatus::failure("unknown program"))
    }

    fn delete_program(&self, id: ProgramId) {
        let mut state = self.state.borrow_mut();
        state.programs.remove(&id);
        state.calls.push(DeviceCall::DeleteProgram(id));
    }

    fn uniform_offset_alignment(&self) -> u64 {
        self.alignment
    }

    fn create_buffer(
        &self,
        kind: BufferKind,
        size: u64,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, RenderError> {
        if contents.is_some_and(|bytes| bytes.len() as u64 != size) {
            return Err(RenderError::allocation(format!(
                "{kind:?} buffer contents do not match the requested size of {size} bytes"
            )));
        }
        let mut state = self.state.borrow_mut();
        let memory = state.allocate(size, &self.faults)?;
        if let Some(bytes) = contents {
            // SAFETY: `bytes.len() == size`, the length of the fresh allocation.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    memory.as_ptr().as_ptr(),
                    bytes.len(),
                );
            }
        }
        let id = BufferId(state.next_id());
        state.buffers.insert(id, BufferRecord { kind, memory });
        state.calls.push(DeviceCall::CreateBuffer(kind, id, size));
        Ok(id)
    }

    fn create_persistent_buffer(
        &self,
        slot: u32,
        size: u64,
        _binding_size: u64,
    ) -> Result<BufferId, RenderError> {
        let mut state = self.state.borrow_mut();
        let memory = state.allocate(size, &self.faults)?;
        let id = BufferId(state.next_id());
        state.buffers.insert(
            id,
            BufferRecord {
                kind: BufferKind::Uniform,
                memory,
            },
        );
        state
            .calls
            .push(DeviceCall::CreatePersistentBuffer { id, slot, size });
        Ok(id)
    }

    fn map_persistent(&self, id: BufferId) -> Option<PersistentMapping> {
        self.record(DeviceCall::MapPersistent(id));
        if self.faults.mapping_failure {
            return None;
        }
        let mut mapping = self.state.borrow().buffers.get(&id)?.memory.mapping();
        if self.faults.short_mapping {
            mapping.len /= 2;
        }
        Some(mapping)
    }

    fn delete_buffer(&self, id: BufferId) {
        let mut state = self.state.borrow_mut();
        state.buffers.remove(&id);
        state.bound_ranges.retain(|_, (buffer, _, _)| *buffer != id);
        state.calls.push(DeviceCall::DeleteBuffer(id));
    }

    fn create_vertex_array(
        &self,
        layout: &VertexLayout,
        vertex_buffer: BufferId,
        index_buffer: BufferId,
    ) -> Result<VertexArrayId, RenderError> {
        let mut state = self.state.borrow_mut();
        if self
            .faults
            .fail_allocation_after
            .is_some_and(|limit| state.allocations >= limit)
        {
            return Err(RenderError::allocation("injected vertex array failure"));
        }
        let buffers_live = [vertex_buffer, index_buffer]
            .iter()
            .all(|b| state.buffers.contains_key(b));
        if !buffers_live {
            return Err(RenderError::allocation(
                "vertex array references a deleted buffer",
            ));
        }
        state.allocations += 1;
        let id = VertexArrayId(state.next_id());
        state
            .vertex_arrays
            .insert(id, (*layout, vertex_buffer, index_buffer));
        state.calls.push(DeviceCall::CreateVertexArray(id));
        Ok(id)
    }

    fn delete_vertex_array(&self, id: VertexArrayId) {
        let mut state = self.state.borrow_mut();
        state.vertex_arrays.remove(&id);
        if state.bound_vertex_array == Some(id) {
            state.bound_vertex_array = None;
        }
        state.calls.push(DeviceCall::DeleteVertexArray(id));
    }

    fn begin_frame(&self, _clear_color: [f32; 4]) -> Result<bool, RenderError> {
        let mut state = self.state.borrow_mut();
        state.in_frame = true;
        state.calls.push(DeviceCall::BeginFrame);
        Ok(true)
    }

    fn bind_program(&self, id: ProgramId) {
        let mut state = self.state.borrow_mut();
        state.bound_program = Some(id);
        state.calls.push(DeviceCall::BindProgram(id));
    }

    fn bind_uniform_range(&self, slot: u32, buffer: BufferId, offset: u64, size: u64) {
        let mut state = self.state.borrow_mut();
        state.bound_ranges.insert(slot, (buffer, offset, size));
        state.calls.push(DeviceCall::BindUniformRange {
            slot,
            buffer,
            offset,
            size,
        });
    }

    fn bind_vertex_array(&self, id: VertexArrayId) {
        let mut state = self.state.borrow_mut();
        state.bound_vertex_array = Some(id);
        state.calls.push(DeviceCall::BindVertexArray(id));
    }

    fn draw_indexed(&self, index_count: u32) {
        let mut state = self.state.borrow_mut();
        let uniforms = state
            .bound_ranges
            .iter()
            .filter_map(|(slot, (buffer, offset, size))| {
                state
                    .buffers
                    .get(buffer)
                    .map(|b| (*slot, b.memory.read(*offset as usize, *size as usize)))
            })
            .collect();
        let record = DrawRecord {
            program: state.bound_program,
            vertex_array: state.bound_vertex_array,
            index_count,
            uniforms,
        };
        state.draws.push(record);
        state.calls.push(DeviceCall::DrawIndexed(index_count));
    }

    fn submit_geometry(&self) -> Result<(), RenderError> {
        let mut state = self.state.borrow_mut();
        if !state.in_frame {
            return Err(RenderError::FrameError {
                message: "submit without an active frame".to_string(),
            });
        }
        state.calls.push(DeviceCall::SubmitGeometry);
        Ok(())
    }

    fn abort_frame(&self) {
        let mut state = self.state.borrow_mut();
        if state.in_frame {
            state.in_frame = false;
            state.calls.push(DeviceCall::AbortFrame);
        }
    }

    fn present(&self) -> Result<(), RenderError> {
        let mut state = self.state.borrow_mut();
        state.in_frame = false;
        state.calls.push(DeviceCall::Present);
        if self.faults.frame_failure {
            return Err(RenderError::FrameError {
                message: "injected device error".to_string(),
            });
        }
        state.frames_presented += 1;
        Ok(())
    }
}

/// The smallest blob that passes the SPIR-V header check: magic, version
/// 1.0, generator, bound and schema words.
pub fn minimal_spirv() -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_fault_trips_after_limit() {
        let device = HeadlessDevice::with_faults(Faults {
            fail_allocation_after: Some(1),
            ..Faults::default()
        });
        let first = device.create_buffer(BufferKind::Vertex, 16, None).unwrap();
        let second = device.create_buffer(BufferKind::Index, 16, None);
        assert!(matches!(second, Err(RenderError::GpuAllocationError(_))));
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(device.buffer_kind(first), Some(BufferKind::Vertex));
    }

    #[test]
    fn buffer_contents_are_copied() {
        let device = HeadlessDevice::new();
        let id = device
            .create_buffer(BufferKind::Index, 4, Some(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(device.read_buffer(id).unwrap(), vec![1, 2, 3, 4]);
        device.delete_buffer(id);
        assert!(device.read_buffer(id).is_none());
    }

    #[test]
    fn contents_of_the_wrong_size_are_rejected() {
        let device = HeadlessDevice::new();
        for size in [8, 2] {
            let result = device.create_buffer(BufferKind::Vertex, size, Some(&[1, 2, 3, 4]));
            assert!(matches!(result, Err(RenderError::GpuAllocationError(_))));
        }
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn draws_snapshot_bound_uniform_ranges() {
        let device = HeadlessDevice::new();
        let buffer = device.create_persistent_buffer(1, 512, 4).unwrap();
        let mapping = device.map_persistent(buffer).unwrap();
        assert_eq!(mapping.len, 512);
        let ptr = mapping.ptr;
        // SAFETY: the buffer is 512 bytes; writes land at offsets 0 and 256.
        unsafe {
            ptr.as_ptr().write(7);
            ptr.as_ptr().add(256).write(9);
        }

        device.bind_uniform_range(1, buffer, 256, 4);
        device.draw_indexed(3);

        let draws = device.draws();
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].uniforms[&1], vec![9, 0, 0, 0]);
        assert_eq!(draws[0].index_count, 3);
    }

    #[test]
    fn submit_requires_begun_frame() {
        let device = HeadlessDevice::new();
        assert!(device.submit_geometry().is_err());
        assert!(device.begin_frame([0.0; 4]).unwrap());
        device.submit_geometry().unwrap();
        device.present().unwrap();
        assert_eq!(device.frames_presented(), 1);
    }

    #[test]
    fn aborted_frame_is_closed() {
        let device = HeadlessDevice::new();
        device.abort_frame();
        assert!(device.calls().is_empty());

        assert!(device.begin_frame([0.0; 4]).unwrap());
        device.abort_frame();
        assert_eq!(device.calls().last(), Some(&DeviceCall::AbortFrame));
        assert!(device.submit_geometry().is_err());
        assert_eq!(device.frames_presented(), 0);
    }
}
