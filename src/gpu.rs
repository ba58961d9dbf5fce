//! The wgpu-backed rendering device.
//!
//! [`GpuContext`] owns the surface, device and queue for one window and
//! implements [`RenderDevice`] on top of them:
//!
//! - shader stages are SPIR-V modules, compiled when they are specialized
//! - linking a program builds the render pipeline for the fixed vertex format
//! - persistent uniform buffers are host mappings copied into their GPU
//!   buffer right before geometry is submitted, so a write through the
//!   mapping is seen by every draw recorded after it; only the bytes that
//!   changed since the last submit are uploaded
//! - uniform sub-range binds become dynamic offsets into one bind group per
//!   slot
//! - frame commands are recorded and replayed into a single render pass
//!
//! Every resource-creating call and every frame run inside wgpu error
//! scopes, so failures come back as [`RenderError`] values instead of
//! reaching the uncaptured error handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::device::{
    AttributeFormat, BufferId, BufferKind, HostMapping, PersistentMapping, ProgramId,
    RenderDevice, ShaderStage, ShaderStageId, StageStatus, VertexArrayId, VertexLayout,
};
use crate::error::RenderError;
use crate::mesh::Vertex;
use crate::shader::spirv_words;
use crate::uniform::{PER_FRAME_SLOT, PER_OBJECT_SLOT};

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

struct GpuStage {
    stage: ShaderStage,
    words: Result<Vec<u32>, String>,
    entry_point: String,
    module: Option<wgpu::ShaderModule>,
    status: StageStatus,
}

struct GpuProgram {
    pipeline: Option<wgpu::RenderPipeline>,
    status: StageStatus,
}

struct PersistentBinding {
    slot: u32,
    mapping: HostMapping,
    /// Contents of the GPU buffer as of the last flush.
    flushed: Vec<u8>,
    bind_group: wgpu::BindGroup,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    persistent: Option<PersistentBinding>,
}

struct VertexArray {
    vertex_buffer: BufferId,
    index_buffer: BufferId,
}

struct DepthTarget {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

#[derive(Clone, Copy, Debug)]
enum FrameCommand {
    SetProgram(ProgramId),
    SetUniform { slot: u32, buffer: BufferId, offset: u64 },
    SetVertexArray(VertexArrayId),
    Draw(u32),
}

struct ActiveFrame {
    surface_texture: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
    encoder: wgpu::CommandEncoder,
    clear_color: [f32; 4],
    commands: Vec<FrameCommand>,
}

#[derive(Default)]
struct GpuResources {
    next_id: u32,
    stages: HashMap<ShaderStageId, GpuStage>,
    programs: HashMap<ProgramId, GpuProgram>,
    buffers: HashMap<BufferId, GpuBuffer>,
    vertex_arrays: HashMap<VertexArrayId, VertexArray>,
}

impl GpuResources {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Core GPU context for one window.
///
/// Created once at startup and shared through an `Rc` with every pipeline
/// component. All methods take `&self`; interior state lives in `RefCell`s.
pub struct GpuContext {
    /// The surface for presenting rendered frames to the window.
    pub surface: wgpu::Surface<'static>,
    /// The logical GPU device for creating resources and pipelines.
    pub device: wgpu::Device,
    /// The command queue for submitting work to the GPU.
    pub queue: wgpu::Queue,
    config: RefCell<wgpu::SurfaceConfiguration>,
    uniform_layouts: [wgpu::BindGroupLayout; 2],
    pipeline_layout: wgpu::PipelineLayout,
    depth: RefCell<DepthTarget>,
    resources: RefCell<GpuResources>,
    frame: RefCell<Option<ActiveFrame>>,
}

impl GpuContext {
    /// Creates a GPU context for `window`.
    ///
    /// Picks an adapter compatible with the window surface, creates the
    /// device and configures the surface with an sRGB format when one is
    /// available. `vsync` selects `Fifo` presentation, otherwise
    /// `AutoNoVsync`.
    pub fn new(window: Arc<Window>, vsync: bool) -> Result<Self, RenderError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| RenderError::Surface {
                message: e.to_string(),
            })?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| RenderError::Surface {
            message: format!("no suitable GPU adapter: {e}"),
        })?;

        let adapter_info = adapter.get_info();
        info!(
            "using adapter '{}' ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Workshop Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
            experimental_features: Default::default(),
        }))
        .map_err(|e| RenderError::Surface {
            message: format!("failed to create device: {e}"),
        })?;

        let surface_caps = surface.get_capabilities(&adapter);
        let Some(&first_format) = surface_caps.formats.first() else {
            return Err(RenderError::Surface {
                message: "surface reports no supported formats".to_string(),
            });
        };
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(first_format);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if vsync {
                wgpu::PresentMode::Fifo
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let uniform_layouts = [
            uniform_layout(&device, "Per-Frame Layout", PER_FRAME_SLOT),
            uniform_layout(&device, "Per-Object Layout", PER_OBJECT_SLOT),
        ];
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Workshop Pipeline Layout"),
            bind_group_layouts: &[&uniform_layouts[0], &uniform_layouts[1]],
            push_constant_ranges: &[],
        });

        let depth = create_depth_target(&device, config.width, config.height);

        Ok(Self {
            surface,
            device,
            queue,
            config: RefCell::new(config),
            uniform_layouts,
            pipeline_layout,
            depth: RefCell::new(depth),
            resources: RefCell::new(GpuResources::default()),
            frame: RefCell::new(None),
        })
    }

    /// Resize the surface and depth buffer.
    ///
    /// Ignores zero-sized dimensions (which occur while the window is
    /// minimized).
    pub fn resize(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let mut config = self.config.borrow_mut();
        config.width = width;
        config.height = height;
        self.surface.configure(&self.device, &config);
        *self.depth.borrow_mut() = create_depth_target(&self.device, width, height);
        debug!("surface resized to {}x{}", width, height);
    }

    pub fn width(&self) -> u32 {
        self.config.borrow().width
    }

    pub fn height(&self) -> u32 {
        self.config.borrow().height
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.borrow().format
    }

    /// Runs `f` against the encoder and color target of the active frame.
    ///
    /// Used by overlays that draw after geometry into the same surface
    /// texture. Returns `None` outside a frame.
    pub fn with_frame<R>(
        &self,
        f: impl FnOnce(&wgpu::Device, &wgpu::Queue, &mut wgpu::CommandEncoder, &wgpu::TextureView) -> R,
    ) -> Option<R> {
        let mut frame = self.frame.borrow_mut();
        let frame = frame.as_mut()?;
        Some(f(&self.device, &self.queue, &mut frame.encoder, &frame.view))
    }

    /// Runs `f` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }

    fn reconfigure(&self) {
        let config = self.config.borrow();
        self.surface.configure(&self.device, &config);
    }

    /// Copies the changed part of every persistent mapping into its GPU
    /// buffer.
    fn flush_persistent(&self, resources: &mut GpuResources) {
        for gpu in resources.buffers.values_mut() {
            let Some(persistent) = &mut gpu.persistent else {
                continue;
            };
            let current = persistent.mapping.bytes();
            if let Some(range) = dirty_range(&persistent.flushed, current) {
                self.queue
                    .write_buffer(&gpu.buffer, range.start as u64, &current[range.clone()]);
                persistent.flushed[range.clone()].copy_from_slice(&current[range]);
            }
        }
    }

    fn replay(&self, frame: &mut ActiveFrame, resources: &GpuResources) {
        let depth = self.depth.borrow();
        let [r, g, b, a] = frame.clear_color.map(f64::from);

        let mut pass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Geometry Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &frame.view,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let mut pipeline_ready = false;
        for command in frame.commands.drain(..) {
            match command {
                FrameCommand::SetProgram(id) => {
                    match resources.programs.get(&id).and_then(|p| p.pipeline.as_ref()) {
                        Some(pipeline) => {
                            pass.set_pipeline(pipeline);
                            pipeline_ready = true;
                        }
                        None => {
                            warn!("program {:?} has no pipeline, skipping its draws", id);
                            pipeline_ready = false;
                        }
                    }
                }
                FrameCommand::SetUniform {
                    slot,
                    buffer,
                    offset,
                } => {
                    let binding = resources
                        .buffers
                        .get(&buffer)
                        .and_then(|b| b.persistent.as_ref());
                    match (binding, u32::try_from(offset)) {
                        (Some(binding), Ok(offset)) if binding.slot == slot => {
                            pass.set_bind_group(slot, &binding.bind_group, &[offset]);
                        }
                        _ => warn!(
                            "cannot bind buffer {:?} at offset {} to slot {}",
                            buffer, offset, slot
                        ),
                    }
                }
                FrameCommand::SetVertexArray(id) => {
                    let Some(vao) = resources.vertex_arrays.get(&id) else {
                        warn!("unknown vertex array {:?}", id);
                        continue;
                    };
                    let buffers = (
                        resources.buffers.get(&vao.vertex_buffer),
                        resources.buffers.get(&vao.index_buffer),
                    );
                    if let (Some(vb), Some(ib)) = buffers {
                        pass.set_vertex_buffer(0, vb.buffer.slice(..));
                        pass.set_index_buffer(ib.buffer.slice(..), wgpu::IndexFormat::Uint32);
                    }
                }
                FrameCommand::Draw(index_count) => {
                    if pipeline_ready {
                        pass.draw_indexed(0..index_count, 0, 0..1);
                    }
                }
            }
        }
    }
}

// SAFETY: mappings point into the `HostMapping` owned by a live buffer
// record, which is only freed when `delete_buffer` removes the record.
unsafe impl RenderDevice for GpuContext {
    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        binary: &[u8],
    ) -> Result<ShaderStageId, RenderError> {
        let mut resources = self.resources.borrow_mut();
        let id = ShaderStageId(resources.next_id());
        resources.stages.insert(
            id,
            GpuStage {
                stage,
                words: spirv_words(binary),
                entry_point: String::new(),
                module: None,
                status: StageStatus::failure("stage has not been specialized"),
            },
        );
        Ok(id)
    }

    fn specialize_shader(&self, id: ShaderStageId, entry_point: &str, constants: &[(u32, u32)]) {
        if !constants.is_empty() {
            warn!(
                "ignoring {} specialization constants for {:?}",
                constants.len(),
                id
            );
        }

        let mut resources = self.resources.borrow_mut();
        let Some(stage) = resources.stages.get_mut(&id) else {
            warn!("specialize_shader on unknown stage {:?}", id);
            return;
        };
        stage.entry_point = entry_point.to_string();

        let words = match &stage.words {
            Ok(words) => words,
            Err(log) => {
                stage.status = StageStatus::failure(log.clone());
                return;
            }
        };

        let label = format!("{} shader {:?}", stage.stage, id);
        let (module, error) = self.scoped(|| {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&label),
                    source: wgpu::ShaderSource::SpirV(words.as_slice().into()),
                })
        });

        match error {
            Some(e) => stage.status = StageStatus::failure(e.to_string()),
            None => {
                stage.module = Some(module);
                stage.status = StageStatus::success();
            }
        }
    }

    fn shader_status(&self, id: ShaderStageId) -> StageStatus {
        self.resources
            .borrow()
            .stages
            .get(&id)
            .map(|s| s.status.clone())
            .unwrap_or_else(|| StageStatus::failure("unknown shader stage"))
    }

    fn delete_shader_stage(&self, id: ShaderStageId) {
        self.resources.borrow_mut().stages.remove(&id);
    }

    fn link_program(
        &self,
        vertex: ShaderStageId,
        fragment: ShaderStageId,
    ) -> Result<ProgramId, RenderError> {
        let mut guard = self.resources.borrow_mut();
        let resources = &mut *guard;
        let id = ProgramId(resources.next_id());

        let compiled = |stage_id: ShaderStageId, expected: ShaderStage| {
            resources
                .stages
                .get(&stage_id)
                .filter(|s| s.stage == expected)
                .and_then(|s| s.module.as_ref().map(|m| (m, s.entry_point.as_str())))
        };

        let program = match (
            compiled(vertex, ShaderStage::Vertex),
            compiled(fragment, ShaderStage::Fragment),
        ) {
            (Some((vs, vs_entry)), Some((fs, fs_entry))) => {
                let attributes = wgpu_attributes(&Vertex::LAYOUT);
                let format = self.config.borrow().format;
                let (pipeline, error) = self.scoped(|| {
                    self.device
                        .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                            label: Some("Workshop Pipeline"),
                            layout: Some(&self.pipeline_layout),
                            vertex: wgpu::VertexState {
                                module: vs,
                                entry_point: Some(vs_entry),
                                buffers: &[wgpu::VertexBufferLayout {
                                    array_stride: Vertex::LAYOUT.stride,
                                    step_mode: wgpu::VertexStepMode::Vertex,
                                    attributes: &attributes,
                                }],
                                compilation_options: Default::default(),
                            },
                            fragment: Some(wgpu::FragmentState {
                                module: fs,
                                entry_point: Some(fs_entry),
                                targets: &[Some(wgpu::ColorTargetState {
                                    format,
                                    blend: Some(wgpu::BlendState::REPLACE),
                                    write_mask: wgpu::ColorWrites::ALL,
                                })],
                                compilation_options: Default::default(),
                            }),
                            primitive: wgpu::PrimitiveState {
                                topology: wgpu::PrimitiveTopology::TriangleList,
                                cull_mode: Some(wgpu::Face::Back),
                                front_face: wgpu::FrontFace::Ccw,
                                ..Default::default()
                            },
                            depth_stencil: Some(wgpu::DepthStencilState {
                                format: DEPTH_FORMAT,
                                depth_write_enabled: true,
                                depth_compare: wgpu::CompareFunction::Less,
                                stencil: wgpu::StencilState::default(),
                                bias: wgpu::DepthBiasState::default(),
                            }),
                            multisample: wgpu::MultisampleState::default(),
                            multiview: None,
                            cache: None,
                        })
                });
                match error {
                    None => GpuProgram {
                        pipeline: Some(pipeline),
                        status: StageStatus::success(),
                    },
                    Some(e) => GpuProgram {
                        pipeline: None,
                        status: StageStatus::failure(e.to_string()),
                    },
                }
            }
            (None, _) => GpuProgram {
                pipeline: None,
                status: StageStatus::failure("attached vertex stage is not compiled"),
            },
            (_, None) => GpuProgram {
                pipeline: None,
                status: StageStatus::failure("attached fragment stage is not compiled"),
            },
        };

        resources.programs.insert(id, program);
        Ok(id)
    }

    fn program_status(&self, id: ProgramId) -> StageStatus {
        self.resources
            .borrow()
            .programs
            .get(&id)
            .map(|p| p.status.clone())
            .unwrap_or_else(|| StageStatus::failure("unknown program"))
    }

    fn delete_program(&self, id: ProgramId) {
        self.resources.borrow_mut().programs.remove(&id);
    }

    fn uniform_offset_alignment(&self) -> u64 {
        u64::from(self.device.limits().min_uniform_buffer_offset_alignment)
    }

    fn create_buffer(
        &self,
        kind: BufferKind,
        size: u64,
        contents: Option<&[u8]>,
    ) -> Result<BufferId, RenderError> {
        let (usage, label) = match kind {
            BufferKind::Vertex => (wgpu::BufferUsages::VERTEX, "Vertex Buffer"),
            BufferKind::Index => (wgpu::BufferUsages::INDEX, "Index Buffer"),
            BufferKind::Uniform => (wgpu::BufferUsages::UNIFORM, "Uniform Buffer"),
        };
        let usage = usage | wgpu::BufferUsages::COPY_DST;

        if contents.is_some_and(|bytes| bytes.len() as u64 != size) {
            return Err(RenderError::allocation(format!(
                "{label}: contents do not match the requested size of {size} bytes"
            )));
        }

        let (buffer, error) = self.scoped(|| match contents {
            Some(bytes) => self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytes,
                    usage,
                }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            }),
        });
        if let Some(e) = error {
            error!("{} allocation failed: {}", label, e);
            return Err(RenderError::allocation(e.to_string()));
        }

        let mut resources = self.resources.borrow_mut();
        let id = BufferId(resources.next_id());
        resources.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                persistent: None,
            },
        );
        debug!("created {} {:?} ({} bytes)", label, id, size);
        Ok(id)
    }

    fn create_persistent_buffer(
        &self,
        slot: u32,
        size: u64,
        binding_size: u64,
    ) -> Result<BufferId, RenderError> {
        let layout = usize::try_from(slot)
            .ok()
            .and_then(|i| self.uniform_layouts.get(i))
            .ok_or_else(|| RenderError::allocation(format!("no uniform slot {slot}")))?;

        let ((buffer, bind_group), error) = self.scoped(|| {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Persistent Uniform Buffer"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Persistent Uniform Bind Group"),
                layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer,
                        offset: 0,
                        size: NonZeroU64::new(binding_size),
                    }),
                }],
            });
            (buffer, bind_group)
        });
        if let Some(e) = error {
            error!("persistent uniform buffer allocation failed: {}", e);
            return Err(RenderError::allocation(e.to_string()));
        }

        let mut resources = self.resources.borrow_mut();
        let id = BufferId(resources.next_id());
        resources.buffers.insert(
            id,
            GpuBuffer {
                buffer,
                persistent: Some(PersistentBinding {
                    slot,
                    mapping: HostMapping::zeroed(size as usize),
                    flushed: vec![0; size as usize],
                    bind_group,
                }),
            },
        );
        Ok(id)
    }

    fn map_persistent(&self, id: BufferId) -> Option<PersistentMapping> {
        self.resources
            .borrow()
            .buffers
            .get(&id)
            .and_then(|b| b.persistent.as_ref())
            .map(|p| p.mapping.mapping())
    }

    fn delete_buffer(&self, id: BufferId) {
        if let Some(gpu) = self.resources.borrow_mut().buffers.remove(&id) {
            gpu.buffer.destroy();
        }
    }

    fn create_vertex_array(
        &self,
        layout: &VertexLayout,
        vertex_buffer: BufferId,
        index_buffer: BufferId,
    ) -> Result<VertexArrayId, RenderError> {
        if *layout != Vertex::LAYOUT {
            return Err(RenderError::allocation(
                "pipelines are built for the fixed vertex layout only",
            ));
        }
        let mut resources = self.resources.borrow_mut();
        if !resources.buffers.contains_key(&vertex_buffer)
            || !resources.buffers.contains_key(&index_buffer)
        {
            return Err(RenderError::allocation(
                "vertex array references a deleted buffer",
            ));
        }
        let id = VertexArrayId(resources.next_id());
        resources.vertex_arrays.insert(
            id,
            VertexArray {
                vertex_buffer,
                index_buffer,
            },
        );
        Ok(id)
    }

    fn delete_vertex_array(&self, id: VertexArrayId) {
        self.resources.borrow_mut().vertex_arrays.remove(&id);
    }

    fn begin_frame(&self, clear_color: [f32; 4]) -> Result<bool, RenderError> {
        let surface_texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("surface lost or outdated, reconfiguring");
                self.reconfigure();
                return Ok(false);
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("timed out acquiring the next surface texture");
                return Ok(false);
            }
            Err(e) => {
                return Err(RenderError::Surface {
                    message: e.to_string(),
                });
            }
        };

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        *self.frame.borrow_mut() = Some(ActiveFrame {
            surface_texture,
            view,
            encoder,
            clear_color,
            commands: Vec::new(),
        });
        Ok(true)
    }

    fn bind_program(&self, id: ProgramId) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            frame.commands.push(FrameCommand::SetProgram(id));
        }
    }

    fn bind_uniform_range(&self, slot: u32, buffer: BufferId, offset: u64, _size: u64) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            frame.commands.push(FrameCommand::SetUniform {
                slot,
                buffer,
                offset,
            });
        }
    }

    fn bind_vertex_array(&self, id: VertexArrayId) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            frame.commands.push(FrameCommand::SetVertexArray(id));
        }
    }

    fn draw_indexed(&self, index_count: u32) {
        if let Some(frame) = self.frame.borrow_mut().as_mut() {
            frame.commands.push(FrameCommand::Draw(index_count));
        }
    }

    fn submit_geometry(&self) -> Result<(), RenderError> {
        let mut frame = self.frame.borrow_mut();
        let Some(frame) = frame.as_mut() else {
            return Err(RenderError::FrameError {
                message: "geometry submitted outside a frame".to_string(),
            });
        };
        let mut resources = self.resources.borrow_mut();
        self.flush_persistent(&mut resources);
        self.replay(frame, &resources);
        Ok(())
    }

    fn abort_frame(&self) {
        // The validation scope is pushed together with the frame.
        if self.frame.borrow_mut().take().is_none() {
            return;
        }
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => warn!("frame aborted with a pending device error: {}", e),
            None => debug!("frame aborted"),
        }
    }

    fn present(&self) -> Result<(), RenderError> {
        let Some(frame) = self.frame.borrow_mut().take() else {
            return Err(RenderError::FrameError {
                message: "present called outside a frame".to_string(),
            });
        };

        self.queue.submit(Some(frame.encoder.finish()));
        frame.surface_texture.present();

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(RenderError::FrameError {
                message: e.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Smallest copy-aligned range covering every byte that differs between
/// `previous` and `current`, or `None` when they are equal.
fn dirty_range(previous: &[u8], current: &[u8]) -> Option<Range<usize>> {
    let differs = |(a, b): (&u8, &u8)| a != b;
    let first = previous.iter().zip(current).position(differs)?;
    let last = previous.iter().zip(current).rposition(differs)?;
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    let start = first - first % align;
    let end = (last + 1).next_multiple_of(align).min(current.len());
    Some(start..end)
}

fn uniform_layout(device: &wgpu::Device, label: &str, slot: u32) -> wgpu::BindGroupLayout {
    let visibility = if slot == PER_FRAME_SLOT {
        wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT
    } else {
        wgpu::ShaderStages::VERTEX
    };
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: None,
            },
            count: None,
        }],
    })
}

fn create_depth_target(device: &wgpu::Device, width: u32, height: u32) -> DepthTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    DepthTarget {
        _texture: texture,
        view,
    }
}

fn wgpu_attributes(layout: &VertexLayout) -> Vec<wgpu::VertexAttribute> {
    layout
        .attributes
        .iter()
        .map(|a| wgpu::VertexAttribute {
            offset: a.offset,
            shader_location: a.location,
            format: match a.format {
                AttributeFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
                AttributeFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_mapping_needs_no_upload() {
        let bytes = vec![3u8; 512];
        assert_eq!(dirty_range(&bytes, &bytes), None);
    }

    #[test]
    fn dirty_range_covers_changes_on_copy_alignment() {
        let previous = vec![0u8; 512];
        let mut current = previous.clone();
        current[258] = 1;
        assert_eq!(dirty_range(&previous, &current), Some(256..260));

        current[5] = 7;
        current[300] = 9;
        assert_eq!(dirty_range(&previous, &current), Some(4..304));

        current[511] = 2;
        assert_eq!(dirty_range(&previous, &current), Some(4..512));
    }

    #[test]
    fn vertex_layout_maps_to_wgpu_attributes() {
        let attributes = wgpu_attributes(&Vertex::LAYOUT);
        assert_eq!(
            attributes,
            vec![
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 12,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: 24,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ]
        );
    }
}
