//! The per-frame update and instanced draw loop.
//!
//! [`FrameLoop`] owns the program, the uploaded meshes and both uniform
//! arenas, and walks the state machine
//!
//! ```text
//! Uninitialized --start--> Running --close/Escape/error--> ShuttingDown --terminate--> Terminated
//! ```
//!
//! Each [`tick`](FrameLoop::tick) while running writes the camera into the
//! per-frame block, clears, binds the program once, then for every instance
//! binds that instance's per-object sub-range and draws every mesh. The
//! overlay renders after geometry and the frame is presented last.

use std::rc::Rc;

use glam::{Mat4, Vec3};
use tracing::{debug, info, warn};
use winit::event::ElementState;
use winit::keyboard::KeyCode;

use crate::camera::OrbitCamera;
use crate::device::RenderDevice;
use crate::error::RenderError;
use crate::mesh::MeshGpu;
use crate::shader::Program;
use crate::uniform::{
    PER_FRAME_SLOT, PER_OBJECT_SLOT, PerFrameData, PerObjectData, UniformBuffer,
};

/// Lifecycle of a [`FrameLoop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    Running,
    ShuttingDown,
    Terminated,
}

/// Values the overlay may adjust between frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameParams {
    pub fov_degrees: f32,
    pub effect_strength: f32,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            fov_degrees: 60.0,
            effect_strength: 0.5,
        }
    }
}

/// Counters for the frame that was just submitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub uniform_binds: u32,
    pub instances: usize,
}

/// Fixed inputs of the loop, decided at startup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSettings {
    pub camera: OrbitCamera,
    /// Viewport aspect ratio. Fixed for the lifetime of the loop.
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub clear_color: [f32; 4],
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            camera: OrbitCamera::default(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 100.0,
            clear_color: [0.1, 0.1, 0.12, 1.0],
        }
    }
}

/// Something drawn on top of the geometry each frame.
pub trait Overlay<D: RenderDevice> {
    /// Called once per frame after geometry was submitted and before present.
    fn render(
        &mut self,
        device: &D,
        params: &mut FrameParams,
        stats: &FrameStats,
    ) -> Result<(), RenderError>;
}

/// An overlay that draws nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOverlay;

impl<D: RenderDevice> Overlay<D> for NoOverlay {
    fn render(&mut self, _: &D, _: &mut FrameParams, _: &FrameStats) -> Result<(), RenderError> {
        Ok(())
    }
}

/// GPU objects the loop draws with. Dropped as a unit on terminate.
struct FrameResources<D: RenderDevice> {
    meshes: Vec<MeshGpu<D>>,
    per_frame: UniformBuffer<D, PerFrameData>,
    per_object: UniformBuffer<D, PerObjectData>,
    program: Program<D>,
}

pub struct FrameLoop<D: RenderDevice> {
    device: Rc<D>,
    state: LoopState,
    resources: Option<FrameResources<D>>,
    instances: Vec<Mat4>,
    settings: FrameSettings,
}

impl<D: RenderDevice> FrameLoop<D> {
    /// Allocates the per-frame (one element) and per-object (one element per
    /// instance) arenas. The instance count is fixed from here on.
    pub fn new(
        device: &Rc<D>,
        program: Program<D>,
        meshes: Vec<MeshGpu<D>>,
        instances: Vec<Mat4>,
        settings: FrameSettings,
    ) -> Result<Self, RenderError> {
        let per_frame = UniformBuffer::allocate_persistent(device, PER_FRAME_SLOT, 1)?;
        let per_object =
            UniformBuffer::allocate_persistent(device, PER_OBJECT_SLOT, instances.len())?;

        info!(
            "frame loop ready: {} meshes x {} instances",
            meshes.len(),
            instances.len()
        );

        Ok(Self {
            device: Rc::clone(device),
            state: LoopState::Uninitialized,
            resources: Some(FrameResources {
                meshes,
                per_frame,
                per_object,
                program,
            }),
            instances,
            settings,
        })
    }

    /// Writes every instance transform into its per-object slot and starts
    /// running.
    pub fn start(&mut self) {
        if self.state != LoopState::Uninitialized {
            warn!("start() called in state {:?}", self.state);
            return;
        }
        if let Some(resources) = &self.resources {
            for (i, transform) in self.instances.iter().enumerate() {
                resources.per_object.write(i, &PerObjectData::new(*transform));
            }
        }
        self.state = LoopState::Running;
        info!("frame loop running");
    }

    /// Escape pressed requests shutdown; everything else is ignored.
    pub fn handle_key(&mut self, key: KeyCode, state: ElementState) {
        if key == KeyCode::Escape && state == ElementState::Pressed {
            debug!("escape pressed");
            self.request_close();
        }
    }

    /// External close signal, e.g. the window's close button.
    pub fn request_close(&mut self) {
        match self.state {
            LoopState::Uninitialized | LoopState::Running => {
                info!("shutdown requested");
                self.state = LoopState::ShuttingDown;
            }
            LoopState::ShuttingDown | LoopState::Terminated => {}
        }
    }

    /// Renders one frame at `time` seconds. A no-op unless running.
    ///
    /// Any device error moves the loop to [`LoopState::ShuttingDown`] before
    /// it is returned.
    pub fn tick(
        &mut self,
        time: f32,
        params: &mut FrameParams,
        overlay: &mut impl Overlay<D>,
    ) -> Result<FrameStats, RenderError> {
        if self.state != LoopState::Running {
            return Ok(FrameStats::default());
        }

        let result = self.render_frame(time, params, overlay);
        if let Err(e) = &result {
            warn!("frame failed, shutting down: {}", e);
            self.state = LoopState::ShuttingDown;
        }
        result
    }

    fn render_frame(
        &self,
        time: f32,
        params: &mut FrameParams,
        overlay: &mut impl Overlay<D>,
    ) -> Result<FrameStats, RenderError> {
        let Some(res) = &self.resources else {
            return Ok(FrameStats::default());
        };
        let settings = &self.settings;

        let view = settings.camera.view(time);
        let projection = OrbitCamera::projection(
            params.fov_degrees,
            settings.aspect,
            settings.near,
            settings.far,
        );
        res.per_frame.write(
            0,
            &PerFrameData::new(view, projection, params.effect_strength),
        );

        if !self.device.begin_frame(settings.clear_color)? {
            debug!("frame skipped");
            return Ok(FrameStats::default());
        }

        let mut stats = FrameStats {
            instances: self.instances.len(),
            ..FrameStats::default()
        };

        self.device.bind_program(res.program.id());
        res.per_frame.bind(0);
        stats.uniform_binds += 1;

        for i in 0..self.instances.len() {
            res.per_object.bind(i);
            stats.uniform_binds += 1;
            for mesh in &res.meshes {
                mesh.draw();
                stats.draw_calls += 1;
            }
        }

        let drawn = self
            .device
            .submit_geometry()
            .and_then(|()| overlay.render(&self.device, params, &stats));
        if let Err(e) = drawn {
            self.device.abort_frame();
            return Err(e);
        }
        self.device.present()?;

        Ok(stats)
    }

    /// Releases every GPU object the loop holds.
    pub fn terminate(&mut self) {
        if self.resources.take().is_some() {
            info!("frame loop resources released");
        }
        self.state = LoopState::Terminated;
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn instances(&self) -> &[Mat4] {
        &self.instances
    }

    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }
}

/// A `size` x `size` grid of translations in the XZ plane, centered on the
/// origin, in row-major order (rows along Z, columns along X).
pub fn instance_grid(size: u32, spacing: f32) -> Vec<Mat4> {
    let half = (size as f32 - 1.0) * 0.5;
    (0..size)
        .flat_map(|row| {
            (0..size).map(move |col| {
                Mat4::from_translation(Vec3::new(
                    (col as f32 - half) * spacing,
                    0.0,
                    (row as f32 - half) * spacing,
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferId;
    use crate::headless::{DeviceCall, Faults, HeadlessDevice, minimal_spirv};
    use crate::mesh::{Mesh, Vertex};
    use crate::shader::load_program;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn program(device: &Rc<HeadlessDevice>) -> Program<HeadlessDevice> {
        let mut vs = NamedTempFile::new().unwrap();
        let mut fs = NamedTempFile::new().unwrap();
        vs.write_all(&minimal_spirv()).unwrap();
        fs.write_all(&minimal_spirv()).unwrap();
        load_program(device, vs.path(), fs.path()).unwrap()
    }

    fn triangle() -> Mesh {
        Mesh::new(
            vec![
                Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.5, 0.0]),
                Vertex::new([-1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
                Vertex::new([1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    fn running_loop(device: &Rc<HeadlessDevice>, grid: u32) -> FrameLoop<HeadlessDevice> {
        let program = program(device);
        let meshes = vec![MeshGpu::upload(device, &triangle()).unwrap()];
        let mut frame_loop = FrameLoop::new(
            device,
            program,
            meshes,
            instance_grid(grid, 2.0),
            FrameSettings::default(),
        )
        .unwrap();
        frame_loop.start();
        device.clear_journal();
        frame_loop
    }

    #[test]
    fn grid_is_row_major_and_centered() {
        let grid = instance_grid(2, 2.0);
        let origins: Vec<Vec3> = grid.iter().map(|m| m.w_axis.truncate()).collect();
        assert_eq!(
            origins,
            vec![
                Vec3::new(-1.0, 0.0, -1.0),
                Vec3::new(1.0, 0.0, -1.0),
                Vec3::new(-1.0, 0.0, 1.0),
                Vec3::new(1.0, 0.0, 1.0),
            ]
        );
        assert!(instance_grid(0, 1.0).is_empty());
        assert_eq!(instance_grid(1, 5.0), vec![Mat4::IDENTITY]);
    }

    #[test]
    fn two_by_two_grid_issues_four_bound_draws() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 2);
        let mut params = FrameParams::default();

        let stats = frame_loop.tick(0.5, &mut params, &mut NoOverlay).unwrap();

        assert_eq!(stats.draw_calls, 4);
        assert_eq!(stats.uniform_binds, 5);

        // Every draw is immediately preceded by its own per-object bind and
        // the vertex array bind.
        let calls = device.calls();
        let mut object_offsets = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            if let DeviceCall::DrawIndexed(count) = call {
                assert_eq!(*count, 3);
                assert!(matches!(calls[i - 1], DeviceCall::BindVertexArray(_)));
                match &calls[i - 2] {
                    DeviceCall::BindUniformRange { slot, offset, .. } => {
                        assert_eq!(*slot, PER_OBJECT_SLOT);
                        object_offsets.push(*offset);
                    }
                    other => panic!("expected per-object bind before draw, got {other:?}"),
                }
            }
        }
        assert_eq!(object_offsets, vec![0, 256, 512, 768]);

        let draws = device.draws();
        for (i, draw) in draws.iter().enumerate() {
            let expected = PerObjectData::new(frame_loop.instances()[i]);
            assert_eq!(draw.uniforms[&PER_OBJECT_SLOT], bytemuck::bytes_of(&expected));
        }
    }

    #[test]
    fn frame_commands_follow_pipeline_order() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 1);

        frame_loop
            .tick(0.0, &mut FrameParams::default(), &mut NoOverlay)
            .unwrap();

        let calls = device.calls();
        assert_eq!(calls.first(), Some(&DeviceCall::BeginFrame));
        assert!(matches!(calls[1], DeviceCall::BindProgram(_)));
        assert!(matches!(
            calls[2],
            DeviceCall::BindUniformRange {
                slot: PER_FRAME_SLOT,
                ..
            }
        ));
        assert_eq!(&calls[calls.len() - 2..], &[DeviceCall::SubmitGeometry, DeviceCall::Present]);
    }

    #[test]
    fn per_frame_block_reflects_params() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 1);
        let mut params = FrameParams {
            fov_degrees: 45.0,
            effect_strength: 0.75,
        };

        frame_loop.tick(2.0, &mut params, &mut NoOverlay).unwrap();

        let settings = *frame_loop.settings();
        let expected = PerFrameData::new(
            settings.camera.view(2.0),
            OrbitCamera::projection(45.0, settings.aspect, settings.near, settings.far),
            0.75,
        );
        let draw = &device.draws()[0];
        assert_eq!(draw.uniforms[&PER_FRAME_SLOT], bytemuck::bytes_of(&expected));
    }

    #[test]
    fn fov_slider_bounds_render() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 1);

        for fov in [0.0, 180.0] {
            let mut params = FrameParams {
                fov_degrees: fov,
                effect_strength: 0.0,
            };
            let stats = frame_loop.tick(1.0, &mut params, &mut NoOverlay).unwrap();
            assert_eq!(stats.draw_calls, 1);
        }
        for draw in device.draws() {
            let block: PerFrameData = bytemuck::pod_read_unaligned(&draw.uniforms[&PER_FRAME_SLOT]);
            assert!(block.projection.is_finite());
        }
    }

    struct RecordingOverlay {
        device: Rc<HeadlessDevice>,
        calls_seen: Vec<DeviceCall>,
    }

    impl Overlay<HeadlessDevice> for RecordingOverlay {
        fn render(
            &mut self,
            _: &HeadlessDevice,
            params: &mut FrameParams,
            stats: &FrameStats,
        ) -> Result<(), RenderError> {
            self.calls_seen = self.device.calls();
            assert_eq!(stats.draw_calls, 4);
            params.fov_degrees = 90.0;
            Ok(())
        }
    }

    #[test]
    fn overlay_runs_between_submit_and_present() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 2);
        let mut overlay = RecordingOverlay {
            device: Rc::clone(&device),
            calls_seen: Vec::new(),
        };
        let mut params = FrameParams::default();

        frame_loop.tick(0.0, &mut params, &mut overlay).unwrap();

        assert_eq!(overlay.calls_seen.last(), Some(&DeviceCall::SubmitGeometry));
        assert_eq!(device.calls().last(), Some(&DeviceCall::Present));
        assert_eq!(params.fov_degrees, 90.0);
    }

    #[test]
    fn tick_is_a_no_op_unless_running() {
        let device = Rc::new(HeadlessDevice::new());
        let program = program(&device);
        let mut frame_loop = FrameLoop::new(
            &device,
            program,
            Vec::new(),
            instance_grid(1, 1.0),
            FrameSettings::default(),
        )
        .unwrap();
        device.clear_journal();

        let stats = frame_loop
            .tick(0.0, &mut FrameParams::default(), &mut NoOverlay)
            .unwrap();
        assert_eq!(stats, FrameStats::default());
        assert!(device.calls().is_empty());
    }

    #[test]
    fn escape_press_shuts_down() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 1);

        frame_loop.handle_key(KeyCode::Escape, ElementState::Released);
        frame_loop.handle_key(KeyCode::KeyQ, ElementState::Pressed);
        assert_eq!(frame_loop.state(), LoopState::Running);

        frame_loop.handle_key(KeyCode::Escape, ElementState::Pressed);
        assert_eq!(frame_loop.state(), LoopState::ShuttingDown);

        frame_loop
            .tick(0.0, &mut FrameParams::default(), &mut NoOverlay)
            .unwrap();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn device_error_moves_to_shutdown() {
        let device = Rc::new(HeadlessDevice::with_faults(Faults {
            frame_failure: true,
            ..Faults::default()
        }));
        let mut frame_loop = running_loop(&device, 1);

        let err = frame_loop
            .tick(0.0, &mut FrameParams::default(), &mut NoOverlay)
            .unwrap_err();

        assert!(matches!(err, RenderError::FrameError { .. }));
        assert_eq!(frame_loop.state(), LoopState::ShuttingDown);
    }

    struct FailingOverlay;

    impl Overlay<HeadlessDevice> for FailingOverlay {
        fn render(
            &mut self,
            _: &HeadlessDevice,
            _: &mut FrameParams,
            _: &FrameStats,
        ) -> Result<(), RenderError> {
            Err(RenderError::FrameError {
                message: "overlay failed".to_string(),
            })
        }
    }

    #[test]
    fn overlay_error_aborts_the_frame() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 1);

        let err = frame_loop
            .tick(0.0, &mut FrameParams::default(), &mut FailingOverlay)
            .unwrap_err();

        assert!(matches!(err, RenderError::FrameError { .. }));
        assert_eq!(frame_loop.state(), LoopState::ShuttingDown);
        let calls = device.calls();
        assert_eq!(calls.last(), Some(&DeviceCall::AbortFrame));
        assert!(!calls.contains(&DeviceCall::Present));
        assert_eq!(device.frames_presented(), 0);
        assert!(device.submit_geometry().is_err());
    }

    #[test]
    fn terminate_releases_every_handle() {
        let device = Rc::new(HeadlessDevice::new());
        let mut frame_loop = running_loop(&device, 3);
        frame_loop.request_close();

        frame_loop.terminate();

        assert_eq!(frame_loop.state(), LoopState::Terminated);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_vertex_arrays(), 0);
        assert_eq!(device.live_programs(), 0);
        let deleted: Vec<BufferId> = device
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                DeviceCall::DeleteBuffer(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(deleted.len(), 4);
    }

    #[test]
    fn empty_instance_list_is_rejected() {
        let device = Rc::new(HeadlessDevice::new());
        let program = program(&device);
        let result = FrameLoop::new(
            &device,
            program,
            Vec::new(),
            Vec::new(),
            FrameSettings::default(),
        );
        assert!(matches!(result, Err(RenderError::GpuAllocationError(_))));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_programs(), 0);
    }
}
