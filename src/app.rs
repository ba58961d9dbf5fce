use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::{Window, WindowAttributes, WindowId};

use crate::config::HarnessConfig;
use crate::error::RenderError;
use crate::frame::{FrameLoop, FrameParams, LoopState, instance_grid};
use crate::gpu::GpuContext;
use crate::mesh::{Mesh, MeshGpu};
use crate::overlay::DebugOverlay;
use crate::scene::{flatten, import_scene};
use crate::shader::load_program;
use crate::texture::probe_image;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),

    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),
}

/// Everything alive while the window is open.
struct Running {
    window: Arc<Window>,
    gpu: Rc<GpuContext>,
    frame_loop: FrameLoop<GpuContext>,
    overlay: DebugOverlay,
    params: FrameParams,
    start_time: Instant,
}

enum AppState {
    /// Waiting for the event loop to resume; holds the CPU-side meshes.
    Pending(Vec<Mesh>),
    Running(Box<Running>),
    Stopped,
}

struct WorkshopApp {
    config: HarnessConfig,
    state: AppState,
    error: Option<AppError>,
}

impl WorkshopApp {
    fn new(config: HarnessConfig, meshes: Vec<Mesh>) -> Self {
        Self {
            config,
            state: AppState::Pending(meshes),
            error: None,
        }
    }

    fn start(
        config: &HarnessConfig,
        meshes: &[Mesh],
        event_loop: &ActiveEventLoop,
    ) -> Result<Running, AppError> {
        let attrs = WindowAttributes::default()
            .with_title(config.window.title.clone())
            .with_inner_size(PhysicalSize::new(config.window.width, config.window.height));
        let window = Arc::new(event_loop.create_window(attrs)?);

        let gpu = Rc::new(GpuContext::new(window.clone(), config.window.vsync)?);

        let program = load_program(
            &gpu,
            &config.assets.vertex_shader,
            &config.assets.fragment_shader,
        )?;

        let meshes = meshes
            .iter()
            .map(|mesh| MeshGpu::upload(&gpu, mesh))
            .collect::<Result<Vec<_>, _>>()?;

        let instances = instance_grid(config.scene.grid_size, config.scene.grid_spacing);
        let mut frame_loop =
            FrameLoop::new(&gpu, program, meshes, instances, config.frame_settings())?;
        frame_loop.start();

        let overlay = DebugOverlay::new(&gpu, window.clone());
        window.request_redraw();

        Ok(Running {
            window,
            gpu,
            frame_loop,
            overlay,
            params: config.frame_params(),
            start_time: Instant::now(),
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: AppError) {
        error!("{}", err);
        self.error.get_or_insert(err);
        self.stop(event_loop);
    }

    fn stop(&mut self, event_loop: &ActiveEventLoop) {
        if let AppState::Running(running) = &mut self.state {
            running.frame_loop.terminate();
        }
        self.state = AppState::Stopped;
        event_loop.exit();
    }
}

impl ApplicationHandler for WorkshopApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let AppState::Pending(meshes) = &self.state else {
            return;
        };

        match Self::start(&self.config, meshes, event_loop) {
            Ok(running) => {
                info!("window open, entering frame loop");
                self.state = AppState::Running(Box::new(running));
            }
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let AppState::Running(running) = &mut self.state else {
            return;
        };

        let consumed = running.overlay.on_window_event(&event);
        let mut failure = None;

        match event {
            WindowEvent::CloseRequested => running.frame_loop.request_close(),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        ..
                    },
                ..
            } => {
                if consumed || running.overlay.wants_keyboard_input() {
                    debug!("key {:?} taken by overlay", code);
                } else {
                    running.frame_loop.handle_key(code, state);
                }
            }
            WindowEvent::Resized(size) => running.gpu.resize(size.width, size.height),
            WindowEvent::RedrawRequested => {
                let time = running.start_time.elapsed().as_secs_f32();
                let Running {
                    frame_loop,
                    overlay,
                    params,
                    ..
                } = &mut **running;
                match frame_loop.tick(time, params, overlay) {
                    Ok(_) => running.window.request_redraw(),
                    Err(e) => failure = Some(e),
                }
            }
            _ => {}
        }

        if let Some(e) = failure {
            self.fail(event_loop, e.into());
        } else if running.frame_loop.state() != LoopState::Running {
            self.stop(event_loop);
        }
    }
}

/// Loads the scene and texture, opens the window and runs frames until the
/// window closes, Escape is pressed or a frame fails.
pub fn run(config: HarnessConfig) -> Result<(), AppError> {
    let scene = import_scene(&config.assets.mesh)?;
    let meshes = flatten(&scene);
    probe_image(&config.assets.texture)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = WorkshopApp::new(config, meshes);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => {
            info!("shut down cleanly");
            Ok(())
        }
    }
}
