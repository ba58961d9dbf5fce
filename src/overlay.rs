//! egui debug overlay
//!
//! Draws a small window with the field-of-view and effect-strength sliders
//! plus frame statistics, on top of the geometry in the same surface
//! texture.

use std::sync::Arc;
use std::time::Instant;

use egui::ViewportId;
use egui_wgpu::ScreenDescriptor;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::error::RenderError;
use crate::frame::{FrameParams, FrameStats, Overlay};
use crate::gpu::GpuContext;

/// egui overlay bound to one window and surface format.
pub struct DebugOverlay {
    window: Arc<Window>,
    /// egui context (shared state for UI)
    ctx: egui::Context,
    /// egui-winit state for input handling
    winit_state: egui_winit::State,
    /// egui-wgpu renderer for drawing
    renderer: egui_wgpu::Renderer,
    last_frame: Instant,
}

impl DebugOverlay {
    pub fn new(gpu: &GpuContext, window: Arc<Window>) -> Self {
        let ctx = egui::Context::default();

        let winit_state = egui_winit::State::new(
            ctx.clone(),
            ViewportId::ROOT,
            &*window,
            Some(window.scale_factor() as f32),
            None,
            None,
        );

        let renderer = egui_wgpu::Renderer::new(
            &gpu.device,
            gpu.format(),
            egui_wgpu::RendererOptions::default(),
        );

        Self {
            window,
            ctx,
            winit_state,
            renderer,
            last_frame: Instant::now(),
        }
    }

    /// Feeds a window event to egui. Returns true if egui consumed it.
    pub fn on_window_event(&mut self, event: &WindowEvent) -> bool {
        self.winit_state
            .on_window_event(&self.window, event)
            .consumed
    }

    /// Check if egui wants keyboard input
    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }

    fn ui(ctx: &egui::Context, params: &mut FrameParams, stats: &FrameStats, frame_ms: f32) {
        egui::Window::new("Debug")
            .default_pos([12.0, 12.0])
            .resizable(false)
            .show(ctx, |ui| {
                ui.add(egui::Slider::new(&mut params.fov_degrees, 0.0..=180.0).text("FOV"));
                ui.add(egui::Slider::new(&mut params.effect_strength, 0.0..=1.0).text("effect"));
                ui.separator();
                ui.label(format!(
                    "{:.2} ms | {} draws | {} instances",
                    frame_ms, stats.draw_calls, stats.instances
                ));
            });
    }
}

impl Overlay<GpuContext> for DebugOverlay {
    fn render(
        &mut self,
        gpu: &GpuContext,
        params: &mut FrameParams,
        stats: &FrameStats,
    ) -> Result<(), RenderError> {
        let now = Instant::now();
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;

        let raw_input = self.winit_state.take_egui_input(&self.window);
        let full_output = self
            .ctx
            .run(raw_input, |ctx| Self::ui(ctx, params, stats, frame_ms));

        self.winit_state
            .handle_platform_output(&self.window, full_output.platform_output);

        let paint_jobs = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        let screen_descriptor = ScreenDescriptor {
            size_in_pixels: [gpu.width(), gpu.height()],
            pixels_per_point: full_output.pixels_per_point,
        };
        let textures_delta = full_output.textures_delta;
        let renderer = &mut self.renderer;

        gpu.with_frame(|device, queue, encoder, view| {
            for (id, image_delta) in &textures_delta.set {
                renderer.update_texture(device, queue, *id, image_delta);
            }

            let extra = renderer.update_buffers(
                device,
                queue,
                encoder,
                &paint_jobs,
                &screen_descriptor,
            );
            if !extra.is_empty() {
                queue.submit(extra);
            }

            {
                let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Overlay Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                renderer.render(&mut pass.forget_lifetime(), &paint_jobs, &screen_descriptor);
            }

            for id in &textures_delta.free {
                renderer.free_texture(id);
            }
        })
        .ok_or_else(|| RenderError::FrameError {
            message: "overlay rendered outside a frame".to_string(),
        })
    }
}
