//! Application runner: a window, a frame loop and presentation.
//!
//! The setup closure builds the render passes and materials once and returns the per-frame
//! closure. Each frame then runs the same protocol:
//!
//! 1. the backbuffer is cleared and the device statistics are reset
//! 2. the frame closure updates the scene and feeds the renderer (camera, drawcalls, lights)
//! 3. [`Renderer::render`] runs every pass
//! 4. the backbuffer is presented to the window
//!
//! [`AppConfig::backend`] picks where draws run. With [`Backend::Gpu`] the device shares the
//! window's wgpu device, so the presenter shows the backbuffer without a host round trip.
//!
//! Resize events are handled between frames: the surface, the renderer (backbuffer and every
//! pass's targets) and the presenter are resized before the next render.
//!
//! # Example
//!
//! ```ignore
//! itugl::run(AppConfig::new().title("Lit cube").size(800, 600), |ctx| {
//!     let program = Rc::new(programs::lit(4)?);
//!     ctx.renderer.register_shader_program(
//!         &program,
//!         programs::standard_transform_setup(&program),
//!         Some(light::batched_light_update(&program)),
//!     );
//!     ctx.renderer.add_render_pass(ForwardRenderPass::new());
//!     let cube = Model::new(Rc::new(Mesh::cube()), Material::new(program).into_shared());
//!
//!     Ok(move |frame: &mut Frame| {
//!         let camera = Camera::new().at(0.0, 1.0, 3.0).looking_at(0.0, 0.0, 0.0);
//!         frame.renderer.set_current_camera(camera.with_aspect(frame.aspect()));
//!         frame.renderer.add_model(&cube, Mat4::from_rotation_y(frame.time), 0);
//!         frame.renderer.add_light(LightDescriptor::directional(Vec3::NEG_Y));
//!     })
//! })?;
//! ```

use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec4;
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::device::{Backend, Device};
use crate::framebuffer::FramebufferError;
use crate::gpu::{GpuContext, GpuDevice, GpuError};
use crate::present::Presenter;
use crate::renderer::Renderer;
use crate::shader::ShaderError;
use crate::texture::{Texture, TextureError};

/// Failure while starting or running an application.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("failed to present frame: {0}")]
    Surface(#[from] wgpu::SurfaceError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Framebuffer(#[from] FramebufferError),
    #[error(transparent)]
    Texture(#[from] TextureError),
}

/// Context provided during app setup.
pub struct SetupContext<'a> {
    pub renderer: &'a mut Renderer,
    /// Render size: the window size times the render scale.
    pub width: u32,
    pub height: u32,
}

impl SetupContext<'_> {
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Context provided each frame.
pub struct Frame<'a> {
    pub renderer: &'a mut Renderer,
    /// Total elapsed time in seconds.
    pub time: f32,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames rendered before this one.
    pub index: u64,
    /// Render size in pixels.
    pub width: u32,
    pub height: u32,
}

impl Frame<'_> {
    /// Current frames per second.
    pub fn fps(&self) -> f32 {
        if self.dt > 0.0 { 1.0 / self.dt } else { 0.0 }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Configuration for the app window.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Internal resolution relative to the window size.
    pub render_scale: f32,
    /// Backbuffer clear colour at the start of every frame.
    pub clear_color: Vec4,
    pub backend: Backend,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "itugl".to_string(),
            width: 1024,
            height: 768,
            render_scale: 1.0,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            backend: Backend::Gpu,
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn render_scale(mut self, scale: f32) -> Self {
        self.render_scale = scale;
        self
    }

    pub fn clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Render size for a window of `width` x `height`, at least one pixel each way.
    pub fn render_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = if self.render_scale > 0.0 {
            self.render_scale
        } else {
            1.0
        };
        let scaled = |v: u32| ((v as f32 * scale).round() as u32).max(1);
        (scaled(width), scaled(height))
    }
}

type FrameFn = Box<dyn FnMut(&mut Frame)>;
type SetupFn = Box<dyn FnOnce(&mut SetupContext) -> Result<FrameFn, AppError>>;

/// Opens a window and runs the frame loop until the window is closed.
///
/// Errors from setup, window or GPU creation, or presentation stop the loop and are returned.
pub fn run<S, F>(config: AppConfig, setup: S) -> Result<(), AppError>
where
    S: FnOnce(&mut SetupContext) -> Result<F, AppError> + 'static,
    F: FnMut(&mut Frame) + 'static,
{
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let setup: SetupFn = Box::new(move |ctx| {
        let frame_fn: FrameFn = Box::new(setup(ctx)?);
        Ok(frame_fn)
    });
    let mut app = App {
        config,
        state: AppState::Pending(Some(setup)),
        error: None,
    };
    event_loop.run_app(&mut app)?;

    match app.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Runs setup and `frames` frames without a window, at a fixed 60 Hz time step.
///
/// Returns the backbuffer colour texture after the last frame. The GPU backend needs an
/// adapter; without one this fails with [`AppError::Gpu`].
pub fn run_headless<S, F>(config: AppConfig, frames: u32, setup: S) -> Result<Rc<Texture>, AppError>
where
    S: FnOnce(&mut SetupContext) -> Result<F, AppError>,
    F: FnMut(&mut Frame),
{
    let (width, height) = config.render_size(config.width, config.height);
    let device = match config.backend {
        Backend::Gpu => Device::gpu(&GpuDevice::headless()?, width, height),
        Backend::Software => Device::software(width, height),
    };
    let mut renderer = Renderer::new(device);
    let mut frame_fn = setup(&mut SetupContext {
        renderer: &mut renderer,
        width,
        height,
    })?;

    let dt = 1.0 / 60.0;
    for index in 0..frames {
        begin_frame(&mut renderer, &config);
        frame_fn(&mut Frame {
            renderer: &mut renderer,
            time: index as f32 * dt,
            dt,
            index: u64::from(index),
            width,
            height,
        });
        renderer.render();
    }
    log::info!("rendered {frames} headless frames at {width}x{height}");
    Ok(Rc::clone(renderer.device().screen_color()))
}

fn begin_frame(renderer: &mut Renderer, config: &AppConfig) {
    let device = renderer.device_mut();
    device.reset_stats();
    device.bind_framebuffer(None);
    device.clear(Some(config.clear_color), Some(1.0));
}

struct Running {
    window: Arc<Window>,
    gpu: GpuContext,
    presenter: Presenter,
    renderer: Renderer,
    frame_fn: FrameFn,
    render_size: (u32, u32),
    frames: u64,
    start_time: Instant,
    last_frame: Instant,
}

enum AppState {
    Pending(Option<SetupFn>),
    Running(Box<Running>),
    Exited,
}

struct App {
    config: AppConfig,
    state: AppState,
    error: Option<AppError>,
}

impl App {
    fn start(&self, event_loop: &ActiveEventLoop, setup: SetupFn) -> Result<Running, AppError> {
        let window_attrs = WindowAttributes::default()
            .with_title(&self.config.title)
            .with_inner_size(winit::dpi::LogicalSize::new(
                self.config.width,
                self.config.height,
            ));
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let gpu = GpuContext::new(Arc::clone(&window))?;

        let (width, height) = self.config.render_size(gpu.width(), gpu.height());
        let device = match self.config.backend {
            Backend::Gpu => Device::gpu(&gpu.gpu_device(), width, height),
            Backend::Software => Device::software(width, height),
        };
        let mut renderer = Renderer::new(device);
        let frame_fn = setup(&mut SetupContext {
            renderer: &mut renderer,
            width,
            height,
        })?;
        let presenter = Presenter::new(&gpu, width, height);
        log::info!(
            "window `{}` open at {}x{}, rendering at {width}x{height}",
            self.config.title,
            gpu.width(),
            gpu.height()
        );
        window.request_redraw();

        Ok(Running {
            window,
            gpu,
            presenter,
            renderer,
            frame_fn,
            render_size: (width, height),
            frames: 0,
            start_time: Instant::now(),
            last_frame: Instant::now(),
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: AppError) {
        log::error!("{err}");
        self.error = Some(err);
        self.state = AppState::Exited;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let AppState::Pending(setup) = &mut self.state else {
            return;
        };
        let Some(setup) = setup.take() else {
            return;
        };
        match self.start(event_loop, setup) {
            Ok(running) => self.state = AppState::Running(Box::new(running)),
            Err(err) => self.fail(event_loop, err),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let AppState::Running(running) = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key: Key::Named(NamedKey::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.state = AppState::Exited;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    return;
                }
                running.gpu.resize(size.width, size.height);
                let (width, height) = self.config.render_size(size.width, size.height);
                running.renderer.resize(width, height);
                running.presenter.resize(&running.gpu, width, height);
                running.render_size = (width, height);
            }
            WindowEvent::RedrawRequested => {
                let now = Instant::now();
                let time = running.start_time.elapsed().as_secs_f32();
                let dt = now.duration_since(running.last_frame).as_secs_f32();
                running.last_frame = now;

                begin_frame(&mut running.renderer, &self.config);
                let (width, height) = running.render_size;
                let mut frame = Frame {
                    renderer: &mut running.renderer,
                    time,
                    dt,
                    index: running.frames,
                    width,
                    height,
                };
                (running.frame_fn)(&mut frame);
                running.renderer.render();
                running.frames += 1;

                let presented = running
                    .presenter
                    .present(&running.gpu, running.renderer.device().screen_color());
                match presented {
                    Ok(()) => {}
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        log::debug!("surface lost, reconfiguring");
                        running.gpu.reconfigure();
                    }
                    Err(wgpu::SurfaceError::Timeout) => {
                        log::warn!("timed out acquiring the next surface texture");
                    }
                    Err(err) => {
                        self.fail(event_loop, err.into());
                        return;
                    }
                }
                running.window.request_redraw();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::RenderPass;

    #[test]
    fn render_size_scales_and_never_reaches_zero() {
        let config = AppConfig::new().render_scale(0.5);
        assert_eq!(config.render_size(800, 601), (400, 301));
        assert_eq!(config.render_size(1, 1), (1, 1));
        let broken = AppConfig::new().render_scale(-2.0);
        assert_eq!(broken.render_size(640, 480), (640, 480));
    }

    struct CountingPass(Rc<std::cell::Cell<u32>>);

    impl RenderPass for CountingPass {
        fn render(&mut self, _ctx: &mut crate::renderer::RenderContext) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn headless_runs_every_frame() {
        let renders = Rc::new(std::cell::Cell::new(0));
        let passes = Rc::clone(&renders);
        let times = Rc::new(std::cell::RefCell::new(Vec::new()));
        let recorded = Rc::clone(&times);
        let clear = Vec4::new(0.25, 0.5, 0.75, 1.0);
        let config = AppConfig::new()
            .size(8, 6)
            .clear_color(clear)
            .backend(Backend::Software);

        let frame = run_headless(config, 3, move |ctx| {
            assert_eq!((ctx.width, ctx.height), (8, 6));
            ctx.renderer.add_render_pass(CountingPass(passes));
            Ok(move |frame: &mut Frame| recorded.borrow_mut().push(frame.time))
        })
        .unwrap();

        assert_eq!(renders.get(), 3);
        assert_eq!(times.borrow().len(), 3);
        assert_eq!(times.borrow()[0], 0.0);
        assert_eq!(frame.size(), (8, 6));
        assert_eq!(frame.fetch(0, 0), clear);
    }
}
