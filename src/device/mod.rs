//! The device: a single GL-style state machine that every pass drives.
//!
//! [`Device`] owns the global render state (feature toggles, depth and blend state), the bound
//! shader program and framebuffer, and the default framebuffer (the backbuffer that gets
//! presented to the window).
//!
//! Draws run on one of two backends:
//!
//! - [`Backend::Gpu`]: wgpu pipelines built from each program's WGSL, specialized on the
//!   render state of the draw and cached
//! - [`Backend::Software`]: a CPU rasterizer running each program's host stages, used by tests
//!   and on machines without a GPU adapter
//!
//! Either way draws execute in order, so results can be read back right after a pass returns.
//!
//! # State discipline
//!
//! The state is process-wide. Anything that changes a toggle is expected to put it back, either
//! by hand, with [`Device::save_state`] / [`Device::restore_state`], or through
//! [`Device::with_features`]:
//!
//! ```ignore
//! device.with_features(&[(Feature::DepthTest, false)], |device| {
//!     device.draw(&fullscreen, 0);
//! });
//! ```

mod hardware;
mod raster;
mod state;

pub use hardware::HardwareError;
pub(crate) use hardware::{GpuMirror, MeshBuffers};
pub use state::{BlendEquation, BlendFactor, BlendState, DepthFunction, Feature, RenderStateSnapshot};

use std::collections::HashSet;
use std::rc::Rc;

use glam::Vec4;

use crate::framebuffer::Framebuffer;
use crate::gpu::GpuDevice;
use crate::mesh::Mesh;
use crate::shader::{FragmentInput, ProgramId, ShaderProgram};
use crate::texture::{Filter, Texture, TextureFormat};

use hardware::{Hardware, RenderTarget};
use raster::{RasterState, Target, depth_texel, map_rgb};

/// Where a [`Device`] executes its draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Backend {
    /// wgpu render pipelines.
    #[default]
    Gpu,
    /// The CPU rasterizer.
    Software,
}

/// Counters accumulated since the last [`Device::reset_stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub draw_calls: u64,
    pub triangles: u64,
    /// Fragments that reached the target. Only the software backend counts them.
    pub fragments_written: u64,
    pub program_binds: u64,
    pub framebuffer_binds: u64,
    pub clears: u64,
}

/// Render state captured for one draw call.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawRecord {
    pub program: ProgramId,
    /// Label of the bound framebuffer, `None` for the backbuffer.
    pub target: Option<String>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
    pub blend_enabled: bool,
    pub blend: BlendState,
    pub fragments_written: u64,
}

pub struct Device {
    width: u32,
    height: u32,
    features: u8,
    depth_write: bool,
    depth_function: DepthFunction,
    blend: BlendState,
    program: Option<Rc<ShaderProgram>>,
    framebuffer: Option<Rc<Framebuffer>>,
    screen_color: Rc<Texture>,
    screen_depth: Rc<Texture>,
    stats: DeviceStats,
    history: Vec<DrawRecord>,
    hardware: Option<Hardware>,
    skipped_programs: HashSet<ProgramId>,
}

impl Device {
    /// Creates a device that draws on `gpu`, with a `width` x `height` backbuffer and GL default
    /// state.
    pub fn gpu(gpu: &GpuDevice, width: u32, height: u32) -> Self {
        let mut device = Self::software(width, height);
        device.hardware = Some(Hardware::new(gpu));
        log::info!("device draws on the GPU");
        device
    }

    /// Creates a device that rasterizes on the CPU.
    pub fn software(width: u32, height: u32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let screen_color = Texture::new("backbuffer color", width, height, TextureFormat::Rgba32F)
            .with_filter(Filter::Nearest);
        let screen_depth =
            Texture::new("backbuffer depth", width, height, TextureFormat::Depth32F)
                .with_filter(Filter::Nearest);
        screen_depth.fill(Vec4::ONE);
        log::info!("created device with a {width}x{height} backbuffer");

        Self {
            width,
            height,
            features: 0,
            depth_write: true,
            depth_function: DepthFunction::Less,
            blend: BlendState::default(),
            program: None,
            framebuffer: None,
            screen_color: Rc::new(screen_color),
            screen_depth: Rc::new(screen_depth),
            stats: DeviceStats::default(),
            history: Vec::new(),
            hardware: None,
            skipped_programs: HashSet::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        match self.hardware {
            Some(_) => Backend::Gpu,
            None => Backend::Software,
        }
    }

    /// The GPU this device draws on, if any.
    pub fn gpu_device(&self) -> Option<&GpuDevice> {
        self.hardware.as_ref().map(Hardware::gpu)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    /// Resizes the backbuffer. Zero-sized dimensions are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.screen_color.resize(width, height);
        self.screen_depth.resize(width, height);
        self.screen_depth.fill(Vec4::ONE);
        log::debug!("resized backbuffer to {width}x{height}");
    }

    pub fn is_feature_enabled(&self, feature: Feature) -> bool {
        self.features & feature.bit() != 0
    }

    pub fn set_feature_enabled(&mut self, feature: Feature, enabled: bool) {
        if enabled {
            self.features |= feature.bit();
        } else {
            self.features &= !feature.bit();
        }
    }

    pub fn enable_feature(&mut self, feature: Feature) {
        self.set_feature_enabled(feature, true);
    }

    pub fn disable_feature(&mut self, feature: Feature) {
        self.set_feature_enabled(feature, false);
    }

    /// Applies feature overrides for the duration of `f`, then restores exactly those features.
    pub fn with_features<R>(
        &mut self,
        overrides: &[(Feature, bool)],
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let saved: Vec<(Feature, bool)> = overrides
            .iter()
            .map(|&(feature, _)| (feature, self.is_feature_enabled(feature)))
            .collect();
        for &(feature, enabled) in overrides {
            self.set_feature_enabled(feature, enabled);
        }
        let result = f(self);
        for (feature, enabled) in saved.into_iter().rev() {
            self.set_feature_enabled(feature, enabled);
        }
        result
    }

    pub fn depth_write_enabled(&self) -> bool {
        self.depth_write
    }

    pub fn set_depth_write_enabled(&mut self, enabled: bool) {
        self.depth_write = enabled;
    }

    pub fn depth_function(&self) -> DepthFunction {
        self.depth_function
    }

    pub fn set_depth_function(&mut self, function: DepthFunction) {
        self.depth_function = function;
    }

    pub fn blend_state(&self) -> BlendState {
        self.blend
    }

    pub fn set_blend_equation(&mut self, equation: BlendEquation) {
        self.blend.equation = equation;
    }

    pub fn set_blend_factors(&mut self, source: BlendFactor, destination: BlendFactor) {
        self.blend.source = source;
        self.blend.destination = destination;
    }

    pub fn set_blend_state(&mut self, blend: BlendState) {
        self.blend = blend;
    }

    pub fn save_state(&self) -> RenderStateSnapshot {
        RenderStateSnapshot {
            features: self.features,
            depth_write: self.depth_write,
            depth_function: self.depth_function,
            blend: self.blend,
        }
    }

    pub fn restore_state(&mut self, snapshot: RenderStateSnapshot) {
        self.features = snapshot.features;
        self.depth_write = snapshot.depth_write;
        self.depth_function = snapshot.depth_function;
        self.blend = snapshot.blend;
    }

    pub fn use_program(&mut self, program: Rc<ShaderProgram>) {
        self.program = Some(program);
        self.stats.program_binds += 1;
    }

    pub fn current_program(&self) -> Option<&Rc<ShaderProgram>> {
        self.program.as_ref()
    }

    /// Binds a render target. `None` selects the backbuffer.
    pub fn bind_framebuffer(&mut self, framebuffer: Option<Rc<Framebuffer>>) {
        if let Some(framebuffer) = &framebuffer {
            if let Err(err) = framebuffer.check_status() {
                log::warn!("binding incomplete framebuffer: {err}");
            }
        }
        self.framebuffer = framebuffer;
        self.stats.framebuffer_binds += 1;
    }

    pub fn bound_framebuffer(&self) -> Option<&Rc<Framebuffer>> {
        self.framebuffer.as_ref()
    }

    /// Clears the attachments of the bound target.
    pub fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>) {
        if !self.target_is_complete("clear") {
            return;
        }
        let srgb = self.writes_srgb();
        let (color_texture, depth_texture) = self.target_textures();
        if let Some(hardware) = &mut self.hardware {
            let target = RenderTarget {
                color: color_texture.as_deref(),
                depth: depth_texture.as_deref(),
                display: self.framebuffer.is_none(),
                srgb,
            };
            hardware.clear(&target, color, depth);
            self.stats.clears += 1;
            return;
        }
        if let (Some(texture), Some(value)) = (color_texture, color) {
            let value = if srgb {
                map_rgb(value.clamp(Vec4::ZERO, Vec4::ONE), crate::texture::linear_to_srgb)
            } else {
                value
            };
            texture.fill(value);
        }
        if let (Some(texture), Some(value)) = (depth_texture, depth) {
            texture.fill(Vec4::from_array(depth_texel(value).0));
        }
        self.stats.clears += 1;
    }

    /// Draws one submesh with the bound program into the bound target.
    pub fn draw(&mut self, mesh: &Mesh, submesh: usize) {
        let Some(program) = self.program.clone() else {
            log::warn!("draw call issued with no shader program bound");
            return;
        };
        let submesh_index = submesh;
        let Some(submesh) = mesh.submesh(submesh) else {
            log::warn!("draw call references missing submesh {submesh}");
            return;
        };
        if !self.target_is_complete("draw") {
            return;
        }
        let runnable = match self.backend() {
            Backend::Gpu => program.wgsl_source().is_some(),
            Backend::Software => program.has_host_stages(),
        };
        if !runnable {
            if self.skipped_programs.insert(program.id()) {
                log::warn!(
                    "program `{}` has no stages for the {:?} backend; skipping its draws",
                    program.name(),
                    self.backend()
                );
            }
            return;
        }

        let on_screen = self.framebuffer.is_none();
        let state = RasterState {
            depth_test: self.is_feature_enabled(Feature::DepthTest),
            depth_write: self.depth_write,
            depth_function: self.depth_function,
            blend: self
                .is_feature_enabled(Feature::Blend)
                .then_some(self.blend),
            cull_back_faces: self.is_feature_enabled(Feature::CullFace),
            clamp: on_screen,
            srgb_encode: self.writes_srgb(),
        };
        let (width, height) = self.target_size();
        let (color_texture, depth_texture) = self.target_textures();

        let fragments = if let Some(hardware) = &mut self.hardware {
            let target = RenderTarget {
                color: color_texture.as_deref(),
                depth: depth_texture.as_deref(),
                display: on_screen,
                srgb: state.srgb_encode,
            };
            if !hardware.draw(&program, mesh, submesh_index, &state, &target) {
                return;
            }
            0
        } else {
            rasterize_submesh(
                &program,
                submesh,
                &state,
                (width, height),
                color_texture.as_deref(),
                depth_texture.as_deref(),
            )
        };

        log::trace!(
            "draw `{}`: {} triangles, {} fragments",
            program.name(),
            submesh.indices.len() / 3,
            fragments
        );
        self.stats.draw_calls += 1;
        self.stats.triangles += (submesh.indices.len() / 3) as u64;
        self.stats.fragments_written += fragments;
        self.history.push(DrawRecord {
            program: program.id(),
            target: self.framebuffer.as_ref().map(|fb| fb.label().to_string()),
            depth_test: state.depth_test,
            depth_write: self.depth_write,
            depth_function: self.depth_function,
            blend_enabled: state.blend.is_some(),
            blend: self.blend,
            fragments_written: fragments,
        });
    }

    /// Colour attachment of the backbuffer.
    pub fn screen_color(&self) -> &Rc<Texture> {
        &self.screen_color
    }

    pub fn screen_depth(&self) -> &Rc<Texture> {
        &self.screen_depth
    }

    /// Backbuffer texel at `(x, y)`, row 0 at the top.
    pub fn read_pixel(&self, x: u32, y: u32) -> Vec4 {
        self.screen_color.fetch(x as i32, y as i32)
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    pub fn draw_history(&self) -> &[DrawRecord] {
        &self.history
    }

    /// Clears the counters and the draw history.
    pub fn reset_stats(&mut self) {
        self.stats = DeviceStats::default();
        self.history.clear();
    }

    /// Re-checks the bound framebuffer, whose attachments may have been resized since it was
    /// bound.
    fn target_is_complete(&self, operation: &str) -> bool {
        let Some(framebuffer) = &self.framebuffer else {
            return true;
        };
        match framebuffer.check_status() {
            Ok(()) => true,
            Err(err) => {
                log::warn!("skipping {operation}: {err}");
                false
            }
        }
    }

    fn writes_srgb(&self) -> bool {
        self.framebuffer.is_none() && self.is_feature_enabled(Feature::FramebufferSrgb)
    }

    fn target_size(&self) -> (u32, u32) {
        match &self.framebuffer {
            Some(framebuffer) => framebuffer.size(),
            None => (self.width, self.height),
        }
    }

    fn target_textures(&self) -> (Option<Rc<Texture>>, Option<Rc<Texture>>) {
        match &self.framebuffer {
            Some(framebuffer) => (
                framebuffer.color_texture().cloned(),
                framebuffer.depth_texture().cloned(),
            ),
            None => (
                Some(Rc::clone(&self.screen_color)),
                Some(Rc::clone(&self.screen_depth)),
            ),
        }
    }
}

/// Runs one submesh through the software rasterizer. Returns the number of fragments written.
fn rasterize_submesh(
    program: &ShaderProgram,
    submesh: &crate::mesh::Submesh,
    state: &RasterState,
    (width, height): (u32, u32),
    color_texture: Option<&Texture>,
    depth_texture: Option<&Texture>,
) -> u64 {
    program.with_uniforms(|uniforms| {
        let outputs: Vec<_> = submesh
            .vertices
            .iter()
            .map(|vertex| program.run_vertex(uniforms, vertex))
            .collect();

        let mut color = color_texture.map(|texture| texture.texels_mut());
        let mut depth = depth_texture.map(|texture| texture.texels_mut());
        let mut target = Target {
            width,
            height,
            color: color.as_deref_mut(),
            depth: depth.as_deref_mut(),
        };
        let shade = |input: &FragmentInput| program.run_fragment(uniforms, input);

        let mut written = 0;
        for triangle in submesh.indices.chunks_exact(3) {
            let fetch = |i: u32| outputs.get(i as usize).copied();
            let (Some(a), Some(b), Some(c)) =
                (fetch(triangle[0]), fetch(triangle[1]), fetch(triangle[2]))
            else {
                log::trace!("skipping triangle with out-of-range index");
                continue;
            };
            written += raster::draw_triangle(&mut target, state, [a, b, c], &shade);
        }
        written
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use crate::shader::VertexOutput;
    use glam::Vec3;

    fn flat(color: Vec4) -> Rc<ShaderProgram> {
        Rc::new(
            ShaderProgram::builder("flat")
                .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
                .fragment(move |_, _| Some(color))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn starts_with_gl_defaults() {
        let device = Device::software(4, 4);
        for feature in Feature::ALL {
            assert!(!device.is_feature_enabled(feature));
        }
        assert!(device.depth_write_enabled());
        assert_eq!(device.depth_function(), DepthFunction::Less);
        assert_eq!(device.blend_state(), BlendState::default());
    }

    #[test]
    fn with_features_restores_previous_values() {
        let mut device = Device::software(4, 4);
        device.enable_feature(Feature::DepthTest);
        let inside = device.with_features(
            &[(Feature::DepthTest, false), (Feature::Blend, true)],
            |device| {
                (
                    device.is_feature_enabled(Feature::DepthTest),
                    device.is_feature_enabled(Feature::Blend),
                )
            },
        );
        assert_eq!(inside, (false, true));
        assert!(device.is_feature_enabled(Feature::DepthTest));
        assert!(!device.is_feature_enabled(Feature::Blend));
    }

    #[test]
    fn save_and_restore_state() {
        let mut device = Device::software(4, 4);
        let saved = device.save_state();
        device.enable_feature(Feature::Blend);
        device.set_depth_write_enabled(false);
        device.set_blend_state(BlendState::additive());
        device.set_depth_function(DepthFunction::LessEqual);
        device.restore_state(saved);
        assert_eq!(device.save_state(), saved);
    }

    #[test]
    fn draws_into_the_backbuffer() {
        let mut device = Device::software(8, 6);
        let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
        device.use_program(flat(red));
        device.draw(&Mesh::fullscreen_triangle(), 0);

        assert_eq!(device.read_pixel(0, 0), red);
        assert_eq!(device.read_pixel(7, 5), red);
        let stats = device.stats();
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.fragments_written, 48);
        assert_eq!(device.draw_history()[0].target, None);
    }

    #[test]
    fn srgb_encoding_applies_to_the_backbuffer_only() {
        let mut device = Device::software(2, 2);
        device.enable_feature(Feature::FramebufferSrgb);
        device.use_program(flat(Vec4::new(0.5, 0.5, 0.5, 1.0)));
        device.draw(&Mesh::fullscreen_triangle(), 0);
        let encoded = crate::texture::linear_to_srgb(0.5);
        assert!((device.read_pixel(1, 1).x - encoded).abs() < 1e-6);

        let color = Rc::new(Texture::new("offscreen", 2, 2, TextureFormat::Rgba32F));
        let fb = Framebuffer::builder("offscreen")
            .color(Rc::clone(&color))
            .build()
            .unwrap();
        device.bind_framebuffer(Some(Rc::new(fb)));
        device.draw(&Mesh::fullscreen_triangle(), 0);
        assert_eq!(color.fetch(1, 1).x, 0.5);
    }

    #[test]
    fn drawing_without_a_program_is_ignored() {
        let mut device = Device::software(2, 2);
        device.draw(&Mesh::fullscreen_triangle(), 0);
        assert_eq!(device.stats().draw_calls, 0);
    }

    #[test]
    fn clear_fills_the_bound_target() {
        let mut device = Device::software(3, 3);
        device.clear(Some(Vec4::new(0.0, 0.0, 1.0, 1.0)), Some(0.5));
        assert_eq!(device.read_pixel(2, 2), Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(device.screen_depth().fetch(0, 0).x, 0.5);
    }

    #[test]
    fn draws_and_clears_skip_a_target_resized_out_of_agreement() {
        let color = Rc::new(Texture::new("scene color", 4, 4, TextureFormat::Rgba32F));
        let depth = Rc::new(Texture::new("scene depth", 4, 4, TextureFormat::Depth32F));
        let fb = Framebuffer::builder("scene")
            .color(Rc::clone(&color))
            .depth(Rc::clone(&depth))
            .build()
            .unwrap();
        depth.resize(2, 2);

        let mut device = Device::software(4, 4);
        device.bind_framebuffer(Some(Rc::new(fb)));
        device.use_program(flat(Vec4::ONE));
        device.clear(Some(Vec4::ONE), Some(1.0));
        device.draw(&Mesh::fullscreen_triangle(), 0);

        let stats = device.stats();
        assert_eq!(stats.draw_calls, 0);
        assert_eq!(stats.clears, 0);
        assert_eq!(color.fetch(0, 0), Vec4::ZERO);
    }

    #[test]
    fn software_devices_skip_programs_without_host_stages() {
        let program = ShaderProgram::builder("gpu only")
            .wgsl(FLAT_WGSL)
            .uniform("Color", crate::shader::UniformKind::Vec4)
            .build()
            .unwrap();
        let mut device = Device::software(2, 2);
        device.use_program(Rc::new(program));
        device.draw(&Mesh::fullscreen_triangle(), 0);
        assert_eq!(device.stats().draw_calls, 0);
        assert_eq!(device.read_pixel(0, 0), Vec4::ZERO);
    }

    const FLAT_WGSL: &str = "
fn shade_vertex(input: VertexInput) -> VertexOutput {
    return itugl_vertex_output(vec4<f32>(input.position, 1.0));
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    return u.Color;
}
";

    /// A headless GPU device, or `None` on machines without an adapter.
    fn gpu() -> Option<GpuDevice> {
        match GpuDevice::headless() {
            Ok(gpu) => Some(gpu),
            Err(err) => {
                eprintln!("no GPU adapter, skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn gpu_clears_read_back_exactly() {
        let Some(gpu) = gpu() else {
            return;
        };
        let mut device = Device::gpu(&gpu, 4, 3);
        assert_eq!(device.backend(), Backend::Gpu);
        device.clear(Some(Vec4::new(0.0, 0.0, 1.0, 1.0)), Some(0.5));

        assert_eq!(device.read_pixel(3, 2), Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(device.screen_depth().fetch(0, 0).x, 0.5);
        assert_eq!(device.stats().clears, 1);
    }

    #[test]
    fn gpu_draws_fill_an_offscreen_target() {
        let Some(gpu) = gpu() else {
            return;
        };
        let program = ShaderProgram::builder("flat wgsl")
            .uniform_with_default("Color", Vec4::new(0.25, 0.5, 0.75, 1.0))
            .wgsl(FLAT_WGSL)
            .build()
            .unwrap();
        let color = Rc::new(Texture::new("offscreen", 5, 4, TextureFormat::Rgba32F));
        let fb = Framebuffer::builder("offscreen")
            .color(Rc::clone(&color))
            .build()
            .unwrap();

        let mut device = Device::gpu(&gpu, 5, 4);
        device.bind_framebuffer(Some(Rc::new(fb)));
        device.use_program(Rc::new(program));
        device.draw(&Mesh::fullscreen_triangle(), 0);

        assert_eq!(device.stats().draw_calls, 1);
        for (x, y) in [(0, 0), (4, 3), (2, 1)] {
            let texel = color.fetch(x, y);
            assert!((texel - Vec4::new(0.25, 0.5, 0.75, 1.0)).abs().max_element() < 1e-3);
        }
    }

    #[test]
    fn resize_recreates_the_backbuffer() {
        let mut device = Device::software(3, 3);
        device.resize(5, 2);
        assert_eq!(device.screen_color().size(), (5, 2));
        assert_eq!(device.screen_depth().size(), (5, 2));
        device.resize(0, 4);
        assert_eq!((device.width(), device.height()), (5, 2));
    }
}
