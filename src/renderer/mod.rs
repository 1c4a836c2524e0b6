//! The renderer: an ordered list of render passes over shared per-frame state.
//!
//! Each frame follows the same protocol:
//!
//! 1. Scene traversal sets the current camera and fills the drawcall and light collections
//!    ([`Renderer::set_current_camera`], [`Renderer::add_drawcall`], [`Renderer::add_light`]).
//! 2. [`Renderer::render`] runs every pass in registration order. Before a pass runs, its target
//!    framebuffer is bound (`None` means the backbuffer).
//! 3. The collections are cleared, ready for the next frame.
//!
//! Shader-specific uniform uploads never live in the passes. Every shader program is registered
//! once with a transform-setup callback and an optional light-update callback, and the passes
//! go through [`RenderContext::prepare_drawcall`] and [`RenderContext::update_lights`], which
//! look the callbacks up by program identity.
//!
//! # Example
//!
//! ```ignore
//! let mut renderer = Renderer::new(Device::software(640, 480));
//! let program = Rc::new(programs::lit(4)?);
//! renderer.register_shader_program(
//!     &program,
//!     programs::standard_transform_setup(&program),
//!     Some(light::batched_light_update(&program)),
//! );
//! renderer.add_render_pass(ForwardRenderPass::new());
//!
//! renderer.set_current_camera(camera);
//! renderer.add_model(&model, Mat4::IDENTITY, 0);
//! renderer.add_light(LightDescriptor::directional(Vec3::NEG_Y));
//! renderer.render();
//! ```

mod forward;
mod offscreen;
mod pass;
mod postfx;
mod skybox;

pub use forward::ForwardRenderPass;
pub use offscreen::OffscreenRenderPass;
pub use pass::RenderPass;
pub use postfx::PostFxRenderPass;
pub use skybox::SkyboxRenderPass;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use glam::Mat4;

use crate::camera::Camera;
use crate::device::{BlendEquation, BlendFactor, BlendState, DepthFunction, Device, Feature};
use crate::light::{LightCollection, LightDescriptor};
use crate::material::{Material, SharedMaterial};
use crate::mesh::{Mesh, Model};
use crate::shader::{ProgramId, ShaderProgram};

/// Pushes per-drawcall transform uniforms: `(program, world_matrix, camera, camera_changed)`.
///
/// Camera-dependent uniforms only need uploading when `camera_changed` is true; values
/// persist inside the program until overwritten.
pub type TransformSetupFn = Box<dyn Fn(&ShaderProgram, &Mat4, &Camera, bool)>;

/// Pushes the next batch of lights starting at `index` and advances it.
///
/// Returns `false` once no light was bound, which ends the light-batch loop.
pub type LightUpdateFn = Box<dyn Fn(&ShaderProgram, &LightCollection, &mut usize) -> bool>;

/// One mesh submesh drawn with one material at one world transform, for one frame.
#[derive(Clone, Debug)]
pub struct DrawcallInfo {
    pub mesh: Rc<Mesh>,
    pub submesh: usize,
    pub material: SharedMaterial,
    pub world_matrix: Mat4,
}

impl DrawcallInfo {
    pub fn new(mesh: Rc<Mesh>, submesh: usize, material: SharedMaterial, world_matrix: Mat4) -> Self {
        Self {
            mesh,
            submesh,
            material,
            world_matrix,
        }
    }

    /// Issues the draw with whatever state is currently bound.
    pub fn draw(&self, device: &mut Device) {
        device.draw(&self.mesh, self.submesh);
    }
}

struct ProgramEntry {
    transform_setup: TransformSetupFn,
    light_update: Option<LightUpdateFn>,
    /// Camera version last pushed to this program.
    camera_version: Cell<u64>,
}

/// Everything a pass can see and drive while it renders.
pub struct RenderContext {
    device: Device,
    camera: Camera,
    camera_version: u64,
    programs: HashMap<ProgramId, ProgramEntry>,
    drawcalls: Vec<Vec<DrawcallInfo>>,
    lights: LightCollection,
    fullscreen: Rc<Mesh>,
    warned: RefCell<HashSet<ProgramId>>,
}

impl RenderContext {
    fn new(device: Device) -> Self {
        Self {
            device,
            camera: Camera::default(),
            camera_version: 0,
            programs: HashMap::new(),
            drawcalls: Vec::new(),
            lights: LightCollection::new(),
            fullscreen: Rc::new(Mesh::fullscreen_triangle()),
            warned: RefCell::new(HashSet::new()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn lights(&self) -> &LightCollection {
        &self.lights
    }

    /// Drawcalls of collection `index`, in insertion order. Unknown collections are empty.
    pub fn drawcalls(&self, index: usize) -> &[DrawcallInfo] {
        self.drawcalls.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The shared fullscreen triangle used by fullscreen passes.
    pub fn fullscreen_mesh(&self) -> &Rc<Mesh> {
        &self.fullscreen
    }

    /// Binds the drawcall's material, then runs its program's transform setup.
    ///
    /// `camera_changed` is true the first time a program is prepared after a camera change and
    /// false after that, until the camera changes again.
    pub fn prepare_drawcall(&mut self, drawcall: &DrawcallInfo) {
        let material = drawcall.material.borrow();
        material.bind(&mut self.device);

        let program = material.shader_program();
        let Some(entry) = self.programs.get(&program.id()) else {
            self.warn_unregistered(program);
            return;
        };
        let camera_changed = entry.camera_version.get() != self.camera_version;
        entry.camera_version.set(self.camera_version);
        log::trace!(
            "prepare drawcall with `{}` (camera changed: {camera_changed})",
            program.name()
        );
        (entry.transform_setup)(program, &drawcall.world_matrix, &self.camera, camera_changed);
    }

    /// Runs the program's light-update callback from `index`.
    ///
    /// Programs registered without one never bind lights.
    pub fn update_lights(&self, program: &ShaderProgram, index: &mut usize) -> bool {
        match self
            .programs
            .get(&program.id())
            .and_then(|entry| entry.light_update.as_ref())
        {
            Some(update) => update(program, &self.lights, index),
            None => false,
        }
    }

    /// Sets blend and depth state for one light batch of a drawcall using `material`.
    ///
    /// The first batch draws with the material's own state and establishes depth. Later
    /// batches add their contribution on top: blending on with a destination factor of one,
    /// depth writes off, and a depth test that accepts the depth already written.
    pub fn set_lighting_render_states(&mut self, first_batch: bool, material: &Material) {
        let device = &mut self.device;
        if first_batch {
            let blended = material.is_blended();
            device.set_feature_enabled(Feature::Blend, blended);
            if blended {
                device.set_blend_state(material.blend_state());
            }
            device.set_depth_write_enabled(material.depth_write());
            device.set_depth_function(DepthFunction::Less);
        } else {
            let source = if material.is_blended() {
                material.blend_state().source
            } else {
                BlendFactor::One
            };
            device.enable_feature(Feature::Blend);
            device.set_blend_state(BlendState::new(BlendEquation::Add, source, BlendFactor::One));
            device.set_depth_write_enabled(false);
            device.set_depth_function(DepthFunction::LessEqual);
        }
    }

    fn warn_unregistered(&self, program: &ShaderProgram) {
        if self.warned.borrow_mut().insert(program.id()) {
            log::warn!(
                "shader program `{}` is not registered with the renderer; drawing without transform setup",
                program.name()
            );
        }
    }

    fn clear_frame(&mut self) {
        for collection in &mut self.drawcalls {
            collection.clear();
        }
        self.lights.clear();
    }
}

/// Runs the render passes and owns the state they share.
pub struct Renderer {
    passes: Vec<Box<dyn RenderPass>>,
    context: RenderContext,
}

impl Renderer {
    pub fn new(device: Device) -> Self {
        Self {
            passes: Vec::new(),
            context: RenderContext::new(device),
        }
    }

    pub fn device(&self) -> &Device {
        &self.context.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.context.device
    }

    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RenderContext {
        &mut self.context
    }

    /// Associates the callbacks used for drawcalls whose material uses `program`.
    ///
    /// Registering the same program again replaces its callbacks.
    ///
    /// # Arguments
    ///
    /// * `program` - The program the callbacks are keyed on
    /// * `transform_setup` - Pushes world and camera uniforms per drawcall
    /// * `light_update` - Pushes light batches, or `None` for programs that ignore lights
    pub fn register_shader_program(
        &mut self,
        program: &Rc<ShaderProgram>,
        transform_setup: TransformSetupFn,
        light_update: Option<LightUpdateFn>,
    ) {
        log::debug!(
            "registered shader program `{}` (lights: {})",
            program.name(),
            light_update.is_some()
        );
        self.context.programs.insert(
            program.id(),
            ProgramEntry {
                transform_setup,
                light_update,
                camera_version: Cell::new(u64::MAX),
            },
        );
    }

    /// Replaces the camera used for the frame and marks it as changed for every program.
    pub fn set_current_camera(&mut self, camera: Camera) {
        self.context.camera = camera;
        self.context.camera_version += 1;
    }

    pub fn current_camera(&self) -> &Camera {
        &self.context.camera
    }

    /// Appends a pass. Passes run in the order they are added.
    pub fn add_render_pass<P: RenderPass + 'static>(&mut self, pass: P) {
        log::info!("added render pass `{}`", pass.name());
        self.passes.push(Box::new(pass));
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Appends a drawcall to collection `collection`, creating the collection if needed.
    pub fn add_drawcall(&mut self, collection: usize, drawcall: DrawcallInfo) {
        if self.context.drawcalls.len() <= collection {
            self.context.drawcalls.resize_with(collection + 1, Vec::new);
        }
        self.context.drawcalls[collection].push(drawcall);
    }

    /// Adds one drawcall per submesh of `model`.
    pub fn add_model(&mut self, model: &Model, world_matrix: Mat4, collection: usize) {
        for submesh in 0..model.mesh.submesh_count() {
            let Some(material) = model.material_for(submesh) else {
                log::warn!("model has no material for submesh {submesh}, skipping");
                continue;
            };
            self.add_drawcall(
                collection,
                DrawcallInfo::new(
                    Rc::clone(&model.mesh),
                    submesh,
                    Rc::clone(material),
                    world_matrix,
                ),
            );
        }
    }

    pub fn add_light(&mut self, light: LightDescriptor) {
        self.context.lights.push(light);
    }

    pub fn drawcalls(&self, collection: usize) -> &[DrawcallInfo] {
        self.context.drawcalls(collection)
    }

    pub fn lights(&self) -> &LightCollection {
        &self.context.lights
    }

    pub fn prepare_drawcall(&mut self, drawcall: &DrawcallInfo) {
        self.context.prepare_drawcall(drawcall);
    }

    /// Runs every pass in order, then clears the frame's drawcalls and lights.
    pub fn render(&mut self) {
        for pass in &mut self.passes {
            let target = pass.target_framebuffer();
            log::trace!(
                "render pass `{}` into {}",
                pass.name(),
                target.as_ref().map_or("backbuffer", |fb| fb.label())
            );
            self.context.device.bind_framebuffer(target);
            pass.render(&mut self.context);
        }
        self.context.device.bind_framebuffer(None);
        self.context.clear_frame();
    }

    /// Resizes the backbuffer and every pass's render targets.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        log::debug!("resizing renderer to {width}x{height}");
        self.context.device.resize(width, height);
        for pass in &mut self.passes {
            pass.resize(width, height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{UniformKind, VertexOutput};
    use glam::{Vec3, Vec4};

    fn program() -> Rc<ShaderProgram> {
        Rc::new(
            ShaderProgram::builder("renderer test")
                .uniform("WorldMatrix", UniformKind::Mat4)
                .uniform("ViewProjMatrix", UniformKind::Mat4)
                .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
                .fragment(|_, _| Some(Vec4::ONE))
                .build()
                .unwrap(),
        )
    }

    fn counting_setup(calls: Rc<RefCell<Vec<bool>>>) -> TransformSetupFn {
        Box::new(move |_, _, _, changed| calls.borrow_mut().push(changed))
    }

    fn drawcall(program: &Rc<ShaderProgram>) -> DrawcallInfo {
        DrawcallInfo::new(
            Rc::new(Mesh::fullscreen_triangle()),
            0,
            Material::new(Rc::clone(program)).into_shared(),
            Mat4::IDENTITY,
        )
    }

    #[test]
    fn camera_changed_is_reported_once_per_change() {
        let program = program();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.register_shader_program(&program, counting_setup(Rc::clone(&calls)), None);
        let drawcall = drawcall(&program);

        renderer.set_current_camera(Camera::default());
        renderer.prepare_drawcall(&drawcall);
        renderer.prepare_drawcall(&drawcall);
        renderer.prepare_drawcall(&drawcall);
        renderer.set_current_camera(Camera::default().at(1.0, 0.0, 0.0));
        renderer.prepare_drawcall(&drawcall);
        renderer.prepare_drawcall(&drawcall);

        assert_eq!(*calls.borrow(), [true, false, false, true, false]);
    }

    #[test]
    fn first_prepare_reports_a_change_without_a_camera_update() {
        let program = program();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.register_shader_program(&program, counting_setup(Rc::clone(&calls)), None);
        renderer.prepare_drawcall(&drawcall(&program));
        assert_eq!(*calls.borrow(), [true]);
    }

    #[test]
    fn unregistered_programs_still_bind_their_material() {
        let program = program();
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.prepare_drawcall(&drawcall(&program));
        let bound = renderer.device().current_program().map(|p| p.id());
        assert_eq!(bound, Some(program.id()));
    }

    #[test]
    fn collections_are_created_on_demand_and_cleared_after_render() {
        let program = program();
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.add_drawcall(2, drawcall(&program));
        renderer.add_light(LightDescriptor::directional(Vec3::NEG_Y));
        assert!(renderer.drawcalls(0).is_empty());
        assert_eq!(renderer.drawcalls(2).len(), 1);
        assert!(renderer.drawcalls(7).is_empty());

        renderer.render();
        assert!(renderer.drawcalls(2).is_empty());
        assert!(renderer.lights().is_empty());
    }

    #[test]
    fn add_model_emits_one_drawcall_per_submesh() {
        let program = program();
        let mut mesh = Mesh::fullscreen_triangle();
        mesh.add_submesh(Mesh::plane(1.0).submeshes()[0].clone());
        let first = Material::new(Rc::clone(&program)).into_shared();
        let model = Model::new(Rc::new(mesh), Rc::clone(&first));

        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.add_model(&model, Mat4::from_translation(Vec3::X), 0);

        let drawcalls = renderer.drawcalls(0);
        assert_eq!(drawcalls.len(), 2);
        assert_eq!(drawcalls[1].submesh, 1);
        assert!(Rc::ptr_eq(&drawcalls[1].material, &first));
        assert_eq!(drawcalls[0].world_matrix, Mat4::from_translation(Vec3::X));
    }

    #[test]
    fn subsequent_light_batches_add_without_writing_depth() {
        let mut renderer = Renderer::new(Device::software(2, 2));
        let material = Material::new(program());
        let context = renderer.context_mut();

        context.set_lighting_render_states(true, &material);
        assert!(!context.device().is_feature_enabled(Feature::Blend));
        assert!(context.device().depth_write_enabled());

        context.set_lighting_render_states(false, &material);
        let device = context.device();
        assert!(device.is_feature_enabled(Feature::Blend));
        assert_eq!(device.blend_state(), BlendState::additive());
        assert!(!device.depth_write_enabled());
        assert_eq!(device.depth_function(), DepthFunction::LessEqual);
    }
}
