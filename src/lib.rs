//! # itugl
//!
//! **A forward renderer with light batching and post-processing, on a GL-style device backed
//! by wgpu.**
//!
//! A [`Renderer`] owns a [`Device`] and an ordered list of [`RenderPass`]es. Every frame the
//! application hands it a camera, drawcalls and lights, and [`Renderer::render`] runs the
//! passes in order:
//!
//! - [`ForwardRenderPass`] draws each drawcall once per batch of lights, adding later batches
//!   on top of the first
//! - [`OffscreenRenderPass`] does the same into its own colour and depth textures
//! - [`SkyboxRenderPass`] fills whatever the geometry left uncovered
//! - [`PostFxRenderPass`] runs a fullscreen material over the previous pass's output
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::rc::Rc;
//! use itugl::*;
//!
//! fn main() -> Result<(), AppError> {
//!     run(AppConfig::new().title("Lit sphere"), |ctx| {
//!         let program = Rc::new(programs::lit(4)?);
//!         ctx.renderer.register_shader_program(
//!             &program,
//!             programs::standard_transform_setup(&program),
//!             Some(batched_light_update(&program)),
//!         );
//!         ctx.renderer.add_render_pass(ForwardRenderPass::new());
//!
//!         let mut material = Material::new(program);
//!         material.set_uniform_value("Color", Vec4::new(0.8, 0.3, 0.2, 1.0));
//!         let sphere = Model::new(Rc::new(Mesh::sphere(32, 16)), material.into_shared());
//!
//!         Ok(move |frame: &mut Frame| {
//!             let camera = Camera::new().at(0.0, 1.0, 3.0).looking_at(0.0, 0.0, 0.0);
//!             frame.renderer.set_current_camera(camera.with_aspect(frame.aspect()));
//!             frame.renderer.add_model(&sphere, Mat4::IDENTITY, 0);
//!             frame.renderer.add_light(LightDescriptor::directional(Vec3::NEG_Y));
//!         })
//!     })
//! }
//! ```
//!
//! ## Philosophy
//!
//! - **Materials own their state.** Binding a material re-applies its program, uniforms, blend
//!   and depth-write state, so nothing leaks from one drawcall into the next.
//! - **Passes restore what they change.** Render state a pass toggles is put back afterwards.
//! - **Shader programs are WGSL.** Uniforms are declared by name and kind and become one
//!   uniform block. Programs may also carry host closures for the software [`Backend`]; see
//!   [`programs`] for the built-in set.

mod app;
mod camera;
mod device;
mod framebuffer;
mod gpu;
mod light;
mod material;
mod mesh;
mod present;
pub mod programs;
mod renderer;
pub mod scene;
mod shader;
mod texture;

pub use app::{AppConfig, AppError, Frame, SetupContext, run, run_headless};
pub use camera::Camera;
pub use device::{
    Backend, BlendEquation, BlendFactor, BlendState, DepthFunction, Device, DeviceStats, DrawRecord,
    Feature, HardwareError, RenderStateSnapshot,
};
pub use framebuffer::{Framebuffer, FramebufferBuilder, FramebufferError};
pub use gpu::{GpuContext, GpuDevice, GpuError};
pub use light::{LightCollection, LightDescriptor, LightKind, batched_light_update};
pub use material::{Material, SharedMaterial};
pub use mesh::{Mesh, Model, Submesh, Transform, Vertex3d};
pub use present::Presenter;
pub use renderer::{
    DrawcallInfo, ForwardRenderPass, LightUpdateFn, OffscreenRenderPass, PostFxRenderPass,
    RenderContext, RenderPass, Renderer, SkyboxRenderPass, TransformSetupFn,
};
pub use shader::{
    FragmentInput, FromUniform, MAX_VARYINGS, ProgramId, ShaderError, ShaderProgram,
    ShaderProgramBuilder, UniformDeclaration, UniformError, UniformKind, UniformLocation,
    UniformValue, Uniforms, Varyings, VertexOutput,
};
pub use texture::{
    ColorSpace, Filter, Texture, TextureError, TextureFormat, Wrap, hash, linear_to_srgb,
    srgb_to_linear,
};

// Re-export glam math types for convenience
pub use glam::{Mat3, Mat4, Quat, Vec2, Vec3, Vec4};

// ECS support
pub use hecs::{Entity, World};
