//! Fullscreen post-processing passes.

use std::rc::Rc;

use crate::device::Feature;
use crate::framebuffer::Framebuffer;
use crate::material::SharedMaterial;
use crate::renderer::{RenderContext, RenderPass};

/// Draws the shared fullscreen triangle with one material.
///
/// The material's program typically samples the textures an earlier pass rendered into.
/// Depth testing and sRGB conversion are off while the triangle is drawn. The render state
/// the material applies (blending and depth writes) is put back afterwards as well.
///
/// Chaining passes through framebuffers builds multi-stage effects:
///
/// ```ignore
/// // scene -> fog (framebuffer B) -> copy -> screen
/// renderer.add_render_pass(PostFxRenderPass::new(fog_material).with_target(fog_framebuffer));
/// renderer.add_render_pass(PostFxRenderPass::new(copy_material));
/// ```
pub struct PostFxRenderPass {
    label: String,
    material: SharedMaterial,
    target: Option<Rc<Framebuffer>>,
}

impl PostFxRenderPass {
    /// A pass drawing `material` into the backbuffer.
    pub fn new(material: SharedMaterial) -> Self {
        let label = format!("postfx `{}`", material.borrow().shader_program().name());
        Self {
            label,
            material,
            target: None,
        }
    }

    pub fn with_target(mut self, framebuffer: Rc<Framebuffer>) -> Self {
        self.target = Some(framebuffer);
        self
    }

    pub fn material(&self) -> &SharedMaterial {
        &self.material
    }
}

impl RenderPass for PostFxRenderPass {
    fn render(&mut self, ctx: &mut RenderContext) {
        let fullscreen = Rc::clone(ctx.fullscreen_mesh());
        let material = self.material.borrow();
        let device = ctx.device_mut();
        let saved = device.save_state();
        material.bind(device);
        device.with_features(
            &[(Feature::FramebufferSrgb, false), (Feature::DepthTest, false)],
            |device| device.draw(&fullscreen, 0),
        );
        device.restore_state(saved);
    }

    fn target_framebuffer(&self) -> Option<Rc<Framebuffer>> {
        self.target.clone()
    }

    fn resize(&mut self, width: u32, height: u32) {
        let Some(target) = &self.target else {
            return;
        };
        for texture in [target.color_texture(), target.depth_texture()]
            .into_iter()
            .flatten()
        {
            texture.resize(width, height);
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlendState, Device};
    use crate::material::Material;
    use crate::renderer::Renderer;
    use crate::shader::{ShaderProgram, VertexOutput};
    use crate::texture::{Texture, TextureFormat};
    use glam::{Vec3, Vec4};

    fn material() -> SharedMaterial {
        let program = ShaderProgram::builder("fill")
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|_, _| Some(Vec4::new(0.5, 0.5, 0.5, 1.0)))
            .build()
            .unwrap();
        Material::new(Rc::new(program)).into_shared()
    }

    #[test]
    fn restores_depth_test_and_srgb_for_every_combination() {
        for depth_test in [false, true] {
            for srgb in [false, true] {
                let mut renderer = Renderer::new(Device::software(2, 2));
                renderer.add_render_pass(PostFxRenderPass::new(material()));
                let device = renderer.device_mut();
                device.set_feature_enabled(Feature::DepthTest, depth_test);
                device.set_feature_enabled(Feature::FramebufferSrgb, srgb);

                renderer.render();

                let device = renderer.device();
                assert_eq!(device.is_feature_enabled(Feature::DepthTest), depth_test);
                assert_eq!(device.is_feature_enabled(Feature::FramebufferSrgb), srgb);
                assert!(!device.draw_history()[0].depth_test);
                // sRGB conversion was off during the draw.
                assert_eq!(device.read_pixel(0, 0).x, 0.5);
            }
        }
    }

    #[test]
    fn restores_blending_and_depth_writes_changed_by_the_material() {
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.add_render_pass(PostFxRenderPass::new(material()));
        let device = renderer.device_mut();
        device.enable_feature(Feature::Blend);
        device.set_blend_state(BlendState::alpha());
        device.set_depth_write_enabled(false);
        let before = device.save_state();

        renderer.render();

        let record = &renderer.device().draw_history()[0];
        // The opaque material turned blending off and depth writes on for its draw.
        assert!(!record.blend_enabled);
        assert!(record.depth_write);
        assert_eq!(renderer.device().save_state(), before);
        assert_eq!(renderer.device().read_pixel(1, 0), Vec4::new(0.5, 0.5, 0.5, 1.0));
    }

    #[test]
    fn draws_into_its_target() {
        let color = Rc::new(Texture::new("fx", 2, 2, TextureFormat::Rgba32F));
        let target = Rc::new(
            Framebuffer::builder("fx")
                .color(Rc::clone(&color))
                .build()
                .unwrap(),
        );
        let mut renderer = Renderer::new(Device::software(2, 2));
        renderer.add_render_pass(PostFxRenderPass::new(material()).with_target(target));
        renderer.render();

        assert_eq!(color.fetch(1, 1), Vec4::new(0.5, 0.5, 0.5, 1.0));
        assert_eq!(renderer.device().read_pixel(1, 1), Vec4::ZERO);
        assert!(renderer.device().bound_framebuffer().is_none());

        renderer.resize(4, 3);
        assert_eq!(color.size(), (4, 3));
    }
}
