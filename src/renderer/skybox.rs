//! Environment background pass.

use std::rc::Rc;

use crate::device::{DepthFunction, Feature};
use crate::framebuffer::Framebuffer;
use crate::material::Material;
use crate::programs;
use crate::renderer::{RenderContext, RenderPass};
use crate::shader::ShaderError;
use crate::texture::Texture;

/// Fills every pixel no geometry covered with an equirectangular environment.
///
/// Drawn after the opaque geometry into the same target: the fullscreen triangle sits on the
/// far plane and is depth tested with `LessEqual` against the scene depth, without writing
/// depth or blending. Render state is restored afterwards.
pub struct SkyboxRenderPass {
    material: Material,
    target: Option<Rc<Framebuffer>>,
}

impl SkyboxRenderPass {
    pub fn new(environment: Rc<Texture>) -> Result<Self, ShaderError> {
        let mut material = Material::new(Rc::new(programs::skybox()?));
        material.set_uniform_value("EnvironmentTexture", environment);
        Ok(Self {
            material,
            target: None,
        })
    }

    pub fn with_target(mut self, framebuffer: Rc<Framebuffer>) -> Self {
        self.target = Some(framebuffer);
        self
    }

    pub fn set_environment(&mut self, environment: Rc<Texture>) {
        self.material
            .set_uniform_value("EnvironmentTexture", environment);
    }
}

impl RenderPass for SkyboxRenderPass {
    fn render(&mut self, ctx: &mut RenderContext) {
        let inverse = ctx.camera().view_projection_matrix().inverse();
        self.material.set_uniform_value("InvViewProjMatrix", inverse);
        let fullscreen = Rc::clone(ctx.fullscreen_mesh());

        let device = ctx.device_mut();
        let saved = device.save_state();
        self.material.bind(device);
        device.enable_feature(Feature::DepthTest);
        device.disable_feature(Feature::Blend);
        device.set_depth_function(DepthFunction::LessEqual);
        device.set_depth_write_enabled(false);
        device.draw(&fullscreen, 0);
        device.restore_state(saved);
    }

    fn target_framebuffer(&self) -> Option<Rc<Framebuffer>> {
        self.target.clone()
    }

    fn name(&self) -> &str {
        "skybox"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::device::Device;
    use crate::renderer::Renderer;
    use glam::Vec4;

    #[test]
    fn fills_only_uncovered_pixels() {
        let sky = Vec4::new(0.2, 0.4, 0.8, 1.0);
        let mut renderer = Renderer::new(Device::software(4, 4));
        renderer.add_render_pass(
            SkyboxRenderPass::new(Rc::new(Texture::solid("sky", sky))).unwrap(),
        );
        renderer.set_current_camera(Camera::new());

        let device = renderer.device_mut();
        device.clear(Some(Vec4::ZERO), Some(1.0));
        // Pretend geometry covered the top-left pixel.
        device.screen_depth().texels_mut().put_pixel(0, 0, image::Rgba([0.5, 0.5, 0.5, 1.0]));

        let before = renderer.device().save_state();
        renderer.render();

        let device = renderer.device();
        assert_eq!(device.read_pixel(0, 0), Vec4::ZERO);
        assert_eq!(device.read_pixel(3, 3), sky);
        assert_eq!(device.screen_depth().fetch(3, 3).x, 1.0);
        assert_eq!(device.save_state(), before);
    }
}
