//! A forward pass into its own colour and depth textures.

use std::rc::Rc;

use glam::Vec4;

use crate::framebuffer::{Framebuffer, FramebufferError};
use crate::renderer::{ForwardRenderPass, RenderContext, RenderPass};
use crate::texture::{Filter, Texture, TextureFormat};

/// Renders a drawcall collection into an owned framebuffer.
///
/// The colour and depth textures are exposed so later passes can sample them. Both are
/// cleared at the start of every frame and re-specified when the render size changes.
///
/// # Example
///
/// ```ignore
/// let scene = OffscreenRenderPass::new("scene", width, height)?;
/// let scene_color = Rc::clone(scene.color_texture());
/// renderer.add_render_pass(scene);
///
/// let mut copy = Material::new(Rc::new(programs::copy()?));
/// copy.set_uniform_value("SourceTexture", scene_color);
/// renderer.add_render_pass(PostFxRenderPass::new(copy.into_shared()));
/// ```
pub struct OffscreenRenderPass {
    label: String,
    forward: ForwardRenderPass,
    color: Rc<Texture>,
    depth: Rc<Texture>,
    framebuffer: Rc<Framebuffer>,
    clear_color: Vec4,
}

impl OffscreenRenderPass {
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Result<Self, FramebufferError> {
        let label = label.into();
        let color = Rc::new(
            Texture::new(format!("{label} color"), width, height, TextureFormat::Rgba32F)
                .with_filter(Filter::Nearest),
        );
        let depth = Rc::new(
            Texture::new(format!("{label} depth"), width, height, TextureFormat::Depth32F)
                .with_filter(Filter::Nearest),
        );
        let framebuffer = Framebuffer::builder(label.clone())
            .color(Rc::clone(&color))
            .depth(Rc::clone(&depth))
            .build()?;

        Ok(Self {
            label,
            forward: ForwardRenderPass::new(),
            color,
            depth,
            framebuffer: Rc::new(framebuffer),
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
        })
    }

    pub fn with_collection(mut self, collection: usize) -> Self {
        self.forward = self.forward.with_collection(collection);
        self
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    pub fn color_texture(&self) -> &Rc<Texture> {
        &self.color
    }

    pub fn depth_texture(&self) -> &Rc<Texture> {
        &self.depth
    }

    pub fn framebuffer(&self) -> &Rc<Framebuffer> {
        &self.framebuffer
    }
}

impl RenderPass for OffscreenRenderPass {
    fn render(&mut self, ctx: &mut RenderContext) {
        ctx.device_mut().clear(Some(self.clear_color), Some(1.0));
        self.forward.draw_collection(ctx);
    }

    fn target_framebuffer(&self) -> Option<Rc<Framebuffer>> {
        Some(Rc::clone(&self.framebuffer))
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.color.resize(width, height);
        self.depth.resize(width, height);
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::material::Material;
    use crate::mesh::Mesh;
    use crate::renderer::{DrawcallInfo, Renderer};
    use crate::shader::{ShaderProgram, VertexOutput};
    use glam::{Mat4, Vec3};

    #[test]
    fn renders_into_its_own_textures() {
        let green = Vec4::new(0.0, 1.0, 0.0, 1.0);
        let program = Rc::new(
            ShaderProgram::builder("green")
                .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
                .fragment(move |_, _| Some(green))
                .build()
                .unwrap(),
        );
        let pass = OffscreenRenderPass::new("scene", 4, 4)
            .unwrap()
            .with_clear_color(Vec4::new(0.0, 0.0, 1.0, 1.0));
        let color = Rc::clone(pass.color_texture());
        let depth = Rc::clone(pass.depth_texture());

        let mut renderer = Renderer::new(Device::software(4, 4));
        renderer.add_render_pass(pass);
        renderer.add_drawcall(
            0,
            DrawcallInfo::new(
                Rc::new(Mesh::fullscreen_triangle()),
                0,
                Material::new(Rc::clone(&program)).into_shared(),
                Mat4::IDENTITY,
            ),
        );
        renderer.render();

        assert_eq!(color.fetch(0, 0), green);
        assert_eq!(color.fetch(3, 3), green);
        assert_eq!(depth.fetch(0, 0).x, 0.5);
        assert_eq!(renderer.device().read_pixel(0, 0), Vec4::ZERO);
        assert_eq!(
            renderer.device().draw_history()[0].target.as_deref(),
            Some("scene")
        );
    }

    #[test]
    fn resize_respecifies_both_attachments() {
        let mut pass = OffscreenRenderPass::new("scene", 4, 4).unwrap();
        pass.resize(8, 2);
        assert_eq!(pass.color_texture().size(), (8, 2));
        assert_eq!(pass.depth_texture().size(), (8, 2));
        assert!(pass.framebuffer().check_status().is_ok());
    }
}
