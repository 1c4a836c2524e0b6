//! The render pass trait.

use std::rc::Rc;

use crate::framebuffer::Framebuffer;
use crate::renderer::RenderContext;

/// One stage of the frame.
///
/// The renderer binds [`target_framebuffer`](RenderPass::target_framebuffer) before calling
/// [`render`](RenderPass::render), so a pass only establishes its own depth and blend state.
/// Any device feature a pass toggles must be back at its previous value when `render` returns.
///
/// # Implementing Custom Passes
///
/// ```ignore
/// struct ClearPass(Vec4);
///
/// impl RenderPass for ClearPass {
///     fn render(&mut self, ctx: &mut RenderContext) {
///         ctx.device_mut().clear(Some(self.0), Some(1.0));
///     }
/// }
/// ```
pub trait RenderPass {
    fn render(&mut self, ctx: &mut RenderContext);

    /// Framebuffer this pass draws into. `None` is the backbuffer.
    fn target_framebuffer(&self) -> Option<Rc<Framebuffer>> {
        None
    }

    /// Called when the render size changes, before the next frame is rendered.
    fn resize(&mut self, _width: u32, _height: u32) {}

    /// Name used in logs.
    fn name(&self) -> &str {
        "render pass"
    }
}
