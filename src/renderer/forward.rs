//! Forward rendering with light batches.

use std::rc::Rc;

use crate::device::Feature;
use crate::framebuffer::Framebuffer;
use crate::renderer::{RenderContext, RenderPass};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LightBatch {
    First,
    Subsequent,
    Done,
}

/// Draws one drawcall collection, once per light batch per drawcall.
///
/// For each drawcall, in collection order:
///
/// 1. The material is bound and the transform uniforms are pushed
///    ([`RenderContext::prepare_drawcall`]).
/// 2. The program's light-update callback binds the next batch of lights. The first batch
///    draws with the material's own state. Every later batch is added on top with additive
///    blending and depth writes off.
/// 3. When the callback reports that no light was bound, the drawcall is done. A drawcall
///    that gets no light at all is still drawn once, for its unlit or ambient contribution.
///
/// The device render state is saved on entry and restored on exit. Depth testing is enabled
/// for the duration of the pass.
pub struct ForwardRenderPass {
    collection: usize,
    target: Option<Rc<Framebuffer>>,
}

impl ForwardRenderPass {
    /// A pass over collection 0 that draws into the backbuffer.
    pub fn new() -> Self {
        Self {
            collection: 0,
            target: None,
        }
    }

    pub fn with_collection(mut self, collection: usize) -> Self {
        self.collection = collection;
        self
    }

    pub fn with_target(mut self, framebuffer: Rc<Framebuffer>) -> Self {
        self.target = Some(framebuffer);
        self
    }

    pub fn collection(&self) -> usize {
        self.collection
    }

    /// Draws the collection into whatever target is currently bound.
    pub(crate) fn draw_collection(&self, ctx: &mut RenderContext) {
        let saved = ctx.device().save_state();
        ctx.device_mut().enable_feature(Feature::DepthTest);

        let drawcalls = ctx.drawcalls(self.collection).to_vec();
        for drawcall in &drawcalls {
            ctx.prepare_drawcall(drawcall);

            let material = drawcall.material.borrow();
            let program = Rc::clone(material.shader_program());
            let mut light_index = 0;
            let mut batch = LightBatch::First;

            while batch != LightBatch::Done {
                let start = light_index;
                let bound = ctx.update_lights(&program, &mut light_index);
                let first = batch == LightBatch::First;

                if bound || first {
                    ctx.set_lighting_render_states(first, &material);
                    drawcall.draw(ctx.device_mut());
                }

                batch = if !bound {
                    LightBatch::Done
                } else if light_index <= start {
                    log::warn!(
                        "light update for `{}` bound lights without advancing; stopping",
                        program.name()
                    );
                    LightBatch::Done
                } else {
                    LightBatch::Subsequent
                };
            }
        }

        ctx.device_mut().restore_state(saved);
    }
}

impl Default for ForwardRenderPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass for ForwardRenderPass {
    fn render(&mut self, ctx: &mut RenderContext) {
        self.draw_collection(ctx);
    }

    fn target_framebuffer(&self) -> Option<Rc<Framebuffer>> {
        self.target.clone()
    }

    fn name(&self) -> &str {
        "forward"
    }
}
