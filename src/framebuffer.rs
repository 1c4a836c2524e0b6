//! Render-target bundles of colour and depth attachments.

use std::rc::Rc;

use crate::texture::Texture;

/// Failure to assemble a complete framebuffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramebufferError {
    #[error("framebuffer `{label}` has no attachments")]
    NoAttachments { label: String },
    #[error("framebuffer `{label}` attachments differ in size: colour {color:?}, depth {depth:?}")]
    SizeMismatch {
        label: String,
        color: (u32, u32),
        depth: (u32, u32),
    },
    #[error("framebuffer `{label}`: texture `{texture}` has the wrong format for its attachment")]
    WrongFormat { label: String, texture: String },
}

/// A set of attachments a pass can render into.
///
/// Attachments are shared: a later pass reads them as ordinary material textures.
#[derive(Debug)]
pub struct Framebuffer {
    label: String,
    color: Option<Rc<Texture>>,
    depth: Option<Rc<Texture>>,
}

impl Framebuffer {
    pub fn builder(label: impl Into<String>) -> FramebufferBuilder {
        FramebufferBuilder {
            label: label.into(),
            color: None,
            depth: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn color_texture(&self) -> Option<&Rc<Texture>> {
        self.color.as_ref()
    }

    pub fn depth_texture(&self) -> Option<&Rc<Texture>> {
        self.depth.as_ref()
    }

    /// Size of the attachments.
    pub fn size(&self) -> (u32, u32) {
        self.color
            .as_ref()
            .or(self.depth.as_ref())
            .map(|texture| texture.size())
            .unwrap_or((0, 0))
    }

    /// Re-runs the completeness check, e.g. after attachments were resized.
    pub fn check_status(&self) -> Result<(), FramebufferError> {
        check(&self.label, self.color.as_deref(), self.depth.as_deref())
    }
}

pub struct FramebufferBuilder {
    label: String,
    color: Option<Rc<Texture>>,
    depth: Option<Rc<Texture>>,
}

impl FramebufferBuilder {
    pub fn color(mut self, texture: Rc<Texture>) -> Self {
        self.color = Some(texture);
        self
    }

    pub fn depth(mut self, texture: Rc<Texture>) -> Self {
        self.depth = Some(texture);
        self
    }

    pub fn build(self) -> Result<Framebuffer, FramebufferError> {
        check(&self.label, self.color.as_deref(), self.depth.as_deref())?;
        Ok(Framebuffer {
            label: self.label,
            color: self.color,
            depth: self.depth,
        })
    }
}

fn check(
    label: &str,
    color: Option<&Texture>,
    depth: Option<&Texture>,
) -> Result<(), FramebufferError> {
    for (texture, wants_depth) in [(color, false), (depth, true)] {
        if let Some(texture) = texture.filter(|t| t.format().is_depth() != wants_depth) {
            return Err(FramebufferError::WrongFormat {
                label: label.to_string(),
                texture: texture.label().to_string(),
            });
        }
    }
    match (color, depth) {
        (None, None) => Err(FramebufferError::NoAttachments {
            label: label.to_string(),
        }),
        (Some(color), Some(depth)) if color.size() != depth.size() => {
            Err(FramebufferError::SizeMismatch {
                label: label.to_string(),
                color: color.size(),
                depth: depth.size(),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureFormat;

    fn texture(w: u32, h: u32, format: TextureFormat) -> Rc<Texture> {
        Rc::new(Texture::new("t", w, h, format))
    }

    #[test]
    fn complete_framebuffer_builds() {
        let fb = Framebuffer::builder("scene")
            .color(texture(4, 3, TextureFormat::Rgba32F))
            .depth(texture(4, 3, TextureFormat::Depth32F))
            .build()
            .unwrap();
        assert_eq!(fb.size(), (4, 3));
        assert!(fb.check_status().is_ok());
    }

    #[test]
    fn incomplete_framebuffers_are_rejected() {
        assert!(matches!(
            Framebuffer::builder("empty").build(),
            Err(FramebufferError::NoAttachments { .. })
        ));
        assert!(matches!(
            Framebuffer::builder("mismatch")
                .color(texture(4, 3, TextureFormat::Rgba32F))
                .depth(texture(2, 3, TextureFormat::Depth32F))
                .build(),
            Err(FramebufferError::SizeMismatch { .. })
        ));
        assert!(matches!(
            Framebuffer::builder("format")
                .color(texture(4, 3, TextureFormat::Depth32F))
                .build(),
            Err(FramebufferError::WrongFormat { .. })
        ));
    }

    #[test]
    fn depth_only_is_complete() {
        let fb = Framebuffer::builder("shadow")
            .depth(texture(8, 8, TextureFormat::Depth32F))
            .build()
            .unwrap();
        assert_eq!(fb.size(), (8, 8));
        assert!(fb.color_texture().is_none());
    }
}
