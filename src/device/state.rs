//! Fixed-function render state: feature toggles, depth comparison and blending.
//!
//! Given two pixels *src* and *dst* (the fragment being written and the value already stored in
//! the target) blending scales each by a [`BlendFactor`] and combines them with a
//! [`BlendEquation`].

use glam::Vec4;

/// Device-global toggles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    DepthTest,
    Blend,
    /// Encode linear colour to sRGB when writing to the default framebuffer.
    FramebufferSrgb,
    /// Discard back-facing triangles.
    CullFace,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::DepthTest,
        Feature::Blend,
        Feature::FramebufferSrgb,
        Feature::CullFace,
    ];

    pub(crate) fn bit(self) -> u8 {
        match self {
            Feature::DepthTest => 1,
            Feature::Blend => 1 << 1,
            Feature::FramebufferSrgb => 1 << 2,
            Feature::CullFace => 1 << 3,
        }
    }
}

/// Depth comparison. `incoming` is the fragment depth, `stored` the value in the depth buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DepthFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl DepthFunction {
    pub fn passes(self, incoming: f32, stored: f32) -> bool {
        match self {
            DepthFunction::Never => false,
            DepthFunction::Less => incoming < stored,
            DepthFunction::Equal => incoming == stored,
            DepthFunction::LessEqual => incoming <= stored,
            DepthFunction::Greater => incoming > stored,
            DepthFunction::NotEqual => incoming != stored,
            DepthFunction::GreaterEqual => incoming >= stored,
            DepthFunction::Always => true,
        }
    }
}

/// How the scaled source and destination are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendEquation {
    /// `src * srcK + dst * dstK`
    #[default]
    Add,
    /// `src * srcK - dst * dstK`
    Subtract,
    /// `dst * dstK - src * srcK`
    ReverseSubtract,
    /// `min(src, dst)`
    Min,
    /// `max(src, dst)`
    Max,
}

/// Scale applied to a blend operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SourceColor,
    OneMinusSourceColor,
    DestinationColor,
    OneMinusDestinationColor,
    SourceAlpha,
    OneMinusSourceAlpha,
    DestinationAlpha,
    OneMinusDestinationAlpha,
}

impl BlendFactor {
    fn weight(self, src: Vec4, dst: Vec4) -> Vec4 {
        match self {
            BlendFactor::Zero => Vec4::ZERO,
            BlendFactor::One => Vec4::ONE,
            BlendFactor::SourceColor => src,
            BlendFactor::OneMinusSourceColor => Vec4::ONE - src,
            BlendFactor::DestinationColor => dst,
            BlendFactor::OneMinusDestinationColor => Vec4::ONE - dst,
            BlendFactor::SourceAlpha => Vec4::splat(src.w),
            BlendFactor::OneMinusSourceAlpha => Vec4::splat(1.0 - src.w),
            BlendFactor::DestinationAlpha => Vec4::splat(dst.w),
            BlendFactor::OneMinusDestinationAlpha => Vec4::splat(1.0 - dst.w),
        }
    }
}

/// Equation plus source and destination factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub equation: BlendEquation,
    pub source: BlendFactor,
    pub destination: BlendFactor,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            equation: BlendEquation::Add,
            source: BlendFactor::One,
            destination: BlendFactor::Zero,
        }
    }
}

impl BlendState {
    pub fn new(equation: BlendEquation, source: BlendFactor, destination: BlendFactor) -> Self {
        Self {
            equation,
            source,
            destination,
        }
    }

    /// Standard "over" compositing.
    pub fn alpha() -> Self {
        Self::new(
            BlendEquation::Add,
            BlendFactor::SourceAlpha,
            BlendFactor::OneMinusSourceAlpha,
        )
    }

    /// Sum of source and destination.
    pub fn additive() -> Self {
        Self::new(BlendEquation::Add, BlendFactor::One, BlendFactor::One)
    }

    pub fn blend(&self, src: Vec4, dst: Vec4) -> Vec4 {
        let s = src * self.source.weight(src, dst);
        let d = dst * self.destination.weight(src, dst);
        match self.equation {
            BlendEquation::Add => s + d,
            BlendEquation::Subtract => s - d,
            BlendEquation::ReverseSubtract => d - s,
            BlendEquation::Min => src.min(dst),
            BlendEquation::Max => src.max(dst),
        }
    }
}

/// Everything [`Device::save_state`](super::Device::save_state) captures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderStateSnapshot {
    pub(crate) features: u8,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
    pub blend: BlendState,
}

impl RenderStateSnapshot {
    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.features & feature.bit() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_blend_composites() {
        let src = Vec4::new(1.0, 0.0, 0.0, 0.25);
        let dst = Vec4::new(0.0, 0.0, 1.0, 1.0);
        let out = BlendState::alpha().blend(src, dst);
        assert_eq!(out, src * 0.25 + dst * 0.75);
    }

    #[test]
    fn default_blend_replaces() {
        let src = Vec4::new(0.1, 0.2, 0.3, 0.4);
        assert_eq!(BlendState::default().blend(src, Vec4::ONE), src);
    }

    #[test]
    fn subtract_and_min_max() {
        let src = Vec4::splat(0.75);
        let dst = Vec4::splat(0.25);
        let subtract = BlendState::new(BlendEquation::Subtract, BlendFactor::One, BlendFactor::One);
        let reverse = BlendState {
            equation: BlendEquation::ReverseSubtract,
            ..subtract
        };
        assert_eq!(subtract.blend(src, dst), Vec4::splat(0.5));
        assert_eq!(reverse.blend(src, dst), Vec4::splat(-0.5));
        let min = BlendState {
            equation: BlendEquation::Min,
            ..subtract
        };
        assert_eq!(min.blend(src, dst), dst);
    }

    #[test]
    fn depth_functions() {
        assert!(DepthFunction::Less.passes(0.4, 0.5));
        assert!(!DepthFunction::Less.passes(0.5, 0.5));
        assert!(DepthFunction::LessEqual.passes(0.5, 0.5));
        assert!(!DepthFunction::Never.passes(0.0, 1.0));
        assert!(DepthFunction::Always.passes(1.0, 0.0));
    }
}
