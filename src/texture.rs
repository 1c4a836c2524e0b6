//! Textures: colour and depth attachments, material inputs, loaded images.
//!
//! Host storage is an [`image::Rgba32FImage`] kept behind interior mutability, so a single
//! `Rc<Texture>` can be bound as a framebuffer attachment by one pass and sampled as a material
//! input by the next, and can be re-specified in place when the window is resized.
//!
//! When a GPU device draws with a texture it keeps a mirror of it in video memory. The two
//! copies are synchronized lazily: the GPU device uploads host changes before it uses the
//! mirror, and host reads download the mirror after the GPU has rendered into it.
//!
//! Depth textures keep the depth value in every colour channel, alpha is one.
//!
//! Texture coordinates follow the image layout: `v = 0` is the top row.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::path::Path;

use glam::{Vec2, Vec3, Vec4};
use image::{DynamicImage, Rgba, Rgba32FImage, RgbaImage};

use crate::device::GpuMirror;

/// Storage format of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    /// Four 32-bit float channels.
    Rgba32F,
    /// Single 32-bit float depth channel.
    Depth32F,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32F)
    }
}

/// Sampling filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Addressing mode for coordinates outside `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wrap {
    ClampToEdge,
    Repeat,
}

/// Colour space of source image data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    /// Values are used as-is.
    Linear,
    /// Values are decoded from sRGB to linear on load.
    Srgb,
}

/// Failure to create or save a texture.
#[derive(Debug, thiserror::Error)]
pub enum TextureError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("texture `{label}` has no texels")]
    EmptyImage { label: String },
}

/// A 2D texture.
pub struct Texture {
    label: String,
    format: TextureFormat,
    filter: Cell<Filter>,
    wrap: Cell<Wrap>,
    image: RefCell<Rgba32FImage>,
    feedback_warned: Cell<bool>,
    gpu: RefCell<Option<GpuMirror>>,
    /// The host copy changed since the mirror was last uploaded.
    gpu_stale: Cell<bool>,
    /// The mirror was rendered into since the host copy was last downloaded.
    host_stale: Cell<bool>,
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("Texture")
            .field("label", &self.label)
            .field("format", &self.format)
            .field("size", &(width, height))
            .field("filter", &self.filter.get())
            .field("wrap", &self.wrap.get())
            .field("gpu_resident", &self.gpu.borrow().is_some())
            .finish()
    }
}

impl Texture {
    /// Creates a zero-filled texture. Zero dimensions are raised to one texel.
    pub fn new(label: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        Self::from_image(label.into(), format, Rgba32FImage::new(width.max(1), height.max(1)))
    }

    /// Creates a colour texture by evaluating `f` at every texel.
    pub fn from_fn(
        label: impl Into<String>,
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> Vec4,
    ) -> Self {
        let image = Rgba32FImage::from_fn(width.max(1), height.max(1), |x, y| {
            Rgba(f(x, y).to_array())
        });
        Self::from_image(label.into(), TextureFormat::Rgba32F, image)
    }

    /// A 1x1 texture of a single colour.
    pub fn solid(label: impl Into<String>, color: Vec4) -> Self {
        Self::from_fn(label, 1, 1, |_, _| color)
    }

    /// Converts a decoded image, decoding sRGB data to linear when asked to.
    pub fn from_dynamic_image(
        label: impl Into<String>,
        source: &DynamicImage,
        color_space: ColorSpace,
    ) -> Result<Self, TextureError> {
        let label = label.into();
        if source.width() == 0 || source.height() == 0 {
            return Err(TextureError::EmptyImage { label });
        }

        let mut image = source.to_rgba32f();
        if color_space == ColorSpace::Srgb {
            for pixel in image.pixels_mut() {
                for channel in &mut pixel.0[..3] {
                    *channel = srgb_to_linear(*channel);
                }
            }
        }
        Ok(Self::from_image(label, TextureFormat::Rgba32F, image))
    }

    /// Loads an image file.
    pub fn load(path: impl AsRef<Path>, color_space: ColorSpace) -> Result<Self, TextureError> {
        let path = path.as_ref();
        let source = image::open(path)?;
        let texture = Self::from_dynamic_image(path.display().to_string(), &source, color_space)?;
        log::debug!(
            "loaded texture `{}` ({}x{})",
            texture.label,
            texture.width(),
            texture.height()
        );
        Ok(texture)
    }

    /// Generates a blocky hash-noise texture from a colour palette.
    ///
    /// Each texel picks a palette entry and gets a small brightness variation, so the
    /// result tiles well under [`Wrap::Repeat`]. Palette colours are linear.
    pub fn noise(label: impl Into<String>, size: u32, seed: u32, palette: &[Vec3]) -> Self {
        let palette = if palette.is_empty() {
            &[Vec3::ONE][..]
        } else {
            palette
        };
        Self::from_fn(label, size, size, |x, y| {
            let base = palette[(hash(x, y, seed) % palette.len() as u32) as usize];
            let variation = ((hash(x + 1000, y + 1000, seed) % 30) as f32 - 15.0) / 255.0;
            (base + Vec3::splat(variation))
                .clamp(Vec3::ZERO, Vec3::ONE)
                .extend(1.0)
        })
        .with_wrap(Wrap::Repeat)
    }

    fn from_image(label: String, format: TextureFormat, image: Rgba32FImage) -> Self {
        Self {
            label,
            format,
            filter: Cell::new(Filter::Linear),
            wrap: Cell::new(Wrap::ClampToEdge),
            image: RefCell::new(image),
            feedback_warned: Cell::new(false),
            gpu: RefCell::new(None),
            gpu_stale: Cell::new(true),
            host_stale: Cell::new(false),
        }
    }

    pub fn with_filter(self, filter: Filter) -> Self {
        self.filter.set(filter);
        self
    }

    pub fn with_wrap(self, wrap: Wrap) -> Self {
        self.wrap.set(wrap);
        self
    }

    pub fn set_filter(&self, filter: Filter) {
        self.filter.set(filter);
    }

    pub fn set_wrap(&self, wrap: Wrap) {
        self.wrap.set(wrap);
    }

    pub fn filter(&self) -> Filter {
        self.filter.get()
    }

    pub fn wrap(&self) -> Wrap {
        self.wrap.get()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.size().0
    }

    pub fn height(&self) -> u32 {
        self.size().1
    }

    pub fn size(&self) -> (u32, u32) {
        self.image.borrow().dimensions()
    }

    /// Re-specifies the storage at a new size. Contents are reset.
    pub fn resize(&self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if self.size() == (width, height) {
            return;
        }
        *self.image.borrow_mut() = Rgba32FImage::new(width, height);
        self.gpu.borrow_mut().take();
        self.gpu_stale.set(true);
        self.host_stale.set(false);
        log::debug!("resized texture `{}` to {}x{}", self.label, width, height);
    }

    /// Sets every texel to `value`.
    pub fn fill(&self, value: Vec4) {
        let value = Rgba(value.to_array());
        for pixel in self.image.borrow_mut().pixels_mut() {
            *pixel = value;
        }
        self.host_stale.set(false);
        self.gpu_stale.set(true);
    }

    /// Texel fetch with clamped integer coordinates.
    pub fn fetch(&self, x: i32, y: i32) -> Vec4 {
        let Some(image) = self.read_for_sampling() else {
            return Vec4::ZERO;
        };
        let (width, height) = image.dimensions();
        let x = x.clamp(0, width as i32 - 1) as u32;
        let y = y.clamp(0, height as i32 - 1) as u32;
        Vec4::from_array(image.get_pixel(x, y).0)
    }

    /// Filtered sample at normalized coordinates.
    pub fn sample(&self, uv: Vec2) -> Vec4 {
        let Some(image) = self.read_for_sampling() else {
            return Vec4::ZERO;
        };
        let (width, height) = image.dimensions();
        let wrap = self.wrap.get();
        let texel = |x: i32, y: i32| {
            let x = wrap_coord(x, width, wrap);
            let y = wrap_coord(y, height, wrap);
            Vec4::from_array(image.get_pixel(x, y).0)
        };

        let x = uv.x * width as f32;
        let y = uv.y * height as f32;
        match self.filter.get() {
            Filter::Nearest => texel(x.floor() as i32, y.floor() as i32),
            Filter::Linear => {
                let x = x - 0.5;
                let y = y - 0.5;
                let (x0, y0) = (x.floor(), y.floor());
                let (tx, ty) = (x - x0, y - y0);
                let (x0, y0) = (x0 as i32, y0 as i32);
                let top = texel(x0, y0).lerp(texel(x0 + 1, y0), tx);
                let bottom = texel(x0, y0 + 1).lerp(texel(x0 + 1, y0 + 1), tx);
                top.lerp(bottom, ty)
            }
        }
    }

    /// Copy of the raw texels.
    pub fn to_rgba32f(&self) -> Rgba32FImage {
        self.texels().clone()
    }

    /// Quantizes to 8 bits per channel. Values are clamped, no transfer curve is applied.
    pub fn to_rgba8(&self) -> RgbaImage {
        let image = self.texels();
        RgbaImage::from_fn(image.width(), image.height(), |x, y| {
            let texel = Vec4::from_array(image.get_pixel(x, y).0);
            let bytes = (texel.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round();
            Rgba([bytes.x as u8, bytes.y as u8, bytes.z as u8, bytes.w as u8])
        })
    }

    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<(), TextureError> {
        self.to_rgba8().save(path)?;
        Ok(())
    }

    pub(crate) fn texels(&self) -> Ref<'_, Rgba32FImage> {
        self.sync_host();
        self.image.borrow()
    }

    /// Host texels for writing. The GPU mirror is re-uploaded before its next use.
    pub(crate) fn texels_mut(&self) -> RefMut<'_, Rgba32FImage> {
        self.sync_host();
        self.gpu_stale.set(true);
        self.image.borrow_mut()
    }

    pub(crate) fn gpu_mirror(&self) -> &RefCell<Option<GpuMirror>> {
        &self.gpu
    }

    pub(crate) fn is_gpu_stale(&self) -> bool {
        self.gpu_stale.get()
    }

    /// Marks the host copy as the newer one, e.g. for a freshly created mirror.
    pub(crate) fn mark_host_written(&self) {
        self.gpu_stale.set(true);
        self.host_stale.set(false);
    }

    /// Called by the GPU device once the mirror matches the host copy.
    pub(crate) fn mark_uploaded(&self) {
        self.gpu_stale.set(false);
    }

    /// Called by the GPU device after rendering into the mirror.
    pub(crate) fn mark_gpu_written(&self) {
        self.host_stale.set(true);
        self.gpu_stale.set(false);
    }

    pub(crate) fn warn_feedback(&self) {
        if !self.feedback_warned.replace(true) {
            log::warn!(
                "texture `{}` is sampled while bound as the draw target; reads return zero",
                self.label
            );
        }
    }

    /// Downloads the GPU mirror if it holds newer texels than the host.
    pub(crate) fn sync_host(&self) {
        if !self.host_stale.get() {
            return;
        }
        let Ok(mirror) = self.gpu.try_borrow() else {
            return;
        };
        let Some(mirror) = mirror.as_ref() else {
            self.host_stale.set(false);
            return;
        };
        let Ok(mut image) = self.image.try_borrow_mut() else {
            return;
        };
        match mirror.read_back() {
            Ok(texels) if texels.dimensions() == image.dimensions() => *image = texels,
            Ok(texels) => log::warn!(
                "texture `{}`: read back {:?} texels for a {:?} texture",
                self.label,
                texels.dimensions(),
                image.dimensions()
            ),
            Err(err) => log::warn!("texture `{}`: {err}", self.label),
        }
        self.host_stale.set(false);
    }

    fn read_for_sampling(&self) -> Option<Ref<'_, Rgba32FImage>> {
        self.sync_host();
        match self.image.try_borrow() {
            Ok(image) => Some(image),
            Err(_) => {
                self.warn_feedback();
                None
            }
        }
    }
}

fn wrap_coord(c: i32, size: u32, wrap: Wrap) -> u32 {
    match wrap {
        Wrap::ClampToEdge => c.clamp(0, size as i32 - 1) as u32,
        Wrap::Repeat => c.rem_euclid(size as i32) as u32,
    }
}

/// sRGB electro-optical transfer function.
pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Inverse of [`srgb_to_linear`].
pub fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Integer hash used by the procedural generators.
pub fn hash(x: u32, y: u32, seed: u32) -> u32 {
    let mut h = seed;
    h = h.wrapping_add(x.wrapping_mul(374761393));
    h = h.wrapping_add(y.wrapping_mul(668265263));
    h ^= h >> 13;
    h = h.wrapping_mul(1274126177);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> Texture {
        Texture::from_fn("checker", 2, 2, |x, y| {
            if (x + y) % 2 == 0 {
                Vec4::ONE
            } else {
                Vec4::new(0.0, 0.0, 0.0, 1.0)
            }
        })
    }

    #[test]
    fn nearest_sampling_picks_texels() {
        let texture = checker().with_filter(Filter::Nearest);
        assert_eq!(texture.sample(Vec2::new(0.25, 0.25)), Vec4::ONE);
        assert_eq!(
            texture.sample(Vec2::new(0.75, 0.25)),
            Vec4::new(0.0, 0.0, 0.0, 1.0)
        );
    }

    #[test]
    fn linear_sampling_blends_neighbours() {
        let texture = checker();
        let centre = texture.sample(Vec2::new(0.5, 0.5));
        assert!((centre.x - 0.5).abs() < 1e-6);
        assert!((centre.w - 1.0).abs() < 1e-6);
    }

    #[test]
    fn repeat_wraps_coordinates() {
        let texture = checker().with_filter(Filter::Nearest).with_wrap(Wrap::Repeat);
        assert_eq!(
            texture.sample(Vec2::new(1.25, 0.25)),
            texture.sample(Vec2::new(0.25, 0.25))
        );
        assert_eq!(
            texture.sample(Vec2::new(-0.25, 0.25)),
            texture.sample(Vec2::new(0.75, 0.25))
        );
    }

    #[test]
    fn fetch_clamps() {
        let texture = checker();
        assert_eq!(texture.fetch(-4, -4), texture.fetch(0, 0));
        assert_eq!(texture.fetch(9, 0), texture.fetch(1, 0));
    }

    #[test]
    fn resize_respecifies_storage() {
        let texture = Texture::new("target", 4, 4, TextureFormat::Rgba32F);
        texture.fill(Vec4::ONE);
        texture.resize(8, 2);
        assert_eq!(texture.size(), (8, 2));
        assert_eq!(texture.fetch(0, 0), Vec4::ZERO);
    }

    #[test]
    fn sampling_while_mutably_borrowed_reads_zero() {
        let texture = checker();
        let _target = texture.texels_mut();
        assert_eq!(texture.sample(Vec2::new(0.25, 0.25)), Vec4::ZERO);
    }

    #[test]
    fn srgb_round_trips() {
        for c in [0.0, 0.002, 0.2, 0.5, 1.0] {
            assert!((linear_to_srgb(srgb_to_linear(c)) - c).abs() < 1e-5);
        }
    }

    #[test]
    fn noise_uses_palette() {
        let palette = [Vec3::new(0.5, 0.25, 0.1)];
        let texture = Texture::noise("dirt", 8, 7, &palette);
        let texel = texture.fetch(3, 5);
        assert!((texel.x - 0.5).abs() <= 15.0 / 255.0 + 1e-6);
        assert_eq!(texel.w, 1.0);
        assert_eq!(texture.wrap(), Wrap::Repeat);
    }
}
