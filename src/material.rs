//! Materials: a shader program plus the uniform values and blend/depth state to draw with.
//!
//! A [`Material`] never trusts whatever state the previous drawcall left on the device.
//! [`Material::bind`] binds its program, re-uploads every cached uniform and applies its own
//! blend and depth-write state, so the visible result of a drawcall depends only on the
//! material used for it.
//!
//! Cloning a material shares the program (`Rc`) but copies the uniform cache, which is how
//! per-instance variants are made:
//!
//! ```ignore
//! let mut chunk_material = terrain_material.clone();
//! chunk_material.set_uniform_value("Heightmap", chunk_heightmap);
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::device::{BlendEquation, BlendFactor, BlendState, Device, Feature};
use crate::shader::{FromUniform, ShaderProgram, UniformError, UniformLocation, UniformValue};

/// A material shared between models and drawcalls.
pub type SharedMaterial = Rc<RefCell<Material>>;

#[derive(Clone, Debug)]
pub struct Material {
    program: Rc<ShaderProgram>,
    uniforms: BTreeMap<UniformLocation, UniformValue>,
    blend_equation: Option<BlendEquation>,
    blend_factors: Option<(BlendFactor, BlendFactor)>,
    depth_write: bool,
}

impl Material {
    pub fn new(program: Rc<ShaderProgram>) -> Self {
        Self {
            program,
            uniforms: BTreeMap::new(),
            blend_equation: None,
            blend_factors: None,
            depth_write: true,
        }
    }

    pub fn into_shared(self) -> SharedMaterial {
        Rc::new(RefCell::new(self))
    }

    pub fn shader_program(&self) -> &Rc<ShaderProgram> {
        &self.program
    }

    /// Caches a uniform value by name.
    ///
    /// Names the program does not declare are ignored, so a common set of optional uniforms
    /// can be set on materials built over different programs.
    pub fn set_uniform_value(&mut self, name: &str, value: impl Into<UniformValue>) {
        match self.program.uniform_location(name) {
            Some(location) => {
                self.uniforms.insert(location, value.into());
            }
            None => log::trace!(
                "material over `{}`: no uniform named `{name}`, ignoring",
                self.program.name()
            ),
        }
    }

    /// Caches a uniform value at an already resolved location.
    pub fn set_uniform_value_at(&mut self, location: UniformLocation, value: impl Into<UniformValue>) {
        if location.index() < self.program.uniform_count() {
            self.uniforms.insert(location, value.into());
        } else {
            log::trace!(
                "material over `{}`: location {} out of range, ignoring",
                self.program.name(),
                location.index()
            );
        }
    }

    /// Cached value for `name`.
    pub fn uniform_value(&self, name: &str) -> Result<&UniformValue, UniformError> {
        let location = self.resolve(name)?;
        self.uniforms.get(&location).ok_or_else(|| UniformError::Unset {
            name: name.to_string(),
        })
    }

    /// Mutable access to the cached value for `name`, e.g. for editing it in place.
    pub fn uniform_value_mut(&mut self, name: &str) -> Result<&mut UniformValue, UniformError> {
        let location = self.resolve(name)?;
        self.uniforms
            .get_mut(&location)
            .ok_or_else(|| UniformError::Unset {
                name: name.to_string(),
            })
    }

    /// Typed copy of the cached value for `name`.
    pub fn get_uniform<T: FromUniform>(&self, name: &str) -> Result<T, UniformError> {
        let value = self.uniform_value(name)?;
        T::from_uniform(value).ok_or_else(|| UniformError::TypeMismatch {
            name: name.to_string(),
            expected: T::TYPE_NAME,
            found: value.type_name(),
        })
    }

    /// Number of cached uniform values.
    pub fn uniform_count(&self) -> usize {
        self.uniforms.len()
    }

    pub fn set_blend_equation(&mut self, equation: BlendEquation) {
        self.blend_equation = Some(equation);
    }

    pub fn set_blend_params(&mut self, source: BlendFactor, destination: BlendFactor) {
        self.blend_factors = Some((source, destination));
    }

    /// Whether binding this material enables blending.
    pub fn is_blended(&self) -> bool {
        self.blend_equation.is_some() || self.blend_factors.is_some()
    }

    /// Blend state applied when [`is_blended`](Self::is_blended).
    pub fn blend_state(&self) -> BlendState {
        let default = BlendState::default();
        let (source, destination) = self
            .blend_factors
            .unwrap_or((default.source, default.destination));
        BlendState {
            equation: self.blend_equation.unwrap_or(default.equation),
            source,
            destination,
        }
    }

    pub fn depth_write(&self) -> bool {
        self.depth_write
    }

    pub fn set_depth_write(&mut self, enabled: bool) {
        self.depth_write = enabled;
    }

    /// Binds the program, re-applies every cached uniform, then blend and depth-write state.
    pub fn bind(&self, device: &mut Device) {
        device.use_program(Rc::clone(&self.program));
        for (location, value) in &self.uniforms {
            self.program.set_uniform(*location, value.clone());
        }
        let blended = self.is_blended();
        device.set_feature_enabled(Feature::Blend, blended);
        if blended {
            device.set_blend_state(self.blend_state());
        }
        device.set_depth_write_enabled(self.depth_write);
    }

    fn resolve(&self, name: &str) -> Result<UniformLocation, UniformError> {
        self.program
            .uniform_location(name)
            .ok_or_else(|| UniformError::NotFound {
                name: name.to_string(),
                program: self.program.name().to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::{UniformKind, VertexOutput};
    use glam::{Vec3, Vec4};

    fn program() -> Rc<ShaderProgram> {
        Rc::new(
            ShaderProgram::builder("material test")
                .uniform("Color", UniformKind::Vec4)
                .uniform("Heightmap", UniformKind::Texture)
                .uniform("Scale", UniformKind::Float)
                .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
                .fragment(|u, _| Some(u.get_or("Color", Vec4::ONE)))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn unknown_names_are_ignored_on_write() {
        let mut material = Material::new(program());
        material.set_uniform_value("NotAUniform", 1.0_f32);
        assert_eq!(material.uniform_count(), 0);
        assert!(matches!(
            material.uniform_value("NotAUniform"),
            Err(UniformError::NotFound { .. })
        ));
    }

    #[test]
    fn read_back_distinguishes_unset_values() {
        let mut material = Material::new(program());
        assert!(matches!(
            material.uniform_value("Scale"),
            Err(UniformError::Unset { .. })
        ));
        material.set_uniform_value("Scale", 2.0_f32);
        assert_eq!(material.get_uniform::<f32>("Scale"), Ok(2.0));
        assert!(matches!(
            material.get_uniform::<Vec3>("Scale"),
            Err(UniformError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn uniform_value_mut_edits_in_place() {
        let mut material = Material::new(program());
        material.set_uniform_value("Scale", 1.0_f32);
        if let Ok(UniformValue::Float(scale)) = material.uniform_value_mut("Scale") {
            *scale = 4.0;
        }
        assert_eq!(material.get_uniform::<f32>("Scale"), Ok(4.0));
    }

    #[test]
    fn bind_reapplies_cached_uniforms() {
        let program = program();
        let mut red = Material::new(Rc::clone(&program));
        red.set_uniform_value("Color", Vec4::new(1.0, 0.0, 0.0, 1.0));
        let mut blue = Material::new(Rc::clone(&program));
        blue.set_uniform_value("Color", Vec4::new(0.0, 0.0, 1.0, 1.0));
        let mut device = Device::software(1, 1);

        red.bind(&mut device);
        blue.bind(&mut device);
        red.bind(&mut device);

        assert_eq!(
            program.get_uniform::<Vec4>("Color"),
            Ok(Vec4::new(1.0, 0.0, 0.0, 1.0))
        );
    }

    #[test]
    fn clones_have_independent_caches() {
        let mut base = Material::new(program());
        base.set_uniform_value("Scale", 1.0_f32);
        let mut clone = base.clone();
        clone.set_uniform_value("Scale", 5.0_f32);
        clone.set_uniform_value("Color", Vec4::ONE);

        assert_eq!(base.get_uniform::<f32>("Scale"), Ok(1.0));
        assert!(base.uniform_value("Color").is_err());
        assert!(Rc::ptr_eq(base.shader_program(), clone.shader_program()));
    }

    #[test]
    fn blending_is_enabled_only_when_configured() {
        let mut device = Device::software(1, 1);
        device.enable_feature(Feature::Blend);

        let opaque = Material::new(program());
        opaque.bind(&mut device);
        assert!(!device.is_feature_enabled(Feature::Blend));

        let mut glass = Material::new(program());
        glass.set_blend_params(BlendFactor::SourceAlpha, BlendFactor::OneMinusSourceAlpha);
        glass.set_depth_write(false);
        glass.bind(&mut device);
        assert!(device.is_feature_enabled(Feature::Blend));
        assert_eq!(device.blend_state(), BlendState::alpha());
        assert!(!device.depth_write_enabled());
    }
}
