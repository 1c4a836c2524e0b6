//! Shader programs, uniform locations and typed uniform values.
//!
//! A [`ShaderProgram`] is the unit the renderer dispatches on. It declares a fixed set of typed
//! uniforms when it is built, resolves each name to a dense [`UniformLocation`], and stores the
//! values uploaded to it. Like a linked GL program, uploaded values persist inside the program
//! until they are overwritten, no matter which material uploaded them.
//!
//! A program carries its stages in up to two forms:
//!
//! - WGSL source, run by the GPU device. The source defines `shade_vertex` and `shade_fragment`
//!   functions over the generated `VertexInput`, `VertexOutput` and `FragmentInput` structs and reads
//!   uniforms through the generated `u` block (see [`wgsl`])
//! - host closures, run by the software device. The vertex stage maps a [`Vertex3d`] to a
//!   clip-space position plus up to [`MAX_VARYINGS`] interpolated values; the fragment stage
//!   maps the interpolated [`FragmentInput`] to a colour, or `None` to discard the fragment
//!
//! WGSL is validated when the program is built, so a program that builds also compiles on
//! the GPU.
//!
//! # Example
//!
//! ```ignore
//! use itugl::*;
//!
//! let program = ShaderProgram::builder("flat")
//!     .uniform_with_default("Color", Vec4::ONE)
//!     .wgsl(r#"
//!         fn shade_vertex(input: VertexInput) -> VertexOutput {
//!             return itugl_vertex_output(vec4<f32>(input.position, 1.0));
//!         }
//!         fn shade_fragment(input: FragmentInput) -> vec4<f32> {
//!             return u.Color;
//!         }
//!     "#)
//!     .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
//!     .fragment(|u, _| Some(u.get_or("Color", Vec4::ONE)))
//!     .build()?;
//!
//! if let Some(color) = program.uniform_location("Color") {
//!     program.set_uniform(color, Vec4::new(1.0, 0.0, 0.0, 1.0));
//! }
//! ```

pub mod wgsl;

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::mesh::Vertex3d;
use crate::texture::Texture;

/// Number of `Vec4` slots a vertex stage can hand to the fragment stage.
pub const MAX_VARYINGS: usize = 4;

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a built [`ShaderProgram`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(u64);

/// A resolved uniform slot. Only meaningful for the program that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformLocation(u32);

impl UniformLocation {
    /// Index of the slot inside its program's uniform storage.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Declared type of a uniform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Int,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    /// A colour texture, sampled as `vec4`.
    Texture,
    /// A depth texture; samples read `(d, d, d, 1)`.
    DepthTexture,
}

impl UniformKind {
    pub fn type_name(self) -> &'static str {
        match self {
            UniformKind::Int => "int",
            UniformKind::Float => "float",
            UniformKind::Vec2 => "vec2",
            UniformKind::Vec3 => "vec3",
            UniformKind::Vec4 => "vec4",
            UniformKind::Mat4 => "mat4",
            UniformKind::Texture => "sampler2D",
            UniformKind::DepthTexture => "sampler2DShadow",
        }
    }

    pub fn is_texture(self) -> bool {
        matches!(self, UniformKind::Texture | UniformKind::DepthTexture)
    }

    /// Whether `value` can be uploaded to a uniform of this kind. Colour and depth textures
    /// are not interchangeable.
    pub fn accepts(self, value: &UniformValue) -> bool {
        value.kind() == self
    }
}

/// A typed uniform value.
#[derive(Clone, Debug)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
    Texture(Rc<Texture>),
}

impl UniformValue {
    /// Short type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            UniformValue::Texture(_) => "sampler2D",
            other => other.kind().type_name(),
        }
    }

    /// Kind of uniform this value fits. Textures report [`UniformKind::Texture`] or
    /// [`UniformKind::DepthTexture`] by format.
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Int(_) => UniformKind::Int,
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
            UniformValue::Mat4(_) => UniformKind::Mat4,
            UniformValue::Texture(texture) if texture.format().is_depth() => {
                UniformKind::DepthTexture
            }
            UniformValue::Texture(_) => UniformKind::Texture,
        }
    }
}

// Textures compare by identity: two handles are equal when they bind the same texture object.
impl PartialEq for UniformValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (UniformValue::Int(a), UniformValue::Int(b)) => a == b,
            (UniformValue::Float(a), UniformValue::Float(b)) => a == b,
            (UniformValue::Vec2(a), UniformValue::Vec2(b)) => a == b,
            (UniformValue::Vec3(a), UniformValue::Vec3(b)) => a == b,
            (UniformValue::Vec4(a), UniformValue::Vec4(b)) => a == b,
            (UniformValue::Mat4(a), UniformValue::Mat4(b)) => a == b,
            (UniformValue::Texture(a), UniformValue::Texture(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<Vec2> for UniformValue {
    fn from(value: Vec2) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        UniformValue::Mat4(value)
    }
}

impl From<Rc<Texture>> for UniformValue {
    fn from(value: Rc<Texture>) -> Self {
        UniformValue::Texture(value)
    }
}

impl From<&Rc<Texture>> for UniformValue {
    fn from(value: &Rc<Texture>) -> Self {
        UniformValue::Texture(Rc::clone(value))
    }
}

/// Types that can be read back out of a [`UniformValue`].
pub trait FromUniform: Sized {
    /// Name reported in [`UniformError::TypeMismatch`].
    const TYPE_NAME: &'static str;

    fn from_uniform(value: &UniformValue) -> Option<Self>;
}

macro_rules! impl_from_uniform {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromUniform for $ty {
            const TYPE_NAME: &'static str = $name;

            fn from_uniform(value: &UniformValue) -> Option<Self> {
                match value {
                    UniformValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_from_uniform!(i32, Int, "int");
impl_from_uniform!(f32, Float, "float");
impl_from_uniform!(Vec2, Vec2, "vec2");
impl_from_uniform!(Vec3, Vec3, "vec3");
impl_from_uniform!(Vec4, Vec4, "vec4");
impl_from_uniform!(Mat4, Mat4, "mat4");
impl_from_uniform!(Rc<Texture>, Texture, "sampler2D");

/// Failure to build a shader program.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    /// The program could not be built. `log` holds one problem per line, or the compiler
    /// diagnostic when the WGSL failed to validate.
    #[error("failed to build shader program `{program}`:\n{log}")]
    Build { program: String, log: String },
}

/// Failure to read a uniform back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UniformError {
    #[error("uniform `{name}` not found in program `{program}`")]
    NotFound { name: String, program: String },
    #[error("uniform `{name}` has not been assigned a value")]
    Unset { name: String },
    #[error("uniform `{name}` holds a {found}, expected a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Values handed from the vertex stage to the fragment stage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Varyings(pub [Vec4; MAX_VARYINGS]);

impl Varyings {
    /// Value in `slot`. Slots past [`MAX_VARYINGS`] read as zero.
    pub fn get(&self, slot: usize) -> Vec4 {
        self.0.get(slot).copied().unwrap_or(Vec4::ZERO)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Vec4> {
        self.0.get_mut(slot)
    }

    /// Stores `value` in `slot`. Writes past [`MAX_VARYINGS`] are dropped.
    pub fn set(&mut self, slot: usize, value: Vec4) {
        match self.0.get_mut(slot) {
            Some(varying) => *varying = value,
            None => log::trace!("dropping write to varying slot {slot}"),
        }
    }

    /// Weighted sum of three varying sets (barycentric interpolation).
    pub(crate) fn weighted(v: [&Varyings; 3], w: [f32; 3]) -> Varyings {
        let mut out = Varyings::default();
        for slot in 0..MAX_VARYINGS {
            out.0[slot] = v[0].0[slot] * w[0] + v[1].0[slot] * w[1] + v[2].0[slot] * w[2];
        }
        out
    }

    pub(crate) fn lerp(a: &Varyings, b: &Varyings, t: f32) -> Varyings {
        let mut out = Varyings::default();
        for slot in 0..MAX_VARYINGS {
            out.0[slot] = a.0[slot].lerp(b.0[slot], t);
        }
        out
    }
}

/// Result of the vertex stage for one vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexOutput {
    /// Clip-space position.
    pub position: Vec4,
    pub varyings: Varyings,
}

impl VertexOutput {
    pub fn new(position: Vec4) -> Self {
        Self {
            position,
            varyings: Varyings::default(),
        }
    }

    /// Sets one varying slot, builder style.
    pub fn varying(mut self, slot: usize, value: Vec4) -> Self {
        self.varyings.set(slot, value);
        self
    }
}

/// Input of the fragment stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FragmentInput {
    /// Pixel centre in `x`/`y` (row 0 at the top), window depth in `z`, `1/w` in `w`.
    pub frag_coord: Vec4,
    pub varyings: Varyings,
    pub front_facing: bool,
}

pub type VertexStage = Box<dyn Fn(&Uniforms, &Vertex3d) -> VertexOutput>;
pub type FragmentStage = Box<dyn Fn(&Uniforms, &FragmentInput) -> Option<Vec4>>;

/// One `uniform` / `uniform_array` call of a program builder.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformDeclaration {
    pub name: String,
    pub kind: UniformKind,
    /// Element count for arrays. Elements resolve as `name[0]` through `name[count - 1]`.
    pub count: Option<usize>,
    default: Option<UniformValue>,
}

impl UniformDeclaration {
    /// Number of locations the declaration occupies.
    pub fn slots(&self) -> usize {
        self.count.unwrap_or(1)
    }
}

/// Read-only view of a program's uniform storage, handed to the shader stages.
pub struct Uniforms<'a> {
    locations: &'a HashMap<String, UniformLocation>,
    values: &'a [Option<UniformValue>],
}

impl<'a> Uniforms<'a> {
    /// Raw value stored under `name`, if declared and assigned.
    pub fn value(&self, name: &str) -> Option<&'a UniformValue> {
        let location = self.locations.get(name)?;
        self.values.get(location.index())?.as_ref()
    }

    /// Typed value stored under `name`. Wrong types read as `None`.
    pub fn get<T: FromUniform>(&self, name: &str) -> Option<T> {
        self.value(name).and_then(T::from_uniform)
    }

    pub fn get_or<T: FromUniform>(&self, name: &str, default: T) -> T {
        self.get(name).unwrap_or(default)
    }

    /// Texture bound to the sampler uniform `name`.
    pub fn texture(&self, name: &str) -> Option<&'a Texture> {
        match self.value(name)? {
            UniformValue::Texture(texture) => Some(texture.as_ref()),
            _ => None,
        }
    }
}

/// A built shader program.
pub struct ShaderProgram {
    id: ProgramId,
    name: String,
    declarations: Vec<UniformDeclaration>,
    locations: HashMap<String, UniformLocation>,
    names: Vec<String>,
    kinds: Vec<UniformKind>,
    values: RefCell<Vec<Option<UniformValue>>>,
    uploads: RefCell<Vec<u64>>,
    vertex: Option<VertexStage>,
    fragment: Option<FragmentStage>,
    wgsl: Option<String>,
}

impl fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("uniforms", &self.names)
            .field("wgsl", &self.wgsl.is_some())
            .field("host_stages", &self.has_host_stages())
            .finish_non_exhaustive()
    }
}

impl ShaderProgram {
    pub fn builder(name: impl Into<String>) -> ShaderProgramBuilder {
        ShaderProgramBuilder {
            name: name.into(),
            declarations: Vec::new(),
            vertex: None,
            fragment: None,
            wgsl: None,
        }
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves a uniform name. `None` is the not-found sentinel.
    pub fn uniform_location(&self, name: &str) -> Option<UniformLocation> {
        self.locations.get(name).copied()
    }

    /// Name of the uniform at `location`.
    pub fn uniform_name(&self, location: UniformLocation) -> Option<&str> {
        self.names.get(location.index()).map(String::as_str)
    }

    pub fn uniform_kind(&self, location: UniformLocation) -> Option<UniformKind> {
        self.kinds.get(location.index()).copied()
    }

    pub fn uniform_count(&self) -> usize {
        self.names.len()
    }

    /// Declared uniform names in location order.
    pub fn uniform_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn declarations(&self) -> &[UniformDeclaration] {
        &self.declarations
    }

    /// The WGSL source given to the builder, without the generated declarations.
    pub fn wgsl_source(&self) -> Option<&str> {
        self.wgsl.as_deref()
    }

    /// The complete WGSL module the GPU device compiles for this program.
    pub fn wgsl_module(&self) -> Option<String> {
        let source = self.wgsl.as_deref()?;
        Some(wgsl::module_source(&self.declarations, source))
    }

    /// Whether the software device can run this program.
    pub fn has_host_stages(&self) -> bool {
        self.vertex.is_some() && self.fragment.is_some()
    }

    /// Uploads a value into the program's uniform storage.
    ///
    /// Locations from another program that fall outside this one are ignored, and so are
    /// values whose type does not match the declaration.
    pub fn set_uniform(&self, location: UniformLocation, value: impl Into<UniformValue>) {
        let Some(kind) = self.uniform_kind(location) else {
            log::warn!(
                "program `{}`: ignoring upload to out-of-range uniform location {}",
                self.name,
                location.index()
            );
            return;
        };
        let value = value.into();
        if !kind.accepts(&value) {
            log::warn!(
                "program `{}`: uniform `{}` is a {}, ignoring a {} upload",
                self.name,
                self.names[location.index()],
                kind.type_name(),
                value.type_name()
            );
            return;
        }
        self.values.borrow_mut()[location.index()] = Some(value);
        self.uploads.borrow_mut()[location.index()] += 1;
    }

    /// Value currently stored at `location`.
    pub fn uniform(&self, location: UniformLocation) -> Option<UniformValue> {
        self.values.borrow().get(location.index()).cloned().flatten()
    }

    pub fn uniform_by_name(&self, name: &str) -> Option<UniformValue> {
        self.uniform(self.uniform_location(name)?)
    }

    /// Typed read-back of the value stored under `name`.
    pub fn get_uniform<T: FromUniform>(&self, name: &str) -> Result<T, UniformError> {
        let location = self
            .uniform_location(name)
            .ok_or_else(|| UniformError::NotFound {
                name: name.to_string(),
                program: self.name.clone(),
            })?;
        let value = self.uniform(location).ok_or_else(|| UniformError::Unset {
            name: name.to_string(),
        })?;
        T::from_uniform(&value).ok_or_else(|| UniformError::TypeMismatch {
            name: name.to_string(),
            expected: T::TYPE_NAME,
            found: value.type_name(),
        })
    }

    /// Number of uploads made to `location` since the program was built.
    pub fn upload_count(&self, location: UniformLocation) -> u64 {
        self.uploads
            .borrow()
            .get(location.index())
            .copied()
            .unwrap_or(0)
    }

    /// Runs `f` with the uniform view the stages see, e.g. to evaluate a stage helper
    /// against the values currently set.
    pub fn with_uniforms<R>(&self, f: impl FnOnce(&Uniforms) -> R) -> R {
        let values = self.values.borrow();
        let uniforms = Uniforms {
            locations: &self.locations,
            values: &values,
        };
        f(&uniforms)
    }

    /// Runs the host vertex stage. Programs without one place every vertex at the origin.
    pub fn run_vertex(&self, uniforms: &Uniforms, vertex: &Vertex3d) -> VertexOutput {
        match &self.vertex {
            Some(stage) => stage(uniforms, vertex),
            None => VertexOutput::new(Vec4::ZERO),
        }
    }

    /// Runs the host fragment stage. Programs without one discard.
    pub fn run_fragment(&self, uniforms: &Uniforms, input: &FragmentInput) -> Option<Vec4> {
        self.fragment.as_ref().and_then(|stage| stage(uniforms, input))
    }

    pub(crate) fn values(&self) -> Ref<'_, Vec<Option<UniformValue>>> {
        self.values.borrow()
    }
}

/// Builder returned by [`ShaderProgram::builder`].
pub struct ShaderProgramBuilder {
    name: String,
    declarations: Vec<UniformDeclaration>,
    vertex: Option<VertexStage>,
    fragment: Option<FragmentStage>,
    wgsl: Option<String>,
}

impl ShaderProgramBuilder {
    /// Declares a uniform. It reads as unset until a value is uploaded.
    pub fn uniform(mut self, name: impl Into<String>, kind: UniformKind) -> Self {
        self.declarations.push(UniformDeclaration {
            name: name.into(),
            kind,
            count: None,
            default: None,
        });
        self
    }

    /// Declares a uniform that starts out holding `value`. The kind follows the value.
    pub fn uniform_with_default(
        mut self,
        name: impl Into<String>,
        value: impl Into<UniformValue>,
    ) -> Self {
        let value = value.into();
        self.declarations.push(UniformDeclaration {
            name: name.into(),
            kind: value.kind(),
            count: None,
            default: Some(value),
        });
        self
    }

    /// Declares `name[0]` through `name[count - 1]`. Arrays hold `vec3`, `vec4` or `mat4`.
    pub fn uniform_array(mut self, name: &str, kind: UniformKind, count: usize) -> Self {
        self.declarations.push(UniformDeclaration {
            name: name.to_string(),
            kind,
            count: Some(count),
            default: None,
        });
        self
    }

    pub fn vertex(
        mut self,
        stage: impl Fn(&Uniforms, &Vertex3d) -> VertexOutput + 'static,
    ) -> Self {
        self.vertex = Some(Box::new(stage));
        self
    }

    pub fn fragment(
        mut self,
        stage: impl Fn(&Uniforms, &FragmentInput) -> Option<Vec4> + 'static,
    ) -> Self {
        self.fragment = Some(Box::new(stage));
        self
    }

    /// WGSL defining `fn shade_vertex(input: VertexInput) -> VertexOutput` and
    /// `fn shade_fragment(input: FragmentInput) -> vec4<f32>`.
    pub fn wgsl(mut self, source: impl Into<String>) -> Self {
        self.wgsl = Some(source.into());
        self
    }

    /// Validates the declaration, compiles the WGSL and links the program.
    pub fn build(self) -> Result<ShaderProgram, ShaderError> {
        let mut log = Vec::new();
        let mut locations = HashMap::new();
        let mut names = Vec::new();
        let mut kinds = Vec::new();
        let mut values = Vec::new();

        for (index, declaration) in self.declarations.iter().enumerate() {
            let name = &declaration.name;
            if name.trim().is_empty() {
                log.push(format!("uniform #{index} has an empty name"));
                continue;
            }
            if self.wgsl.is_some() && !wgsl::is_identifier(name) {
                log.push(format!("uniform `{name}` is not a valid WGSL identifier"));
            }
            let slot_names = match declaration.count {
                None => vec![name.clone()],
                Some(count) => {
                    if !matches!(
                        declaration.kind,
                        UniformKind::Vec3 | UniformKind::Vec4 | UniformKind::Mat4
                    ) {
                        log.push(format!(
                            "uniform array `{name}` holds {} values; arrays hold vec3, vec4 or mat4",
                            declaration.kind.type_name()
                        ));
                    }
                    (0..count).map(|i| format!("{name}[{i}]")).collect()
                }
            };
            for slot_name in slot_names {
                let location = UniformLocation(names.len() as u32);
                if locations.insert(slot_name.clone(), location).is_some() {
                    log.push(format!("uniform `{slot_name}` is declared more than once"));
                }
                names.push(slot_name);
                kinds.push(declaration.kind);
                values.push(declaration.default.clone());
            }
        }

        match (&self.vertex, &self.fragment, &self.wgsl) {
            (None, None, Some(_)) | (Some(_), Some(_), _) => {}
            (vertex, fragment, _) => {
                if vertex.is_none() {
                    log.push("missing vertex stage".to_string());
                }
                if fragment.is_none() {
                    log.push("missing fragment stage".to_string());
                }
            }
        }

        if let Some(source) = &self.wgsl {
            if log.is_empty() {
                if let Err(diagnostic) =
                    wgsl::validate(&wgsl::module_source(&self.declarations, source))
                {
                    log.push(diagnostic);
                }
            }
        }

        if !log.is_empty() {
            return Err(ShaderError::Build {
                program: self.name,
                log: log.join("\n"),
            });
        }

        let count = names.len();
        let id = ProgramId(NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "built shader program `{}` ({:?}, {} uniforms, wgsl: {})",
            self.name,
            id,
            count,
            self.wgsl.is_some()
        );
        Ok(ShaderProgram {
            id,
            name: self.name,
            declarations: self.declarations,
            locations,
            names,
            kinds,
            values: RefCell::new(values),
            uploads: RefCell::new(vec![0; count]),
            vertex: self.vertex,
            fragment: self.fragment,
            wgsl: self.wgsl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> ShaderProgram {
        ShaderProgram::builder("test")
            .uniform("Color", UniformKind::Vec4)
            .uniform("Scale", UniformKind::Float)
            .uniform_array("LightColor", UniformKind::Vec3, 2)
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|u, _| Some(u.get_or("Color", Vec4::ONE)))
            .build()
            .unwrap()
    }

    #[test]
    fn locations_follow_declaration_order() {
        let program = program();
        assert_eq!(program.uniform_location("Color").unwrap().index(), 0);
        assert_eq!(program.uniform_location("Scale").unwrap().index(), 1);
        assert_eq!(program.uniform_location("LightColor[1]").unwrap().index(), 3);
        assert_eq!(program.uniform_location("LightColor"), None);
        assert_eq!(program.uniform_location("Missing"), None);
        let light = program.uniform_location("LightColor[0]").unwrap();
        assert_eq!(program.uniform_kind(light), Some(UniformKind::Vec3));
    }

    #[test]
    fn uploads_persist_and_are_counted() {
        let program = program();
        let scale = program.uniform_location("Scale").unwrap();
        assert_eq!(program.uniform(scale), None);

        program.set_uniform(scale, 2.0_f32);
        program.set_uniform(scale, 3.0_f32);

        assert_eq!(program.uniform(scale), Some(UniformValue::Float(3.0)));
        assert_eq!(program.upload_count(scale), 2);
        assert_eq!(program.get_uniform::<f32>("Scale"), Ok(3.0));
    }

    #[test]
    fn uploads_of_the_wrong_type_are_rejected() {
        let program = program();
        let scale = program.uniform_location("Scale").unwrap();
        program.set_uniform(scale, 1);
        assert_eq!(program.uniform(scale), None);
        assert_eq!(program.upload_count(scale), 0);

        program.set_uniform(scale, 0.5_f32);
        program.set_uniform(scale, Vec3::ONE);
        assert_eq!(program.get_uniform::<f32>("Scale"), Ok(0.5));
    }

    #[test]
    fn typed_read_back_reports_failures() {
        let program = program();
        program.set_uniform(program.uniform_location("Scale").unwrap(), 1.0_f32);

        assert!(matches!(
            program.get_uniform::<f32>("Missing"),
            Err(UniformError::NotFound { .. })
        ));
        assert!(matches!(
            program.get_uniform::<Vec4>("Color"),
            Err(UniformError::Unset { .. })
        ));
        assert_eq!(
            program.get_uniform::<i32>("Scale"),
            Err(UniformError::TypeMismatch {
                name: "Scale".to_string(),
                expected: "int",
                found: "float",
            })
        );
    }

    #[test]
    fn defaults_are_stored_but_not_counted() {
        let program = ShaderProgram::builder("defaults")
            .uniform_with_default("Tint", Vec4::ONE)
            .uniform_with_default("Steps", 8)
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|u, _| Some(u.get_or("Tint", Vec4::ZERO)))
            .build()
            .unwrap();
        let steps = program.uniform_location("Steps").unwrap();
        assert_eq!(program.uniform_kind(steps), Some(UniformKind::Int));
        assert_eq!(program.get_uniform::<Vec4>("Tint"), Ok(Vec4::ONE));
        assert_eq!(program.upload_count(steps), 0);
    }

    #[test]
    fn build_collects_every_problem() {
        let err = ShaderProgram::builder("broken")
            .uniform("A", UniformKind::Float)
            .uniform("A", UniformKind::Float)
            .uniform(" ", UniformKind::Int)
            .build()
            .unwrap_err();

        let ShaderError::Build { program, log } = err;
        assert_eq!(program, "broken");
        assert_eq!(log.lines().count(), 4);
        assert!(log.contains("`A` is declared more than once"));
        assert!(log.contains("missing vertex stage"));
        assert!(log.contains("missing fragment stage"));
    }

    #[test]
    fn arrays_must_hold_vectors_or_matrices() {
        let err = ShaderProgram::builder("scalars")
            .uniform_array("Weights", UniformKind::Float, 4)
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|_, _| None)
            .build()
            .unwrap_err();
        let ShaderError::Build { log, .. } = err;
        assert!(log.contains("`Weights` holds float values"));
    }

    #[test]
    fn wgsl_only_programs_build_without_host_stages() {
        let program = ShaderProgram::builder("gpu only")
            .uniform("Color", UniformKind::Vec4)
            .wgsl(
                "fn shade_vertex(input: VertexInput) -> VertexOutput {
                    return itugl_vertex_output(vec4<f32>(input.position, 1.0));
                }
                fn shade_fragment(input: FragmentInput) -> vec4<f32> {
                    return u.Color;
                }",
            )
            .build()
            .unwrap();
        assert!(!program.has_host_stages());
        assert!(program.wgsl_module().unwrap().contains("fn itugl_fragment"));
    }

    #[test]
    fn invalid_wgsl_fails_the_build() {
        let err = ShaderProgram::builder("typo")
            .wgsl("fn shade_vertex(input: VertexInput) -> VertexOutput { return 1.0; }")
            .build()
            .unwrap_err();
        let ShaderError::Build { program, log } = err;
        assert_eq!(program, "typo");
        assert!(!log.is_empty());
    }

    #[test]
    fn program_ids_are_unique() {
        assert_ne!(program().id(), program().id());
    }

    #[test]
    fn textures_compare_by_identity() {
        let a = Rc::new(Texture::solid("a", Vec4::ONE));
        let b = Rc::new(Texture::solid("b", Vec4::ONE));
        assert_eq!(UniformValue::from(&a), UniformValue::from(Rc::clone(&a)));
        assert_ne!(UniformValue::from(&a), UniformValue::from(&b));
    }

    #[test]
    fn varying_slots_past_the_end_are_harmless() {
        let mut varyings = Varyings::default();
        varyings.set(MAX_VARYINGS, Vec4::ONE);
        assert_eq!(varyings, Varyings::default());
        assert_eq!(varyings.get(MAX_VARYINGS + 3), Vec4::ZERO);
        assert!(varyings.get_mut(MAX_VARYINGS).is_none());

        if let Some(slot) = varyings.get_mut(1) {
            *slot = Vec4::X;
        }
        assert_eq!(varyings.get(1), Vec4::X);
    }
}
