//! WGSL generation for shader programs.
//!
//! Every program's WGSL is wrapped in a generated prelude:
//!
//! - `struct Uniforms` bound as `u` at `@group(0) @binding(0)`. It starts with `itugl_target`
//!   (target width and height in `xy`), followed by the declared non-texture uniforms in
//!   declaration order and one `<Name>_state` vector per texture uniform
//! - one `texture_2d<f32>` or `texture_depth_2d` per texture uniform, at bindings `1..`
//! - `<Name>_bound()`, `<Name>_size()`, `<Name>_fetch(texel)` and `<Name>_sample(uv)`
//!   helpers per texture, which filter and wrap the same way [`Texture::sample`] does and
//!   read zero while the texture is unset
//! - `VertexInput`, `VertexOutput` and `FragmentInput`, plus the `itugl_vertex` and
//!   `itugl_fragment` entry points that call the program's `shade_vertex` and `shade_fragment`
//!
//! Clip-space depth follows the GL convention (`[-1, 1]`); the vertex entry point remaps it to
//! the `[0, 1]` range the GPU expects.
//!
//! [`Texture::sample`]: crate::texture::Texture::sample

use std::fmt::Write as _;

use wgpu::naga;

use super::{MAX_VARYINGS, UniformDeclaration, UniformKind, UniformValue};
use crate::texture::{Filter, Texture, Wrap};

/// Size and alignment of a uniform kind inside a `var<uniform>` block.
fn size_align(kind: UniformKind) -> (u64, u64) {
    match kind {
        UniformKind::Int | UniformKind::Float => (4, 4),
        UniformKind::Vec2 => (8, 8),
        UniformKind::Vec3 => (12, 16),
        UniformKind::Vec4 => (16, 16),
        UniformKind::Mat4 => (64, 16),
        UniformKind::Texture | UniformKind::DepthTexture => (0, 1),
    }
}

fn wgsl_type(kind: UniformKind) -> &'static str {
    match kind {
        UniformKind::Int => "i32",
        UniformKind::Float => "f32",
        UniformKind::Vec2 => "vec2<f32>",
        UniformKind::Vec3 => "vec3<f32>",
        UniformKind::Vec4 => "vec4<f32>",
        UniformKind::Mat4 => "mat4x4<f32>",
        UniformKind::Texture => "texture_2d<f32>",
        UniformKind::DepthTexture => "texture_depth_2d",
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Whether `name` can be used as a WGSL identifier.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && name != "_"
        && !name.starts_with("__")
        && !name.starts_with("itugl_")
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A texture uniform and where it lives on the GPU side.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureSlot {
    pub name: String,
    /// Index of the uniform location holding the texture.
    pub location: usize,
    pub binding: u32,
    pub depth: bool,
    state_offset: u64,
}

/// Byte layout of a program's uniform block.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformLayout {
    /// Size of the block in bytes, a multiple of 16.
    pub size: u64,
    /// Byte offset of each uniform location; `None` for textures.
    offsets: Vec<Option<u64>>,
    pub textures: Vec<TextureSlot>,
}

impl UniformLayout {
    pub fn new(declarations: &[UniformDeclaration]) -> Self {
        let mut offset = 16;
        let mut offsets = Vec::new();
        let mut textures = Vec::new();

        for declaration in declarations {
            let kind = declaration.kind;
            if kind.is_texture() {
                textures.push(TextureSlot {
                    name: declaration.name.clone(),
                    location: offsets.len(),
                    binding: textures.len() as u32 + 1,
                    depth: kind == UniformKind::DepthTexture,
                    state_offset: 0,
                });
                offsets.extend(std::iter::repeat_n(None, declaration.slots()));
                continue;
            }
            let (size, align) = size_align(kind);
            match declaration.count {
                None => {
                    offset = round_up(offset, align);
                    offsets.push(Some(offset));
                    offset += size;
                }
                Some(count) => {
                    let stride = round_up(size, 16);
                    offset = round_up(offset, 16);
                    offsets.extend((0..count as u64).map(|i| Some(offset + i * stride)));
                    offset += stride * count.max(1) as u64;
                }
            }
        }
        for texture in &mut textures {
            offset = round_up(offset, 16);
            texture.state_offset = offset;
            offset += 16;
        }

        Self {
            size: round_up(offset, 16),
            offsets,
            textures,
        }
    }

    /// Byte offset of the value stored at uniform location `index`.
    pub fn offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied().flatten()
    }

    /// Packs the block. Unset values read as zero. Textures for which `usable` returns
    /// `false` are flagged as unbound.
    pub fn pack(
        &self,
        values: &[Option<UniformValue>],
        target: (u32, u32),
        usable: impl Fn(&Texture) -> bool,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size as usize];
        let target = [target.0 as f32, target.1 as f32, 0.0, 0.0];
        write(&mut bytes, 0, bytemuck::cast_slice(&target));

        for (index, value) in values.iter().enumerate() {
            let (Some(offset), Some(value)) = (self.offset(index), value) else {
                continue;
            };
            match value {
                UniformValue::Int(v) => write(&mut bytes, offset, bytemuck::bytes_of(v)),
                UniformValue::Float(v) => write(&mut bytes, offset, bytemuck::bytes_of(v)),
                UniformValue::Vec2(v) => write(&mut bytes, offset, bytemuck::cast_slice(&v.to_array())),
                UniformValue::Vec3(v) => write(&mut bytes, offset, bytemuck::cast_slice(&v.to_array())),
                UniformValue::Vec4(v) => write(&mut bytes, offset, bytemuck::cast_slice(&v.to_array())),
                UniformValue::Mat4(m) => {
                    write(&mut bytes, offset, bytemuck::cast_slice(&m.to_cols_array()))
                }
                UniformValue::Texture(_) => {}
            }
        }

        for slot in &self.textures {
            let state = match values.get(slot.location) {
                Some(Some(UniformValue::Texture(texture))) if usable(texture) => [
                    1,
                    i32::from(texture.filter() == Filter::Linear),
                    i32::from(texture.wrap() == Wrap::Repeat),
                    0,
                ],
                _ => [0i32; 4],
            };
            write(&mut bytes, slot.state_offset, bytemuck::cast_slice(&state));
        }
        bytes
    }
}

fn write(bytes: &mut [u8], offset: u64, data: &[u8]) {
    let start = offset as usize;
    if let Some(range) = bytes.get_mut(start..start + data.len()) {
        range.copy_from_slice(data);
    }
}

const STAGE_INTERFACE: &str = "
struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

fn itugl_wrap(c: i32, size: i32, mode: i32) -> i32 {
    if (mode == 1) {
        return ((c % size) + size) % size;
    }
    return clamp(c, 0, size - 1);
}

@vertex
fn itugl_vertex(input: VertexInput) -> VertexOutput {
    var out = shade_vertex(input);
    out.position.z = (out.position.z + out.position.w) * 0.5;
    return out;
}

@fragment
fn itugl_fragment(input: FragmentInput) -> @location(0) vec4<f32> {
    return shade_fragment(input);
}
";

fn texture_helpers(out: &mut String, slot: &TextureSlot) {
    let name = &slot.name;
    let load = if slot.depth {
        format!("vec4<f32>(vec3<f32>(textureLoad({name}, p, 0)), 1.0)")
    } else {
        format!("textureLoad({name}, p, 0)")
    };
    let _ = write!(
        out,
        "
fn {name}_bound() -> bool {{
    return u.{name}_state.x != 0;
}}

fn {name}_size() -> vec2<f32> {{
    return vec2<f32>(textureDimensions({name}));
}}

fn {name}_load(p: vec2<i32>) -> vec4<f32> {{
    return {load};
}}

fn {name}_texel(t: vec2<i32>) -> vec4<f32> {{
    let size = vec2<i32>(textureDimensions({name}));
    let mode = u.{name}_state.z;
    return {name}_load(vec2<i32>(itugl_wrap(t.x, size.x, mode), itugl_wrap(t.y, size.y, mode)));
}}

fn {name}_fetch(t: vec2<i32>) -> vec4<f32> {{
    if (u.{name}_state.x == 0) {{
        return vec4<f32>(0.0);
    }}
    let size = vec2<i32>(textureDimensions({name}));
    return {name}_load(clamp(t, vec2<i32>(0), size - vec2<i32>(1)));
}}

fn {name}_sample(uv: vec2<f32>) -> vec4<f32> {{
    if (u.{name}_state.x == 0) {{
        return vec4<f32>(0.0);
    }}
    let p = uv * {name}_size();
    if (u.{name}_state.y == 0) {{
        return {name}_texel(vec2<i32>(floor(p)));
    }}
    let q = p - vec2<f32>(0.5);
    let base = floor(q);
    let f = q - base;
    let i = vec2<i32>(base);
    let top = mix({name}_texel(i), {name}_texel(i + vec2<i32>(1, 0)), f.x);
    let bottom = mix({name}_texel(i + vec2<i32>(0, 1)), {name}_texel(i + vec2<i32>(1, 1)), f.x);
    return mix(top, bottom, f.y);
}}
"
    );
}

/// Generated declarations followed by the program's own source.
pub fn module_source(declarations: &[UniformDeclaration], source: &str) -> String {
    let layout = UniformLayout::new(declarations);
    let mut out = String::new();

    out.push_str("struct Uniforms {\n    itugl_target: vec4<f32>,\n");
    for declaration in declarations.iter().filter(|d| !d.kind.is_texture()) {
        let ty = wgsl_type(declaration.kind);
        let _ = match declaration.count {
            None => writeln!(out, "    {}: {ty},", declaration.name),
            Some(count) => writeln!(out, "    {}: array<{ty}, {}>,", declaration.name, count.max(1)),
        };
    }
    for slot in &layout.textures {
        let _ = writeln!(out, "    {}_state: vec4<i32>,", slot.name);
    }
    out.push_str("}\n\n@group(0) @binding(0) var<uniform> u: Uniforms;\n");
    for slot in &layout.textures {
        let kind = if slot.depth {
            UniformKind::DepthTexture
        } else {
            UniformKind::Texture
        };
        let _ = writeln!(
            out,
            "@group(0) @binding({}) var {}: {};",
            slot.binding,
            slot.name,
            wgsl_type(kind)
        );
    }

    out.push_str("\nstruct VertexOutput {\n    @builtin(position) position: vec4<f32>,\n");
    for slot in 0..MAX_VARYINGS {
        let _ = writeln!(out, "    @location({slot}) v{slot}: vec4<f32>,");
    }
    out.push_str("}\n\nstruct FragmentInput {\n    @builtin(position) frag_coord: vec4<f32>,\n");
    out.push_str("    @builtin(front_facing) front_facing: bool,\n");
    for slot in 0..MAX_VARYINGS {
        let _ = writeln!(out, "    @location({slot}) v{slot}: vec4<f32>,");
    }
    out.push_str("}\n\nfn itugl_vertex_output(position: vec4<f32>) -> VertexOutput {\n");
    out.push_str("    var out: VertexOutput;\n    out.position = position;\n");
    for slot in 0..MAX_VARYINGS {
        let _ = writeln!(out, "    out.v{slot} = vec4<f32>(0.0);");
    }
    out.push_str("    return out;\n}\n");
    out.push_str(STAGE_INTERFACE);

    for slot in &layout.textures {
        texture_helpers(&mut out, slot);
    }

    out.push_str("\n// program source\n");
    out.push_str(source);
    out.push('\n');
    out
}

/// Parses and validates a complete module. Errors carry the rendered diagnostic.
pub fn validate(source: &str) -> Result<naga::Module, String> {
    let module =
        naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|err| err.emit_to_string(source))?;
    Ok(module)
}
