//! Procedural terrain chunks.
//!
//! Every chunk draws the same unit grid mesh. The terrain program lifts each vertex by the
//! chunk's height map and reads its normal from the chunk's normal map, so chunks only differ
//! in the two textures bound on their material.

use glam::{IVec2, Mat3, Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use itugl::programs::{self, NORMAL_MATRIX_WGSL, lighting_wgsl, with_lighting};
use itugl::{
    Filter, ShaderError, ShaderProgram, Texture, UniformKind, Uniforms, Vertex3d, VertexOutput,
    Wrap,
};

const WORLD_POSITION: usize = 0;
const WORLD_NORMAL: usize = 1;
const SURFACE: usize = 2;

/// Range of a layer that never fades in.
const NO_BLEND: Vec2 = Vec2::splat(f32::MAX);

const TERRAIN_WGSL: &str = r#"
fn shade_vertex(input: VertexInput) -> VertexOutput {
    var height = 0.0;
    if (Heightmap_bound()) {
        height = Heightmap_sample(input.uv).x;
    }
    var normal = input.normal;
    if (NormalMap_bound()) {
        normal = NormalMap_sample(input.uv).xyz;
    }
    let local = input.position + vec3<f32>(0.0, height * u.HeightScale, 0.0);
    let world = u.WorldMatrix * vec4<f32>(local, 1.0);
    var out = itugl_vertex_output(u.ViewProjMatrix * world);
    out.v0 = world;
    out.v1 = vec4<f32>(world_normal_matrix() * normal, 0.0);
    out.v2 = vec4<f32>(input.uv, height, 0.0);
    return out;
}

fn height_blend(edge0: f32, edge1: f32, x: f32) -> f32 {
    if (edge1 <= edge0) {
        return select(1.0, 0.0, x < edge0);
    }
    return smoothstep(edge0, edge1, x);
}

fn layer0(uv: vec2<f32>) -> vec4<f32> {
    if (ColorTexture0_bound()) {
        return ColorTexture0_sample(uv);
    }
    return vec4<f32>(1.0);
}

fn layer1(uv: vec2<f32>) -> vec4<f32> {
    if (ColorTexture1_bound()) {
        return ColorTexture1_sample(uv);
    }
    return vec4<f32>(1.0);
}

fn layer2(uv: vec2<f32>) -> vec4<f32> {
    if (ColorTexture2_bound()) {
        return ColorTexture2_sample(uv);
    }
    return vec4<f32>(1.0);
}

fn layer3(uv: vec2<f32>) -> vec4<f32> {
    if (ColorTexture3_bound()) {
        return ColorTexture3_sample(uv);
    }
    return vec4<f32>(1.0);
}

fn terrain_albedo(uv: vec2<f32>, height: f32) -> vec4<f32> {
    let tiled = uv * u.ColorTextureScale;
    var color = layer0(tiled);
    let r01 = u.ColorTextureRange01;
    let r12 = u.ColorTextureRange12;
    let r23 = u.ColorTextureRange23;
    color = mix(color, layer1(tiled), height_blend(r01.x, r01.y, height));
    color = mix(color, layer2(tiled), height_blend(r12.x, r12.y, height));
    color = mix(color, layer3(tiled), height_blend(r23.x, r23.y, height));
    return u.Color * color;
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    let base = terrain_albedo(input.v2.xy, input.v2.z);
    return vec4<f32>(shade_lights(input.v0.xyz, input.v1.xyz, base.rgb), base.a);
}
"#;

/// Fractal value noise, roughly in `[-1, 1]`.
pub fn fbm(point: Vec2, octaves: u32, lacunarity: f32, gain: f32, seed: u32) -> f32 {
    let mut sum = 0.0;
    let mut amplitude = 1.0;
    let mut norm = 0.0;
    let mut frequency = 2.0;
    for octave in 0..octaves {
        sum += amplitude * value_noise(point * frequency, seed.wrapping_add(octave));
        norm += amplitude;
        amplitude *= gain;
        frequency *= lacunarity;
    }
    if norm > 0.0 { sum / norm } else { 0.0 }
}

fn value_noise(point: Vec2, seed: u32) -> f32 {
    let cell = point.floor();
    let t = point - cell;
    let t = t * t * (Vec2::splat(3.0) - 2.0 * t);
    let (x, y) = (cell.x as i32, cell.y as i32);
    let lattice = |dx: i32, dy: i32| {
        let h = itugl::hash((x + dx) as u32, (y + dy) as u32, seed);
        (h & 0xffff) as f32 / 32767.5 - 1.0
    };
    let bottom = lattice(0, 0) + (lattice(1, 0) - lattice(0, 0)) * t.x;
    let top = lattice(0, 1) + (lattice(1, 1) - lattice(0, 1)) * t.x;
    bottom + (top - bottom) * t.y
}

/// Hermite step between `edge0` and `edge1`.
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Square grid of normalized heights for one chunk.
///
/// Samples are taken on the chunk's own `[0, 1]` square offset by its grid coordinate, so
/// neighbouring chunks share the heights along their common edge.
#[derive(Clone, Debug)]
pub struct Heightfield {
    size: u32,
    heights: Vec<f32>,
}

impl Heightfield {
    pub fn generate(size: u32, chunk: IVec2, seed: u32) -> Self {
        let size = size.max(2);
        let step = 1.0 / (size - 1) as f32;
        let mut heights = Vec::with_capacity((size * size) as usize);
        for j in 0..size {
            for i in 0..size {
                let point = Vec2::new(
                    i as f32 * step + chunk.x as f32,
                    j as f32 * step + chunk.y as f32,
                );
                heights.push((fbm(point, 6, 2.0, 0.5, seed) + 1.0) * 0.5);
            }
        }
        Self { size, heights }
    }

    #[cfg(test)]
    pub fn from_heights(size: u32, heights: Vec<f32>) -> Option<Self> {
        (size >= 2 && heights.len() == (size * size) as usize).then_some(Self { size, heights })
    }

    /// Height at a sample, clamped to the grid.
    pub fn height(&self, i: i32, j: i32) -> f32 {
        let last = self.size as i32 - 1;
        let (i, j) = (i.clamp(0, last), j.clamp(0, last));
        self.heights[(j * self.size as i32 + i) as usize]
    }

    /// Surface normal in chunk space, for a surface lifted by `height * height_scale`.
    ///
    /// Central differences inside the grid, one-sided along its border.
    pub fn normal(&self, i: i32, j: i32, height_scale: f32) -> Vec3 {
        let last = self.size as i32 - 1;
        let step = 1.0 / last as f32;
        let span = |a: i32, b: i32| (b.min(last) - a.max(0)) as f32 * step;
        let du = (self.height(i + 1, j) - self.height(i - 1, j)) / span(i - 1, i + 1);
        let dv = (self.height(i, j + 1) - self.height(i, j - 1)) / span(j - 1, j + 1);
        Vec3::new(-du * height_scale, 1.0, -dv * height_scale).normalize()
    }

    pub fn height_texture(&self, label: impl Into<String>) -> Texture {
        Texture::from_fn(label, self.size, self.size, |x, y| {
            let h = self.height(x as i32, y as i32);
            Vec4::new(h, h, h, 1.0)
        })
        .with_filter(Filter::Linear)
        .with_wrap(Wrap::ClampToEdge)
    }

    pub fn normal_texture(&self, label: impl Into<String>, height_scale: f32) -> Texture {
        Texture::from_fn(label, self.size, self.size, |x, y| {
            self.normal(x as i32, y as i32, height_scale).extend(0.0)
        })
        .with_filter(Filter::Linear)
        .with_wrap(Wrap::ClampToEdge)
    }
}

/// Height-blended terrain, lit by up to `max_lights` lights per batch.
///
/// Texture 0 covers the lowest ground. Each `ColorTextureRangeAB` is the height interval over
/// which texture A fades into texture B; left at its default, texture B never shows.
pub fn terrain_program(max_lights: usize) -> Result<ShaderProgram, ShaderError> {
    let slots = programs::light_slot_names(max_lights);
    let builder = ShaderProgram::builder("terrain")
        .uniform_with_default("WorldMatrix", Mat4::IDENTITY)
        .uniform_with_default("ViewProjMatrix", Mat4::IDENTITY)
        .uniform("Heightmap", UniformKind::Texture)
        .uniform("NormalMap", UniformKind::Texture)
        .uniform_with_default("HeightScale", 1.0_f32)
        .uniform_with_default("Color", Vec4::ONE)
        .uniform("ColorTexture0", UniformKind::Texture)
        .uniform("ColorTexture1", UniformKind::Texture)
        .uniform("ColorTexture2", UniformKind::Texture)
        .uniform("ColorTexture3", UniformKind::Texture)
        .uniform_with_default("ColorTextureRange01", NO_BLEND)
        .uniform_with_default("ColorTextureRange12", NO_BLEND)
        .uniform_with_default("ColorTextureRange23", NO_BLEND)
        .uniform_with_default("ColorTextureScale", Vec2::ONE);

    with_lighting(builder, max_lights)
        .vertex(terrain_vertex)
        .fragment(move |u, input| {
            let position = input.varyings.get(WORLD_POSITION).xyz();
            let normal = input.varyings.get(WORLD_NORMAL).xyz();
            let surface = input.varyings.get(SURFACE);
            let base = terrain_albedo(u, surface.xy(), surface.z);
            Some(programs::shade_lights(u, &slots, position, normal, base.xyz()).extend(base.w))
        })
        .wgsl(lighting_wgsl(max_lights, &[NORMAL_MATRIX_WGSL, TERRAIN_WGSL]))
        .build()
}

fn terrain_vertex(u: &Uniforms, v: &Vertex3d) -> VertexOutput {
    let world: Mat4 = u.get_or("WorldMatrix", Mat4::IDENTITY);
    let view_proj: Mat4 = u.get_or("ViewProjMatrix", Mat4::IDENTITY);
    let uv = Vec2::from(v.uv);

    let height = u.texture("Heightmap").map_or(0.0, |map| map.sample(uv).x);
    let local = Vec3::from(v.position) + Vec3::Y * height * u.get_or("HeightScale", 1.0_f32);
    let normal = u
        .texture("NormalMap")
        .map_or(Vec3::from(v.normal), |map| map.sample(uv).xyz());

    let position = world * local.extend(1.0);
    let normal = Mat3::from_mat4(world).inverse().transpose() * normal;
    VertexOutput::new(view_proj * position)
        .varying(WORLD_POSITION, position)
        .varying(WORLD_NORMAL, normal.extend(0.0))
        .varying(SURFACE, Vec4::new(uv.x, uv.y, height, 0.0))
}

fn terrain_albedo(u: &Uniforms, uv: Vec2, height: f32) -> Vec4 {
    let tiled = uv * u.get_or("ColorTextureScale", Vec2::ONE);
    let layer = |name: &str| u.texture(name).map_or(Vec4::ONE, |t| t.sample(tiled));

    let mut color = layer("ColorTexture0");
    for (range, next) in [
        ("ColorTextureRange01", "ColorTexture1"),
        ("ColorTextureRange12", "ColorTexture2"),
        ("ColorTextureRange23", "ColorTexture3"),
    ] {
        let range = u.get_or(range, NO_BLEND);
        color = color.lerp(layer(next), smoothstep(range.x, range.y, height));
    }
    u.get_or("Color", Vec4::ONE) * color
}
