//! Animated, alpha-blended water surface.

use std::f32::consts::TAU;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use itugl::programs::{self, NORMAL_MATRIX_WGSL, lighting_wgsl, with_lighting};
use itugl::{ShaderError, ShaderProgram, UniformKind, Uniforms, Vertex3d, VertexOutput};

const WORLD_POSITION: usize = 0;
const WORLD_NORMAL: usize = 1;
const UV: usize = 2;

/// Wave layers as `(direction, wavelength, amplitude, speed)`, in chunk units.
const WAVES: [(Vec2, f32, f32, f32); 2] = [
    (Vec2::new(1.0, 0.3), 0.21, 0.0035, 0.05),
    (Vec2::new(-0.4, 1.0), 0.13, 0.002, 0.035),
];

/// Surface offset and its gradient at `point` on a chunk at `time`.
pub fn wave(point: Vec2, time: f32) -> (f32, Vec2) {
    let mut height = 0.0;
    let mut gradient = Vec2::ZERO;
    for (direction, wavelength, amplitude, speed) in WAVES {
        let direction = direction.normalize();
        let k = TAU / wavelength;
        let phase = k * (direction.dot(point) - speed * time);
        height += amplitude * phase.sin();
        gradient += direction * (amplitude * k * phase.cos());
    }
    (height, gradient)
}

const WATER_WGSL: &str = r#"
fn shade_vertex(input: VertexInput) -> VertexOutput {
    let waves = wave(input.position.xz, u.Time);
    let normal = vec3<f32>(-waves.y, 1.0, -waves.z);
    let local = input.position + vec3<f32>(0.0, waves.x, 0.0);
    let world = u.WorldMatrix * vec4<f32>(local, 1.0);
    var out = itugl_vertex_output(u.ViewProjMatrix * world);
    out.v0 = world;
    out.v1 = vec4<f32>(world_normal_matrix() * normal, 0.0);
    out.v2 = vec4<f32>(input.uv, 0.0, 0.0);
    return out;
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    let tiled = input.v2.xy * u.ColorTextureScale + vec2<f32>(0.02 * u.Time);
    var texel = vec4<f32>(1.0);
    if (ColorTexture_bound()) {
        texel = ColorTexture_sample(tiled);
    }
    let base = u.Color * texel;
    return vec4<f32>(shade_lights(input.v0.xyz, input.v1.xyz, base.rgb), base.a);
}
"#;

/// WGSL `wave(point, time)` returning `(height, gradient)`, one term per entry of [`WAVES`].
fn wave_wgsl() -> String {
    let mut source = String::from(
        "fn wave(point: vec2<f32>, time: f32) -> vec3<f32> {\n\
         \x20   var height = 0.0;\n\
         \x20   var gradient = vec2<f32>(0.0);\n",
    );
    for (direction, wavelength, amplitude, speed) in WAVES {
        let direction = direction.normalize();
        source.push_str(&format!(
            "    {{\n\
             \x20       let direction = vec2<f32>({:?}, {:?});\n\
             \x20       let k = {:?};\n\
             \x20       let phase = k * (dot(direction, point) - {speed:?} * time);\n\
             \x20       height = height + {amplitude:?} * sin(phase);\n\
             \x20       gradient = gradient + direction * ({amplitude:?} * k * cos(phase));\n\
             \x20   }}\n",
            direction.x,
            direction.y,
            TAU / wavelength,
        ));
    }
    source.push_str("    return vec3<f32>(height, gradient);\n}\n");
    source
}

/// Water lit by up to `max_lights` lights per batch.
///
/// `Color.w` is the surface opacity. `ColorTexture` scrolls with `Time`.
pub fn water_program(max_lights: usize) -> Result<ShaderProgram, ShaderError> {
    let slots = programs::light_slot_names(max_lights);
    let builder = ShaderProgram::builder("water")
        .uniform_with_default("WorldMatrix", Mat4::IDENTITY)
        .uniform_with_default("ViewProjMatrix", Mat4::IDENTITY)
        .uniform_with_default("Color", Vec4::ONE)
        .uniform("ColorTexture", UniformKind::Texture)
        .uniform_with_default("ColorTextureScale", Vec2::ONE)
        .uniform("Time", UniformKind::Float);
    let waves = wave_wgsl();
    let source = lighting_wgsl(max_lights, &[NORMAL_MATRIX_WGSL, &waves, WATER_WGSL]);

    with_lighting(builder, max_lights)
        .vertex(water_vertex)
        .fragment(move |u, input| {
            let position = input.varyings.get(WORLD_POSITION).xyz();
            let normal = input.varyings.get(WORLD_NORMAL).xyz();
            let uv = input.varyings.get(UV).xy();
            let time = u.get_or("Time", 0.0_f32);

            let tiled = uv * u.get_or("ColorTextureScale", Vec2::ONE) + Vec2::splat(0.02 * time);
            let texel = u.texture("ColorTexture").map_or(Vec4::ONE, |t| t.sample(tiled));
            let base = u.get_or("Color", Vec4::ONE) * texel;
            Some(programs::shade_lights(u, &slots, position, normal, base.xyz()).extend(base.w))
        })
        .wgsl(source)
        .build()
}

fn water_vertex(u: &Uniforms, v: &Vertex3d) -> VertexOutput {
    let world: Mat4 = u.get_or("WorldMatrix", Mat4::IDENTITY);
    let view_proj: Mat4 = u.get_or("ViewProjMatrix", Mat4::IDENTITY);
    let local = Vec3::from(v.position);

    let (height, gradient) = wave(Vec2::new(local.x, local.z), u.get_or("Time", 0.0_f32));
    let normal = Vec3::new(-gradient.x, 1.0, -gradient.y);

    let position = world * (local + Vec3::Y * height).extend(1.0);
    let normal = Mat3::from_mat4(world).inverse().transpose() * normal;
    VertexOutput::new(view_proj * position)
        .varying(WORLD_POSITION, position)
        .varying(WORLD_NORMAL, normal.extend(0.0))
        .varying(UV, Vec2::from(v.uv).extend(0.0).extend(0.0))
}
