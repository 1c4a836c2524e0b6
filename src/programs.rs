//! Built-in shader programs and the standard transform setup.
//!
//! | Program | Uniforms |
//! |---|---|
//! | [`copy`] | `SourceTexture` |
//! | [`unlit`] | `WorldMatrix`, `ViewProjMatrix`, `Color`, `ColorTexture` |
//! | [`lit`] | the unlit set plus `CameraPosition`, `AmbientColor`, `Specular`, light slots |
//! | [`skybox`] | `InvViewProjMatrix`, `EnvironmentTexture` |
//! | [`raymarch`] | a sphere and a box, see its docs |
//!
//! Every program carries WGSL for the GPU backend and host stages for the software one. Both
//! read the same uniforms with the same defaults.
//!
//! Varyings used by the mesh programs: slot 0 world position, slot 1 world normal, slot 2 uv.

use std::f32::consts::PI;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::mesh::Vertex3d;
use crate::renderer::TransformSetupFn;
use crate::shader::{
    ShaderError, ShaderProgram, ShaderProgramBuilder, UniformKind, Uniforms, VertexOutput,
};

const WORLD_POSITION: usize = 0;
const WORLD_NORMAL: usize = 1;
const UV: usize = 2;

/// `world_normal_matrix()`: the inverse transpose of the upper 3x3 of `WorldMatrix`.
pub const NORMAL_MATRIX_WGSL: &str = r#"
fn world_normal_matrix() -> mat3x3<f32> {
    let c0 = u.WorldMatrix[0].xyz;
    let c1 = u.WorldMatrix[1].xyz;
    let c2 = u.WorldMatrix[2].xyz;
    let cofactors = mat3x3<f32>(cross(c1, c2), cross(c2, c0), cross(c0, c1));
    let det = dot(c0, cross(c1, c2));
    if (det == 0.0) {
        return cofactors;
    }
    return cofactors * (1.0 / det);
}
"#;

/// Vertex stage shared by the mesh programs, plus the `albedo` helper.
const MESH_WGSL: &str = r#"
fn shade_vertex(input: VertexInput) -> VertexOutput {
    let world = u.WorldMatrix * vec4<f32>(input.position, 1.0);
    var out = itugl_vertex_output(u.ViewProjMatrix * world);
    out.v0 = world;
    out.v1 = vec4<f32>(world_normal_matrix() * input.normal, 0.0);
    out.v2 = vec4<f32>(input.uv, 0.0, 0.0);
    return out;
}

fn albedo(uv: vec2<f32>) -> vec4<f32> {
    if (ColorTexture_bound()) {
        return u.Color * ColorTexture_sample(uv);
    }
    return u.Color;
}
"#;

/// `shade_lights(position, normal, albedo)` over the current light batch. Needs the uniforms
/// declared by [`with_lighting`] and a `LIGHT_SLOTS` constant.
const LIGHTING_WGSL: &str = r#"
fn safe_normalize(v: vec3<f32>) -> vec3<f32> {
    let len = length(v);
    if (len > 0.0) {
        return v / len;
    }
    return vec3<f32>(0.0);
}

fn distance_attenuation(dist: f32, start: f32, end: f32) -> f32 {
    if (end <= start) {
        return 1.0;
    }
    let t = clamp((dist - start) / (end - start), 0.0, 1.0);
    return 1.0 - t * t * (3.0 - 2.0 * t);
}

fn shade_lights(position: vec3<f32>, normal_in: vec3<f32>, base: vec3<f32>) -> vec3<f32> {
    let normal = safe_normalize(normal_in);
    let view = safe_normalize(u.CameraPosition - position);
    var rgb = vec3<f32>(0.0);
    if (u.LightBatch == 0) {
        rgb = u.AmbientColor * base;
    }
    let count = min(u.LightCount, LIGHT_SLOTS);
    for (var i = 0; i < count; i++) {
        let light = u.LightPosition[i];
        var direction = -safe_normalize(light.xyz);
        var fade = 1.0;
        if (light.w != 0.0) {
            let offset = light.xyz - position;
            let fade_range = u.LightAttenuation[i];
            direction = safe_normalize(offset);
            fade = distance_attenuation(length(offset), fade_range.x, fade_range.y);
        }
        let diffuse = max(dot(normal, direction), 0.0);
        if (diffuse <= 0.0) {
            continue;
        }
        let half_vector = safe_normalize(direction + view);
        let highlight = u.Specular.x * pow(max(dot(normal, half_vector), 0.0), u.Specular.y);
        rgb += u.LightColor[i] * fade * (base * diffuse + vec3<f32>(highlight));
    }
    return rgb;
}
"#;

const COPY_WGSL: &str = r#"
fn shade_vertex(input: VertexInput) -> VertexOutput {
    return itugl_vertex_output(vec4<f32>(input.position, 1.0));
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    if (!SourceTexture_bound()) {
        discard;
    }
    return SourceTexture_fetch(vec2<i32>(floor(input.frag_coord.xy)));
}
"#;

const UNLIT_WGSL: &str = r#"
fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    return albedo(input.v2.xy);
}
"#;

const LIT_WGSL: &str = r#"
fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    let base = albedo(input.v2.xy);
    return vec4<f32>(shade_lights(input.v0.xyz, input.v1.xyz, base.rgb), base.a);
}
"#;

const SKYBOX_WGSL: &str = r#"
const PI: f32 = 3.14159265;

fn shade_vertex(input: VertexInput) -> VertexOutput {
    let xy = input.position.xy;
    let far_point = u.InvViewProjMatrix * vec4<f32>(xy, 1.0, 1.0);
    let near_point = u.InvViewProjMatrix * vec4<f32>(xy, -1.0, 1.0);
    var out = itugl_vertex_output(vec4<f32>(xy, 1.0, 1.0));
    out.v0 = vec4<f32>(far_point.xyz / far_point.w - near_point.xyz / near_point.w, 0.0);
    return out;
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    if (!EnvironmentTexture_bound()) {
        discard;
    }
    var direction = vec3<f32>(0.0, 0.0, -1.0);
    let len = length(input.v0.xyz);
    if (len > 0.0) {
        direction = input.v0.xyz / len;
    }
    let uv = vec2<f32>(
        0.5 + atan2(direction.x, -direction.z) / (2.0 * PI),
        acos(clamp(direction.y, -1.0, 1.0)) / PI,
    );
    return EnvironmentTexture_sample(uv);
}
"#;

const RAYMARCH_WGSL: &str = r#"
const MAX_STEPS: i32 = 128;
const MAX_DISTANCE: f32 = 1000.0;
const HIT_DISTANCE: f32 = 0.001;
const NORMAL_OFFSET: f32 = 0.001;

struct SceneSample {
    distance: f32,
    color: vec3<f32>,
}

fn shade_vertex(input: VertexInput) -> VertexOutput {
    var out = itugl_vertex_output(vec4<f32>(input.position.xy, 0.0, 1.0));
    out.v0 = u.InvProjMatrix * vec4<f32>(input.position.xy, 1.0, 1.0);
    return out;
}

fn box_distance(p: vec3<f32>) -> f32 {
    let rotation = mat3x3<f32>(u.BoxMatrix[0].xyz, u.BoxMatrix[1].xyz, u.BoxMatrix[2].xyz);
    let local = transpose(rotation) * (p - u.BoxMatrix[3].xyz);
    let q = abs(local) - u.BoxSize;
    return length(max(q, vec3<f32>(0.0))) + min(max(q.x, max(q.y, q.z)), 0.0);
}

fn scene(p: vec3<f32>) -> SceneSample {
    let sphere = length(p - u.SphereCenter) - u.SphereRadius;
    let box_d = box_distance(p);
    let k = u.Smoothness;
    if (k <= 0.0) {
        if (sphere < box_d) {
            return SceneSample(sphere, u.SphereColor);
        }
        return SceneSample(box_d, u.BoxColor);
    }
    let h = clamp(0.5 + 0.5 * (box_d - sphere) / k, 0.0, 1.0);
    let blended = mix(box_d, sphere, h) - k * h * (1.0 - h);
    return SceneSample(blended, mix(u.BoxColor, u.SphereColor, h));
}

fn scene_normal(p: vec3<f32>) -> vec3<f32> {
    let e = vec2<f32>(NORMAL_OFFSET, 0.0);
    let n = vec3<f32>(
        scene(p + e.xyy).distance - scene(p - e.xyy).distance,
        scene(p + e.yxy).distance - scene(p - e.yxy).distance,
        scene(p + e.yyx).distance - scene(p - e.yyx).distance,
    );
    let len = length(n);
    if (len > 0.0) {
        return n / len;
    }
    return vec3<f32>(0.0);
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    let direction = normalize(input.v0.xyz / input.v0.w);
    var t = 0.0;
    var found = false;
    for (var i = 0; i < MAX_STEPS; i++) {
        let d = scene(direction * t).distance;
        if (d < HIT_DISTANCE) {
            found = true;
            break;
        }
        t += d;
        if (t > MAX_DISTANCE) {
            break;
        }
    }
    if (!found) {
        discard;
    }
    let point = direction * t;
    let clip = u.ProjMatrix * vec4<f32>(point, 1.0);
    if (clip.z > clip.w) {
        discard;
    }
    let normal = scene_normal(point);
    let light = 0.2 + 0.8 * max(dot(normal, -direction), 0.0);
    return vec4<f32>(scene(point).color * light, 1.0);
}
"#;

/// Builds the transform setup shared by the mesh programs.
///
/// `WorldMatrix` is uploaded for every drawcall. `ViewProjMatrix` and `CameraPosition` are only
/// uploaded when the camera changed. Uniforms the program does not declare are skipped.
pub fn standard_transform_setup(program: &ShaderProgram) -> TransformSetupFn {
    let world = program.uniform_location("WorldMatrix");
    let view_proj = program.uniform_location("ViewProjMatrix");
    let camera_position = program.uniform_location("CameraPosition");

    Box::new(move |program, world_matrix, camera, camera_changed| {
        if camera_changed {
            if let Some(location) = view_proj {
                program.set_uniform(location, camera.view_projection_matrix());
            }
            if let Some(location) = camera_position {
                program.set_uniform(location, camera.extract_translation());
            }
        }
        if let Some(location) = world {
            program.set_uniform(location, *world_matrix);
        }
    })
}

/// Fullscreen pass-through. Fetches `SourceTexture` at the fragment's own pixel, so copying
/// between targets of the same size is exact.
pub fn copy() -> Result<ShaderProgram, ShaderError> {
    ShaderProgram::builder("copy")
        .uniform("SourceTexture", UniformKind::Texture)
        .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
        .fragment(|u, input| {
            let source = u.texture("SourceTexture")?;
            Some(source.fetch(
                input.frag_coord.x.floor() as i32,
                input.frag_coord.y.floor() as i32,
            ))
        })
        .wgsl(COPY_WGSL)
        .build()
}

/// Declares the uniforms read by the mesh vertex stage and `albedo`.
fn with_mesh_uniforms(builder: ShaderProgramBuilder) -> ShaderProgramBuilder {
    builder
        .uniform_with_default("WorldMatrix", Mat4::IDENTITY)
        .uniform_with_default("ViewProjMatrix", Mat4::IDENTITY)
        .uniform_with_default("Color", Vec4::ONE)
        .uniform("ColorTexture", UniformKind::Texture)
}

/// Flat colour, optionally modulated by `ColorTexture`.
pub fn unlit() -> Result<ShaderProgram, ShaderError> {
    with_mesh_uniforms(ShaderProgram::builder("unlit"))
        .vertex(mesh_vertex)
        .fragment(|u, input| Some(albedo(u, input.varyings.get(UV).xy())))
        .wgsl([NORMAL_MATRIX_WGSL, MESH_WGSL, UNLIT_WGSL].concat())
        .build()
}

/// Lambert diffuse plus Blinn-Phong specular, with up to `max_lights` lights per batch.
///
/// `AmbientColor` is only added on batch 0, so it is counted once however many batches a
/// drawcall takes. `Specular` is `(strength, exponent)`. Point lights fade out smoothly between
/// the two attenuation distances.
pub fn lit(max_lights: usize) -> Result<ShaderProgram, ShaderError> {
    let slots = light_slot_names(max_lights);
    let builder = with_mesh_uniforms(ShaderProgram::builder(format!("lit x{max_lights}")));

    with_lighting(builder, max_lights)
        .vertex(mesh_vertex)
        .fragment(move |u, input| {
            let position = input.varyings.get(WORLD_POSITION).xyz();
            let normal = input.varyings.get(WORLD_NORMAL).xyz();
            let base = albedo(u, input.varyings.get(UV).xy());
            Some(shade_lights(u, &slots, position, normal, base.xyz()).extend(base.w))
        })
        .wgsl(lighting_wgsl(max_lights, &[NORMAL_MATRIX_WGSL, MESH_WGSL, LIT_WGSL]))
        .build()
}

/// WGSL for a program that calls `shade_lights`, with `LIGHT_SLOTS` set to `max_lights`.
pub fn lighting_wgsl(max_lights: usize, sources: &[&str]) -> String {
    let mut source = format!("const LIGHT_SLOTS: i32 = {max_lights};\n{LIGHTING_WGSL}");
    for part in sources {
        source.push_str(part);
    }
    source
}

/// Uniform names of `max_lights` light slots, as `[color, position, attenuation]`.
pub fn light_slot_names(max_lights: usize) -> Vec<[String; 3]> {
    (0..max_lights)
        .map(|i| {
            [
                format!("LightColor[{i}]"),
                format!("LightPosition[{i}]"),
                format!("LightAttenuation[{i}]"),
            ]
        })
        .collect()
}

/// Declares the uniforms read by [`shade_lights`] and filled by
/// [`batched_light_update`](crate::light::batched_light_update).
pub fn with_lighting(builder: ShaderProgramBuilder, max_lights: usize) -> ShaderProgramBuilder {
    builder
        .uniform("CameraPosition", UniformKind::Vec3)
        .uniform("AmbientColor", UniformKind::Vec3)
        .uniform_with_default("Specular", Vec2::new(0.0, 16.0))
        .uniform("LightCount", UniformKind::Int)
        .uniform("LightBatch", UniformKind::Int)
        .uniform_array("LightColor", UniformKind::Vec3, max_lights)
        .uniform_array("LightPosition", UniformKind::Vec4, max_lights)
        .uniform_array("LightAttenuation", UniformKind::Vec4, max_lights)
}

/// Shades the current light batch: the first `LightCount` slots, plus ambient on batch 0.
pub fn shade_lights(
    u: &Uniforms,
    slots: &[[String; 3]],
    position: Vec3,
    normal: Vec3,
    albedo: Vec3,
) -> Vec3 {
    let count = u.get_or::<i32>("LightCount", 0).max(0) as usize;
    shade(u, &slots[..count.min(slots.len())], position, normal, albedo)
}

/// Equirectangular environment drawn at the far plane.
///
/// The view ray of each corner is reconstructed from `InvViewProjMatrix`; it is linear across
/// the screen, so interpolating it per vertex is exact.
pub fn skybox() -> Result<ShaderProgram, ShaderError> {
    ShaderProgram::builder("skybox")
        .uniform_with_default("InvViewProjMatrix", Mat4::IDENTITY)
        .uniform("EnvironmentTexture", UniformKind::Texture)
        .vertex(|u, v| {
            let inverse: Mat4 = u.get_or("InvViewProjMatrix", Mat4::IDENTITY);
            let [x, y, _] = v.position;
            let far = inverse * Vec4::new(x, y, 1.0, 1.0);
            let near = inverse * Vec4::new(x, y, -1.0, 1.0);
            let direction = far.xyz() / far.w - near.xyz() / near.w;
            VertexOutput::new(Vec4::new(x, y, 1.0, 1.0)).varying(0, direction.extend(0.0))
        })
        .fragment(|u, input| {
            let direction = input.varyings.get(0).xyz().normalize_or(Vec3::NEG_Z);
            let environment = u.texture("EnvironmentTexture")?;
            Some(environment.sample(equirectangular_uv(direction)))
        })
        .wgsl(SKYBOX_WGSL)
        .build()
}

const MAX_STEPS: usize = 128;
const MAX_DISTANCE: f32 = 1000.0;
const HIT_DISTANCE: f32 = 0.001;
const NORMAL_OFFSET: f32 = 0.001;

/// Fullscreen sphere tracing of a sphere and a box, joined with a smooth union.
///
/// Everything lives in view space with the camera at the origin. `SphereCenter` and `BoxMatrix`
/// are expected in view space already; `BoxMatrix` must be a rotation plus translation and
/// `BoxSize` holds the half extents. `Smoothness` is the blend radius of the union, 0 giving a
/// hard minimum. Rays come from `InvProjMatrix`; hits beyond the far plane of `ProjMatrix` and
/// misses are discarded.
pub fn raymarch() -> Result<ShaderProgram, ShaderError> {
    ShaderProgram::builder("raymarch")
        .uniform_with_default("SphereColor", Vec3::new(0.0, 0.0, 1.0))
        .uniform_with_default("SphereCenter", Vec3::new(-2.0, 0.0, -10.0))
        .uniform_with_default("SphereRadius", 1.25_f32)
        .uniform_with_default("BoxColor", Vec3::new(1.0, 0.0, 0.0))
        .uniform_with_default("BoxMatrix", Mat4::from_translation(Vec3::new(2.0, 0.0, -10.0)))
        .uniform_with_default("BoxSize", Vec3::ONE)
        .uniform_with_default("Smoothness", 0.5_f32)
        .uniform_with_default("ProjMatrix", Mat4::IDENTITY)
        .uniform_with_default("InvProjMatrix", Mat4::IDENTITY)
        .vertex(|u, v| {
            let inverse: Mat4 = u.get_or("InvProjMatrix", Mat4::IDENTITY);
            let [x, y, _] = v.position;
            VertexOutput::new(Vec4::new(x, y, 0.0, 1.0)).varying(0, inverse * Vec4::new(x, y, 1.0, 1.0))
        })
        .fragment(|u, input| {
            let ray = input.varyings.get(0);
            let direction = (ray.xyz() / ray.w).normalize_or_zero();
            let scene = RaymarchScene::from_uniforms(u);
            let t = scene.trace(direction)?;
            let point = direction * t;
            let projection: Mat4 = u.get_or("ProjMatrix", Mat4::IDENTITY);
            let clip = projection * point.extend(1.0);
            if clip.z > clip.w {
                return None;
            }
            let light = 0.2 + 0.8 * scene.normal(point).dot(-direction).max(0.0);
            Some((scene.sample(point).1 * light).extend(1.0))
        })
        .wgsl(RAYMARCH_WGSL)
        .build()
}

struct RaymarchScene {
    sphere_color: Vec3,
    sphere_center: Vec3,
    sphere_radius: f32,
    box_color: Vec3,
    box_rotation: Mat3,
    box_translation: Vec3,
    box_size: Vec3,
    smoothness: f32,
}

impl RaymarchScene {
    fn from_uniforms(u: &Uniforms) -> Self {
        let box_matrix: Mat4 = u.get_or("BoxMatrix", Mat4::IDENTITY);
        Self {
            sphere_color: u.get_or("SphereColor", Vec3::ZERO),
            sphere_center: u.get_or("SphereCenter", Vec3::ZERO),
            sphere_radius: u.get_or("SphereRadius", 0.0),
            box_color: u.get_or("BoxColor", Vec3::ZERO),
            box_rotation: Mat3::from_mat4(box_matrix),
            box_translation: box_matrix.w_axis.xyz(),
            box_size: u.get_or("BoxSize", Vec3::ZERO),
            smoothness: u.get_or("Smoothness", 0.0),
        }
    }

    fn box_distance(&self, p: Vec3) -> f32 {
        let local = self.box_rotation.transpose() * (p - self.box_translation);
        let q = local.abs() - self.box_size;
        q.max(Vec3::ZERO).length() + q.max_element().min(0.0)
    }

    /// Distance and colour of the smooth union at `p`.
    fn sample(&self, p: Vec3) -> (f32, Vec3) {
        let sphere = (p - self.sphere_center).length() - self.sphere_radius;
        let cube = self.box_distance(p);
        let k = self.smoothness;
        if k <= 0.0 {
            return if sphere < cube {
                (sphere, self.sphere_color)
            } else {
                (cube, self.box_color)
            };
        }
        let h = (0.5 + 0.5 * (cube - sphere) / k).clamp(0.0, 1.0);
        let distance = cube + (sphere - cube) * h - k * h * (1.0 - h);
        (distance, self.box_color.lerp(self.sphere_color, h))
    }

    /// Distance along `direction` to the first hit, if any.
    fn trace(&self, direction: Vec3) -> Option<f32> {
        let mut t = 0.0;
        for _ in 0..MAX_STEPS {
            let (d, _) = self.sample(direction * t);
            if d < HIT_DISTANCE {
                return Some(t);
            }
            t += d;
            if t > MAX_DISTANCE {
                return None;
            }
        }
        None
    }

    fn normal(&self, p: Vec3) -> Vec3 {
        let d = |offset: Vec3| self.sample(p + offset).0 - self.sample(p - offset).0;
        Vec3::new(
            d(Vec3::X * NORMAL_OFFSET),
            d(Vec3::Y * NORMAL_OFFSET),
            d(Vec3::Z * NORMAL_OFFSET),
        )
        .normalize_or_zero()
    }
}

/// Maps a direction to equirectangular texture coordinates, `v = 0` looking straight up.
pub fn equirectangular_uv(direction: Vec3) -> Vec2 {
    Vec2::new(
        0.5 + direction.x.atan2(-direction.z) / (2.0 * PI),
        direction.y.clamp(-1.0, 1.0).acos() / PI,
    )
}

/// Smooth fade from 1 at `start` to 0 at `end`. A non-positive range never fades.
pub fn distance_attenuation(distance: f32, start: f32, end: f32) -> f32 {
    if end <= start {
        return 1.0;
    }
    let t = ((distance - start) / (end - start)).clamp(0.0, 1.0);
    1.0 - t * t * (3.0 - 2.0 * t)
}

fn mesh_vertex(u: &Uniforms, v: &Vertex3d) -> VertexOutput {
    let world: Mat4 = u.get_or("WorldMatrix", Mat4::IDENTITY);
    let view_proj: Mat4 = u.get_or("ViewProjMatrix", Mat4::IDENTITY);
    let position = world * Vec3::from(v.position).extend(1.0);
    let normal = Mat3::from_mat4(world).inverse().transpose() * Vec3::from(v.normal);
    VertexOutput::new(view_proj * position)
        .varying(WORLD_POSITION, position)
        .varying(WORLD_NORMAL, normal.extend(0.0))
        .varying(UV, Vec2::from(v.uv).extend(0.0).extend(0.0))
}

fn albedo(u: &Uniforms, uv: Vec2) -> Vec4 {
    let color = u.get_or("Color", Vec4::ONE);
    match u.texture("ColorTexture") {
        Some(texture) => color * texture.sample(uv),
        None => color,
    }
}

fn shade(u: &Uniforms, lights: &[[String; 3]], position: Vec3, normal: Vec3, albedo: Vec3) -> Vec3 {
    let normal = normal.normalize_or_zero();
    let camera: Vec3 = u.get_or("CameraPosition", Vec3::ZERO);
    let view = (camera - position).normalize_or_zero();
    let specular = u.get_or("Specular", Vec2::new(0.0, 16.0));

    let mut rgb = if u.get_or::<i32>("LightBatch", 0) == 0 {
        u.get_or("AmbientColor", Vec3::ZERO) * albedo
    } else {
        Vec3::ZERO
    };

    for [color, position_name, attenuation] in lights {
        let Some(radiance) = u.get::<Vec3>(color) else {
            continue;
        };
        let light = u.get_or(position_name, Vec4::ZERO);
        let (direction, fade) = if light.w == 0.0 {
            (-light.xyz().normalize_or_zero(), 1.0)
        } else {
            let offset = light.xyz() - position;
            let range = u.get_or(attenuation, Vec4::ZERO);
            (
                offset.normalize_or_zero(),
                distance_attenuation(offset.length(), range.x, range.y),
            )
        };

        let diffuse = normal.dot(direction).max(0.0);
        if diffuse <= 0.0 {
            continue;
        }
        let half = (direction + view).normalize_or_zero();
        let highlight = specular.x * normal.dot(half).max(0.0).powf(specular.y);
        rgb += radiance * fade * (albedo * diffuse + Vec3::splat(highlight));
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::device::Device;
    use crate::material::Material;
    use crate::renderer::{PostFxRenderPass, Renderer};
    use crate::shader::{FragmentInput, UniformValue};
    use crate::texture::Texture;
    use std::rc::Rc;

    #[test]
    fn transform_setup_skips_camera_uniforms_when_unchanged() {
        let program = unlit().unwrap();
        let setup = standard_transform_setup(&program);
        let camera = Camera::new().at(0.0, 0.0, 3.0);
        let view_proj = program.uniform_location("ViewProjMatrix").unwrap();
        let world = program.uniform_location("WorldMatrix").unwrap();

        setup(&program, &Mat4::IDENTITY, &camera, true);
        setup(&program, &Mat4::from_translation(Vec3::X), &camera, false);
        setup(&program, &Mat4::IDENTITY, &camera, false);

        assert_eq!(program.upload_count(view_proj), 1);
        assert_eq!(program.upload_count(world), 3);
        assert_eq!(
            program.get_uniform::<Mat4>("ViewProjMatrix"),
            Ok(camera.view_projection_matrix())
        );
    }

    #[test]
    fn ambient_is_applied_on_the_first_batch_only() {
        let program = lit(1).unwrap();
        let set = |name: &str, value: UniformValue| {
            program.set_uniform(program.uniform_location(name).unwrap(), value);
        };
        set("AmbientColor", Vec3::splat(0.25).into());
        set("LightCount", UniformValue::Int(0));

        let lights: [[String; 3]; 0] = [];
        let shade_batch = |batch: i32| {
            set("LightBatch", UniformValue::Int(batch));
            program.with_uniforms(|u| shade(u, &lights, Vec3::ZERO, Vec3::Y, Vec3::ONE))
        };
        assert_eq!(shade_batch(0), Vec3::splat(0.25));
        assert_eq!(shade_batch(1), Vec3::ZERO);
    }

    #[test]
    fn directional_light_follows_lambert() {
        let program = lit(1).unwrap();
        let slots = [[
            "LightColor[0]".to_string(),
            "LightPosition[0]".to_string(),
            "LightAttenuation[0]".to_string(),
        ]];
        let set = |name: &str, value: UniformValue| {
            program.set_uniform(program.uniform_location(name).unwrap(), value);
        };
        set("LightColor[0]", Vec3::ONE.into());
        // Light travelling straight down, hitting an upward normal at full strength.
        set("LightPosition[0]", Vec4::new(0.0, -1.0, 0.0, 0.0).into());
        set("LightBatch", UniformValue::Int(1));
        let lit_up = program.with_uniforms(|u| shade(u, &slots, Vec3::ZERO, Vec3::Y, Vec3::splat(0.5)));
        assert!((lit_up - Vec3::splat(0.5)).length() < 1e-6);

        let facing_away =
            program.with_uniforms(|u| shade(u, &slots, Vec3::ZERO, Vec3::NEG_Y, Vec3::splat(0.5)));
        assert_eq!(facing_away, Vec3::ZERO);
    }

    #[test]
    fn attenuation_fades_between_the_distances() {
        assert_eq!(distance_attenuation(0.5, 1.0, 3.0), 1.0);
        assert_eq!(distance_attenuation(2.0, 1.0, 3.0), 0.5);
        assert_eq!(distance_attenuation(4.0, 1.0, 3.0), 0.0);
        assert_eq!(distance_attenuation(100.0, 0.0, 0.0), 1.0);
    }

    #[test]
    fn equirectangular_poles_and_horizon() {
        assert!(equirectangular_uv(Vec3::Y).y.abs() < 1e-6);
        assert!((equirectangular_uv(Vec3::NEG_Y).y - 1.0).abs() < 1e-6);
        let forward = equirectangular_uv(Vec3::NEG_Z);
        assert!((forward - Vec2::new(0.5, 0.5)).length() < 1e-6);
    }

    #[test]
    fn copy_without_a_source_discards() {
        let program = copy().unwrap();
        let input = FragmentInput {
            frag_coord: Vec4::new(0.5, 0.5, 0.0, 1.0),
            varyings: Default::default(),
            front_facing: true,
        };
        let discarded = program.with_uniforms(|u| program.run_fragment(u, &input));
        assert_eq!(discarded, None);

        let texture = Rc::new(Texture::solid("src", Vec4::ONE));
        program.set_uniform(program.uniform_location("SourceTexture").unwrap(), texture);
        let color = program.with_uniforms(|u| program.run_fragment(u, &input));
        assert_eq!(color, Some(Vec4::ONE));
    }

    #[test]
    fn raymarch_hits_the_sphere_through_a_postfx_pass() {
        let sphere_color = Vec3::new(0.2, 0.6, 0.9);
        let projection = Camera::new().with_aspect(1.0).projection_matrix();
        let mut material = Material::new(Rc::new(raymarch().unwrap()));
        material.set_uniform_value("SphereColor", sphere_color);
        material.set_uniform_value("SphereCenter", Vec3::new(0.0, 0.0, -10.0));
        material.set_uniform_value(
            "BoxMatrix",
            Mat4::from_translation(Vec3::new(100.0, 0.0, -10.0)),
        );
        material.set_uniform_value("ProjMatrix", projection);
        material.set_uniform_value("InvProjMatrix", projection.inverse());

        // An odd size puts the centre pixel exactly on the view axis.
        let clear = Vec4::new(0.1, 0.1, 0.1, 1.0);
        let mut renderer = Renderer::new(Device::software(15, 15));
        renderer.add_render_pass(PostFxRenderPass::new(material.into_shared()));
        renderer.device_mut().clear(Some(clear), Some(1.0));
        renderer.render();

        let center = renderer.device().read_pixel(7, 7);
        assert!((center.xyz() - sphere_color).abs().max_element() < 1e-2);
        assert_eq!(center.w, 1.0);
        assert_eq!(renderer.device().read_pixel(0, 0), clear);
        assert_eq!(renderer.device().read_pixel(14, 14), clear);
    }

    #[test]
    fn smooth_union_blends_halfway_between_the_shapes() {
        let scene = RaymarchScene {
            sphere_color: Vec3::new(0.0, 0.0, 1.0),
            sphere_center: Vec3::ZERO,
            sphere_radius: 1.0,
            box_color: Vec3::new(1.0, 0.0, 0.0),
            box_rotation: Mat3::IDENTITY,
            box_translation: Vec3::new(3.0, 0.0, 0.0),
            box_size: Vec3::ONE,
            smoothness: 0.5,
        };
        let (distance, color) = scene.sample(Vec3::new(1.5, 0.0, 0.0));
        assert!((distance - 0.375).abs() < 1e-6);
        assert!((color - Vec3::new(0.5, 0.0, 0.5)).length() < 1e-6);

        let hard = RaymarchScene {
            smoothness: 0.0,
            ..scene
        };
        assert_eq!(hard.sample(Vec3::new(-1.5, 0.0, 0.0)), (0.5, Vec3::new(0.0, 0.0, 1.0)));
    }

    #[test]
    fn rays_that_miss_everything_are_discarded() {
        let program = raymarch().unwrap();
        // The defaults place the sphere left of the view axis and the box right of it.
        let scene = program.with_uniforms(RaymarchScene::from_uniforms);
        assert_eq!(scene.trace(Vec3::Y), None);
        assert!(scene.trace(Vec3::new(-0.2, 0.0, -1.0).normalize()).is_some());
    }
}
