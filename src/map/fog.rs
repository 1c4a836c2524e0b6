//! Height fog post effect.
//!
//! Reads the scene colour and depth, reconstructs the world position of each pixel and mixes
//! in fog that thickens towards the ground. This is the last pass working in linear colour,
//! so it also applies the sRGB transfer curve before the final copy to the screen.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};
use itugl::{ShaderError, ShaderProgram, UniformKind, VertexOutput, linear_to_srgb};

const FOG_WGSL: &str = r#"
fn shade_vertex(input: VertexInput) -> VertexOutput {
    return itugl_vertex_output(vec4<f32>(input.position, 1.0));
}

fn fog_amount(camera: vec3<f32>, point: vec3<f32>) -> f32 {
    let dist = distance(camera, point);
    let rise = (point.y - camera.y) * u.FogFalloff;
    var along = 1.0;
    if (abs(rise) > 1e-4) {
        along = (1.0 - exp(-rise)) / rise;
    }
    let optical_depth = u.FogDensity * exp(-(camera.y - u.FogHeight) * u.FogFalloff) * along * dist;
    return clamp(1.0 - exp(-max(optical_depth, 0.0)), 0.0, 1.0);
}

fn encode_srgb(c: vec3<f32>) -> vec3<f32> {
    let low = c * 12.92;
    let high = 1.055 * pow(c, vec3<f32>(1.0 / 2.4)) - 0.055;
    return select(high, low, c <= vec3<f32>(0.0031308));
}

fn shade_fragment(input: FragmentInput) -> vec4<f32> {
    if (!SourceTexture_bound()) {
        discard;
    }
    let texel = vec2<i32>(floor(input.frag_coord.xy));
    let color = SourceTexture_fetch(texel);
    var depth = 1.0;
    if (DepthTexture_bound()) {
        depth = DepthTexture_fetch(texel).x;
    }

    let size = SourceTexture_size();
    let ndc = vec4<f32>(
        input.frag_coord.x / size.x * 2.0 - 1.0,
        1.0 - input.frag_coord.y / size.y * 2.0,
        depth * 2.0 - 1.0,
        1.0,
    );
    let world = u.InvViewProjMatrix * ndc;
    let point = world.xyz / world.w;

    var amount = 0.0;
    if (depth >= 1.0) {
        let toward = point - u.CameraPosition;
        var up = 0.0;
        if (length(toward) > 0.0) {
            up = max(normalize(toward).y, 0.0);
        }
        amount = pow(1.0 - up, 6.0) * u.HorizonHaze;
    } else {
        amount = fog_amount(u.CameraPosition, point);
    }

    let rgb = clamp(mix(color.rgb, u.FogColor, amount), vec3<f32>(0.0), vec3<f32>(1.0));
    return vec4<f32>(encode_srgb(rgb), 1.0);
}
"#;

/// Fraction of fog between `camera` and `point`, for exponential height fog.
///
/// Fog density is `density` at `height` and falls off by `exp(-falloff * dy)` above it; the
/// result integrates that density along the view ray.
pub fn fog_amount(camera: Vec3, point: Vec3, density: f32, height: f32, falloff: f32) -> f32 {
    let distance = camera.distance(point);
    let rise = (point.y - camera.y) * falloff;
    let along = if rise.abs() > 1e-4 {
        (1.0 - (-rise).exp()) / rise
    } else {
        1.0
    };
    let optical_depth = density * (-(camera.y - height) * falloff).exp() * along * distance;
    (1.0 - (-optical_depth.max(0.0)).exp()).clamp(0.0, 1.0)
}

pub fn fog_program() -> Result<ShaderProgram, ShaderError> {
    ShaderProgram::builder("height fog")
        .uniform("SourceTexture", UniformKind::Texture)
        .uniform("DepthTexture", UniformKind::DepthTexture)
        .uniform_with_default("InvViewProjMatrix", Mat4::IDENTITY)
        .uniform("CameraPosition", UniformKind::Vec3)
        .uniform_with_default("FogColor", Vec3::ONE)
        .uniform("FogDensity", UniformKind::Float)
        .uniform("FogHeight", UniformKind::Float)
        .uniform_with_default("FogFalloff", 1.0_f32)
        .uniform("HorizonHaze", UniformKind::Float)
        .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
        .fragment(|u, input| {
            let source = u.texture("SourceTexture")?;
            let (x, y) = (
                input.frag_coord.x.floor() as i32,
                input.frag_coord.y.floor() as i32,
            );
            let color = source.fetch(x, y);
            let depth = u.texture("DepthTexture").map_or(1.0, |d| d.fetch(x, y).x);

            let (width, height) = source.size();
            let ndc = Vec4::new(
                input.frag_coord.x / width as f32 * 2.0 - 1.0,
                1.0 - input.frag_coord.y / height as f32 * 2.0,
                depth * 2.0 - 1.0,
                1.0,
            );
            let inverse: Mat4 = u.get_or("InvViewProjMatrix", Mat4::IDENTITY);
            let world = inverse * ndc;
            let point = world.xyz() / world.w;
            let camera = u.get_or("CameraPosition", Vec3::ZERO);

            let amount = if depth >= 1.0 {
                let up = (point - camera).normalize_or_zero().y.max(0.0);
                (1.0 - up).powi(6) * u.get_or("HorizonHaze", 0.0_f32)
            } else {
                fog_amount(
                    camera,
                    point,
                    u.get_or("FogDensity", 0.0_f32),
                    u.get_or("FogHeight", 0.0_f32),
                    u.get_or("FogFalloff", 1.0_f32),
                )
            };

            let rgb = color
                .xyz()
                .lerp(u.get_or("FogColor", Vec3::ONE), amount)
                .clamp(Vec3::ZERO, Vec3::ONE);
            Some(Vec4::new(
                linear_to_srgb(rgb.x),
                linear_to_srgb(rgb.y),
                linear_to_srgb(rgb.z),
                1.0,
            ))
        })
        .wgsl(FOG_WGSL)
        .build()
}
