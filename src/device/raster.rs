//! Triangle setup, clipping and scan conversion.
//!
//! Conventions match a GL-style pipeline: clip-space input, NDC depth `[-1, 1]` mapped to
//! window depth `[0, 1]`, counter-clockwise front faces. Window row 0 is the top row. Coverage
//! uses edge functions with a top-left fill rule, so triangles sharing an edge never touch the
//! same pixel twice.

use glam::{Vec2, Vec4};
use image::{Rgba, Rgba32FImage};

use super::state::{BlendState, DepthFunction};
use crate::shader::{FragmentInput, Varyings, VertexOutput};
use crate::texture::{linear_to_srgb, srgb_to_linear};

/// Per-draw fixed-function state.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RasterState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_function: DepthFunction,
    pub blend: Option<BlendState>,
    pub cull_back_faces: bool,
    /// Writes go to an 8-bit style target: clamp to `[0, 1]`.
    pub clamp: bool,
    pub srgb_encode: bool,
}

/// Attachments of the bound framebuffer, borrowed for one draw.
pub(crate) struct Target<'a> {
    pub width: u32,
    pub height: u32,
    pub color: Option<&'a mut Rgba32FImage>,
    pub depth: Option<&'a mut Rgba32FImage>,
}

struct ScreenVertex {
    pos: Vec2,
    depth: f32,
    inv_w: f32,
    varyings: Varyings,
}

/// Clips, rasterizes and shades one triangle. Returns the number of fragments written.
pub(crate) fn draw_triangle(
    target: &mut Target,
    state: &RasterState,
    vertices: [VertexOutput; 3],
    fragment: &dyn Fn(&FragmentInput) -> Option<Vec4>,
) -> u64 {
    let mut polygon = vertices.to_vec();
    // Near and far planes. Everything else is handled by the scissor to the target bounds.
    polygon = clip_polygon(&polygon, |p| p.z + p.w);
    polygon = clip_polygon(&polygon, |p| p.w - p.z);
    if polygon.len() < 3 || polygon.iter().any(|v| v.position.w <= 0.0) {
        return 0;
    }

    let screen: Vec<ScreenVertex> = polygon
        .iter()
        .map(|v| to_screen(v, target.width, target.height))
        .collect();

    let mut written = 0;
    for i in 1..screen.len() - 1 {
        written += rasterize(target, state, [&screen[0], &screen[i], &screen[i + 1]], fragment);
    }
    written
}

fn clip_polygon(polygon: &[VertexOutput], distance: impl Fn(Vec4) -> f32) -> Vec<VertexOutput> {
    let mut out = Vec::with_capacity(polygon.len() + 1);
    for (i, a) in polygon.iter().enumerate() {
        let b = &polygon[(i + 1) % polygon.len()];
        let da = distance(a.position);
        let db = distance(b.position);
        if da >= 0.0 {
            out.push(*a);
        }
        if (da >= 0.0) != (db >= 0.0) {
            let t = da / (da - db);
            out.push(VertexOutput {
                position: a.position.lerp(b.position, t),
                varyings: Varyings::lerp(&a.varyings, &b.varyings, t),
            });
        }
    }
    out
}

fn to_screen(v: &VertexOutput, width: u32, height: u32) -> ScreenVertex {
    let inv_w = 1.0 / v.position.w;
    let ndc = v.position.truncate() * inv_w;
    ScreenVertex {
        pos: Vec2::new(
            (ndc.x * 0.5 + 0.5) * width as f32,
            (0.5 - ndc.y * 0.5) * height as f32,
        ),
        depth: ndc.z * 0.5 + 0.5,
        inv_w,
        varyings: v.varyings,
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

// Assumes the triangle is oriented so that interior points give positive edge values.
fn is_top_left(a: Vec2, b: Vec2) -> bool {
    (a.y == b.y && b.x > a.x) || b.y < a.y
}

fn rasterize(
    target: &mut Target,
    state: &RasterState,
    triangle: [&ScreenVertex; 3],
    fragment: &dyn Fn(&FragmentInput) -> Option<Vec4>,
) -> u64 {
    let [v0, mut v1, mut v2] = triangle;
    let area = edge(v0.pos, v1.pos, v2.pos);
    if area == 0.0 || !area.is_finite() {
        return 0;
    }
    // Counter-clockwise in NDC is clockwise once y points down.
    let front_facing = area < 0.0;
    if state.cull_back_faces && !front_facing {
        return 0;
    }
    if area < 0.0 {
        std::mem::swap(&mut v1, &mut v2);
    }
    let area = area.abs();

    let min = v0.pos.min(v1.pos).min(v2.pos);
    let max = v0.pos.max(v1.pos).max(v2.pos);
    let x_start = min.x.floor().max(0.0) as u32;
    let y_start = min.y.floor().max(0.0) as u32;
    let x_end = (max.x.ceil().max(0.0) as u32).min(target.width);
    let y_end = (max.y.ceil().max(0.0) as u32).min(target.height);

    let edges = [
        (v1.pos, v2.pos, is_top_left(v1.pos, v2.pos)),
        (v2.pos, v0.pos, is_top_left(v2.pos, v0.pos)),
        (v0.pos, v1.pos, is_top_left(v0.pos, v1.pos)),
    ];

    let mut written = 0;
    for y in y_start..y_end {
        for x in x_start..x_end {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let mut weights = [0.0; 3];
            let mut inside = true;
            for (i, (a, b, top_left)) in edges.iter().enumerate() {
                let w = edge(*a, *b, p);
                if w < 0.0 || (w == 0.0 && !top_left) {
                    inside = false;
                    break;
                }
                weights[i] = w / area;
            }
            if !inside {
                continue;
            }

            let depth = (weights[0] * v0.depth + weights[1] * v1.depth + weights[2] * v2.depth)
                .clamp(0.0, 1.0);
            if state.depth_test {
                if let Some(depth_buffer) = target.depth.as_deref() {
                    let stored = depth_buffer.get_pixel(x, y).0[0];
                    if !state.depth_function.passes(depth, stored) {
                        continue;
                    }
                }
            }

            let perspective = [
                weights[0] * v0.inv_w,
                weights[1] * v1.inv_w,
                weights[2] * v2.inv_w,
            ];
            let inv_w = perspective[0] + perspective[1] + perspective[2];
            let varyings = Varyings::weighted(
                [&v0.varyings, &v1.varyings, &v2.varyings],
                perspective.map(|w| w / inv_w),
            );
            let input = FragmentInput {
                frag_coord: Vec4::new(p.x, p.y, depth, inv_w),
                varyings,
                front_facing,
            };
            let Some(color) = fragment(&input) else {
                continue;
            };

            if state.depth_test && state.depth_write {
                if let Some(depth_buffer) = target.depth.as_deref_mut() {
                    depth_buffer.put_pixel(x, y, depth_texel(depth));
                }
            }
            if let Some(color_buffer) = target.color.as_deref_mut() {
                let dst = Vec4::from_array(color_buffer.get_pixel(x, y).0);
                let out = shade_output(state, color, dst);
                color_buffer.put_pixel(x, y, Rgba(out.to_array()));
            }
            written += 1;
        }
    }
    written
}

/// Blending and output conversion for one fragment.
fn shade_output(state: &RasterState, src: Vec4, stored: Vec4) -> Vec4 {
    let src = if state.clamp {
        src.clamp(Vec4::ZERO, Vec4::ONE)
    } else {
        src
    };
    let dst = if state.srgb_encode {
        map_rgb(stored, srgb_to_linear)
    } else {
        stored
    };
    let mut out = match &state.blend {
        Some(blend) => blend.blend(src, dst),
        None => src,
    };
    if state.clamp {
        out = out.clamp(Vec4::ZERO, Vec4::ONE);
    }
    if state.srgb_encode {
        out = map_rgb(out, linear_to_srgb);
    }
    out
}

pub(crate) fn map_rgb(c: Vec4, f: fn(f32) -> f32) -> Vec4 {
    Vec4::new(f(c.x), f(c.y), f(c.z), c.w)
}

pub(crate) fn depth_texel(depth: f32) -> Rgba<f32> {
    Rgba([depth, depth, depth, 1.0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::state::BlendState;

    fn state() -> RasterState {
        RasterState {
            depth_test: false,
            depth_write: true,
            depth_function: DepthFunction::Less,
            blend: None,
            cull_back_faces: false,
            clamp: false,
            srgb_encode: false,
        }
    }

    fn vertex(x: f32, y: f32, z: f32) -> VertexOutput {
        VertexOutput::new(Vec4::new(x, y, z, 1.0))
    }

    fn quad(target: &mut Target, state: &RasterState, color: Vec4) -> u64 {
        let shade = move |_: &FragmentInput| Some(color);
        let a = vertex(-1.0, -1.0, 0.0);
        let b = vertex(1.0, -1.0, 0.0);
        let c = vertex(1.0, 1.0, 0.0);
        let d = vertex(-1.0, 1.0, 0.0);
        draw_triangle(target, state, [a, b, c], &shade) + draw_triangle(target, state, [a, c, d], &shade)
    }

    #[test]
    fn shared_edges_cover_each_pixel_once() {
        let mut color = Rgba32FImage::new(7, 5);
        let mut target = Target {
            width: 7,
            height: 5,
            color: Some(&mut color),
            depth: None,
        };
        let written = quad(&mut target, &state(), Vec4::ONE);
        assert_eq!(written, 35);
    }

    #[test]
    fn back_faces_are_culled() {
        let mut color = Rgba32FImage::new(4, 4);
        let mut target = Target {
            width: 4,
            height: 4,
            color: Some(&mut color),
            depth: None,
        };
        let culling = RasterState {
            cull_back_faces: true,
            ..state()
        };
        let shade = |_: &FragmentInput| Some(Vec4::ONE);
        let clockwise = [
            vertex(-1.0, -1.0, 0.0),
            vertex(-1.0, 1.0, 0.0),
            vertex(1.0, -1.0, 0.0),
        ];
        assert_eq!(draw_triangle(&mut target, &culling, clockwise, &shade), 0);
        let counter_clockwise = [clockwise[0], clockwise[2], clockwise[1]];
        assert!(draw_triangle(&mut target, &culling, counter_clockwise, &shade) > 0);
    }

    #[test]
    fn depth_test_rejects_farther_fragments() {
        let mut color = Rgba32FImage::new(2, 2);
        let mut depth = Rgba32FImage::from_pixel(2, 2, depth_texel(1.0));
        let mut target = Target {
            width: 2,
            height: 2,
            color: Some(&mut color),
            depth: Some(&mut depth),
        };
        let tested = RasterState {
            depth_test: true,
            ..state()
        };
        let near = |_: &FragmentInput| Some(Vec4::new(1.0, 0.0, 0.0, 1.0));
        let far = |_: &FragmentInput| Some(Vec4::new(0.0, 1.0, 0.0, 1.0));
        let tri = |z| [vertex(-1.0, -1.0, z), vertex(3.0, -1.0, z), vertex(-1.0, 3.0, z)];

        assert_eq!(draw_triangle(&mut target, &tested, tri(-0.5), &near), 4);
        assert_eq!(draw_triangle(&mut target, &tested, tri(0.5), &far), 0);
        assert_eq!(color.get_pixel(1, 1).0, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(depth.get_pixel(0, 0).0[0], 0.25);
    }

    #[test]
    fn triangles_behind_the_near_plane_are_clipped() {
        let mut color = Rgba32FImage::new(2, 2);
        let mut target = Target {
            width: 2,
            height: 2,
            color: Some(&mut color),
            depth: None,
        };
        let shade = |_: &FragmentInput| Some(Vec4::ONE);
        let behind = [
            vertex(-1.0, -1.0, -2.0),
            vertex(3.0, -1.0, -2.0),
            vertex(-1.0, 3.0, -2.0),
        ];
        assert_eq!(draw_triangle(&mut target, &state(), behind, &shade), 0);
    }

    #[test]
    fn varyings_interpolate_across_the_triangle() {
        let mut color = Rgba32FImage::new(4, 1);
        let mut target = Target {
            width: 4,
            height: 1,
            color: Some(&mut color),
            depth: None,
        };
        let shade = |input: &FragmentInput| Some(input.varyings.get(0));
        let tri = [
            vertex(-1.0, -1.0, 0.0).varying(0, Vec4::ZERO),
            vertex(3.0, -1.0, 0.0).varying(0, Vec4::new(2.0, 0.0, 0.0, 0.0)),
            vertex(-1.0, 3.0, 0.0).varying(0, Vec4::ZERO),
        ];
        draw_triangle(&mut target, &state(), tri, &shade);
        // u = (x_ndc + 1) / 2 along the bottom row, sampled at pixel centres.
        let first = color.get_pixel(0, 0).0[0];
        let last = color.get_pixel(3, 0).0[0];
        assert!((first - 0.125).abs() < 1e-5);
        assert!((last - 0.875).abs() < 1e-5);
    }

    #[test]
    fn screen_output_blends_in_linear_space() {
        let screen = RasterState {
            blend: Some(BlendState::alpha()),
            clamp: true,
            srgb_encode: true,
            ..state()
        };
        let stored = map_rgb(Vec4::new(0.2, 0.2, 0.2, 1.0), linear_to_srgb);
        let out = shade_output(&screen, Vec4::new(1.0, 1.0, 1.0, 0.5), stored);
        let linear = map_rgb(out, srgb_to_linear);
        assert!((linear.x - 0.6).abs() < 1e-5);
    }
}
