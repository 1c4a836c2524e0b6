//! Mesh geometry, models and spatial transforms.
//!
//! - [`Vertex3d`]: the vertex format every mesh uses (position, normal, uv)
//! - [`Submesh`] / [`Mesh`]: indexed triangle lists; a drawcall names one submesh
//! - [`Model`]: a shared mesh plus one material per submesh
//! - [`Transform`]: position, rotation and scale for placing things in the world
//!
//! # Creating Meshes
//!
//! ```ignore
//! use itugl::*;
//!
//! let cube = Mesh::cube();
//! let sphere = Mesh::sphere(32, 16);
//! let terrain_patch = Mesh::grid(128, 128);
//!
//! let triangle = Mesh::new(
//!     vec![
//!         Vertex3d::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.5, 0.0]),
//!         Vertex3d::new([-1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
//!         Vertex3d::new([1.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 1.0]),
//!     ],
//!     vec![0, 1, 2],
//! );
//! ```
//!
//! All built-in primitives wind their triangles counter-clockwise when seen from outside.

use std::cell::RefCell;
use std::rc::Rc;

use glam::{Mat4, Quat, Vec3};

use crate::device::MeshBuffers;
use crate::material::SharedMaterial;

/// A vertex with position, normal and texture coordinates.
///
/// `#[repr(C)]` plus [`bytemuck::Pod`] keep the layout fixed (32 bytes), so vertex data can be
/// viewed as raw bytes.
///
/// # Example
///
/// ```ignore
/// use itugl::Vertex3d;
///
/// let vertex = Vertex3d::new(
///     [0.0, 1.0, 0.0],  // position
///     [0.0, 1.0, 0.0],  // normal (pointing up)
///     [0.5, 0.5],       // uv (center of texture)
/// );
/// ```
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex3d {
    /// The 3D position of this vertex in model space.
    pub position: [f32; 3],
    /// The surface normal vector (should be normalized for correct lighting).
    pub normal: [f32; 3],
    /// Texture coordinates, typically in the range [0, 1].
    pub uv: [f32; 2],
}

impl Vertex3d {
    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// One indexed triangle list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Submesh {
    pub vertices: Vec<Vertex3d>,
    /// Three indices per triangle.
    pub indices: Vec<u32>,
}

impl Submesh {
    pub fn new(vertices: Vec<Vertex3d>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Geometry made of one or more submeshes.
///
/// Meshes are immutable once built and are shared through `Rc` between the models and
/// drawcalls that reference them. The GPU device uploads a mesh on its first draw and keeps the
/// buffers with the mesh.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    submeshes: Vec<Submesh>,
    gpu: RefCell<Option<Rc<MeshBuffers>>>,
}

impl PartialEq for Mesh {
    fn eq(&self, other: &Self) -> bool {
        self.submeshes == other.submeshes
    }
}

impl Mesh {
    /// A mesh with a single submesh.
    pub fn new(vertices: Vec<Vertex3d>, indices: Vec<u32>) -> Self {
        Self::from_submeshes(vec![Submesh::new(vertices, indices)])
    }

    pub fn from_submeshes(submeshes: Vec<Submesh>) -> Self {
        Self {
            submeshes,
            gpu: RefCell::default(),
        }
    }

    /// Appends a submesh and returns its index.
    pub fn add_submesh(&mut self, submesh: Submesh) -> usize {
        self.submeshes.push(submesh);
        self.gpu.get_mut().take();
        self.submeshes.len() - 1
    }

    pub fn submesh(&self, index: usize) -> Option<&Submesh> {
        self.submeshes.get(index)
    }

    pub fn submesh_count(&self) -> usize {
        self.submeshes.len()
    }

    pub fn submeshes(&self) -> &[Submesh] {
        &self.submeshes
    }

    pub(crate) fn gpu_buffers(&self) -> &RefCell<Option<Rc<MeshBuffers>>> {
        &self.gpu
    }

    /// A single triangle that covers the whole viewport.
    ///
    /// Positions are already in clip space (`z = 0`); uvs map the visible region to
    /// `[0, 1]` with `v = 0` at the top.
    pub fn fullscreen_triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        Self::new(
            vec![
                Vertex3d::new([-1.0, -1.0, 0.0], normal, [0.0, 1.0]),
                Vertex3d::new([3.0, -1.0, 0.0], normal, [2.0, 1.0]),
                Vertex3d::new([-1.0, 3.0, 0.0], normal, [0.0, -1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    /// Unit cube centered at the origin, with per-face normals.
    pub fn cube() -> Self {
        // Each face has its own vertices for correct normals
        #[rustfmt::skip]
        let vertices = vec![
            // Front face (Z+)
            Vertex3d::new([-0.5, -0.5,  0.5], [ 0.0,  0.0,  1.0], [0.0, 1.0]),
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 0.0,  0.0,  1.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 0.0,  0.0,  1.0], [1.0, 0.0]),
            Vertex3d::new([-0.5,  0.5,  0.5], [ 0.0,  0.0,  1.0], [0.0, 0.0]),
            // Back face (Z-)
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 0.0,  0.0, -1.0], [0.0, 1.0]),
            Vertex3d::new([-0.5, -0.5, -0.5], [ 0.0,  0.0, -1.0], [1.0, 1.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [ 0.0,  0.0, -1.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 0.0,  0.0, -1.0], [0.0, 0.0]),
            // Top face (Y+)
            Vertex3d::new([-0.5,  0.5,  0.5], [ 0.0,  1.0,  0.0], [0.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 0.0,  1.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 0.0,  1.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [ 0.0,  1.0,  0.0], [0.0, 0.0]),
            // Bottom face (Y-)
            Vertex3d::new([-0.5, -0.5, -0.5], [ 0.0, -1.0,  0.0], [0.0, 1.0]),
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 0.0, -1.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 0.0, -1.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([-0.5, -0.5,  0.5], [ 0.0, -1.0,  0.0], [0.0, 0.0]),
            // Right face (X+)
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 1.0,  0.0,  0.0], [0.0, 1.0]),
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 1.0,  0.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 1.0,  0.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 1.0,  0.0,  0.0], [0.0, 0.0]),
            // Left face (X-)
            Vertex3d::new([-0.5, -0.5, -0.5], [-1.0,  0.0,  0.0], [0.0, 1.0]),
            Vertex3d::new([-0.5, -0.5,  0.5], [-1.0,  0.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([-0.5,  0.5,  0.5], [-1.0,  0.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [-1.0,  0.0,  0.0], [0.0, 0.0]),
        ];

        #[rustfmt::skip]
        let indices: Vec<u32> = vec![
            0,  1,  2,  2,  3,  0,  // front
            4,  5,  6,  6,  7,  4,  // back
            8,  9,  10, 10, 11, 8,  // top
            12, 13, 14, 14, 15, 12, // bottom
            16, 17, 18, 18, 19, 16, // right
            20, 21, 22, 22, 23, 20, // left
        ];

        Self::new(vertices, indices)
    }

    /// UV sphere of diameter 1.
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        for ring in 0..=rings {
            let phi = std::f32::consts::PI * ring as f32 / rings as f32;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for seg in 0..=segments {
                let theta = 2.0 * std::f32::consts::PI * seg as f32 / segments as f32;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();

                let position = [x * 0.5, y * 0.5, z * 0.5];
                let normal = [x, y, z];
                let uv = [seg as f32 / segments as f32, ring as f32 / rings as f32];

                vertices.push(Vertex3d::new(position, normal, uv));
            }
        }

        for ring in 0..rings {
            for seg in 0..segments {
                let current = ring * (segments + 1) + seg;
                let next = current + segments + 1;

                indices.extend_from_slice(&[current, current + 1, next]);
                indices.extend_from_slice(&[current + 1, next + 1, next]);
            }
        }

        Self::new(vertices, indices)
    }

    /// Square on the XZ plane facing +Y, centered at the origin.
    pub fn plane(size: f32) -> Self {
        let half = size * 0.5;
        let up = [0.0, 1.0, 0.0];
        let vertices = vec![
            Vertex3d::new([-half, 0.0, -half], up, [0.0, 0.0]),
            Vertex3d::new([half, 0.0, -half], up, [1.0, 0.0]),
            Vertex3d::new([half, 0.0, half], up, [1.0, 1.0]),
            Vertex3d::new([-half, 0.0, half], up, [0.0, 1.0]),
        ];

        Self::new(vertices, vec![0, 2, 1, 0, 3, 2])
    }

    /// A `columns` x `rows` grid covering `[0, 1]` on X and Z, facing +Y.
    ///
    /// UVs equal the XZ position, which makes the grid a natural terrain patch: a height map
    /// sampled at the uv displaces each vertex.
    pub fn grid(columns: u32, rows: u32) -> Self {
        let columns = columns.max(1);
        let rows = rows.max(1);
        let mut vertices = Vec::with_capacity(((columns + 1) * (rows + 1)) as usize);
        let mut indices = Vec::with_capacity((columns * rows * 6) as usize);

        for j in 0..=rows {
            for i in 0..=columns {
                let u = i as f32 / columns as f32;
                let v = j as f32 / rows as f32;
                vertices.push(Vertex3d::new([u, 0.0, v], [0.0, 1.0, 0.0], [u, v]));
            }
        }

        for j in 0..rows {
            for i in 0..columns {
                let v0 = j * (columns + 1) + i;
                let v1 = v0 + 1;
                let v3 = v0 + columns + 1;
                let v2 = v3 + 1;
                indices.extend_from_slice(&[v0, v2, v1, v0, v3, v2]);
            }
        }

        Self::new(vertices, indices)
    }
}

/// A shared mesh with one material per submesh.
///
/// Submesh `i` is drawn with material `i`; when there are fewer materials than submeshes the
/// last material is reused.
#[derive(Clone, Debug)]
pub struct Model {
    pub mesh: Rc<Mesh>,
    pub materials: Vec<SharedMaterial>,
}

impl Model {
    pub fn new(mesh: Rc<Mesh>, material: SharedMaterial) -> Self {
        Self {
            mesh,
            materials: vec![material],
        }
    }

    pub fn with_materials(mesh: Rc<Mesh>, materials: Vec<SharedMaterial>) -> Self {
        Self { mesh, materials }
    }

    /// Material used by `submesh`.
    pub fn material_for(&self, submesh: usize) -> Option<&SharedMaterial> {
        self.materials
            .get(submesh)
            .or_else(|| self.materials.last())
    }
}

/// Position, rotation, and scale for placing objects in 3D space.
///
/// ```ignore
/// use itugl::{Transform, Vec3, Quat};
///
/// let transform = Transform::new()
///     .position(Vec3::new(0.0, 5.0, -10.0))
///     .rotation(Quat::from_rotation_y(std::f32::consts::PI / 4.0))
///     .uniform_scale(2.0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    /// World matrix: scale, then rotate, then translate.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face_normal(submesh: &Submesh, triangle: usize) -> Vec3 {
        let i = &submesh.indices[triangle * 3..triangle * 3 + 3];
        let p = |k: usize| Vec3::from(submesh.vertices[i[k] as usize].position);
        (p(1) - p(0)).cross(p(2) - p(0))
    }

    #[test]
    fn primitives_wind_counter_clockwise() {
        for mesh in [Mesh::cube(), Mesh::sphere(8, 4), Mesh::plane(2.0), Mesh::grid(3, 2)] {
            let submesh = mesh.submesh(0).unwrap();
            for triangle in 0..submesh.triangle_count() {
                let n = face_normal(submesh, triangle);
                if n.length_squared() < 1e-12 {
                    continue; // degenerate pole triangles
                }
                let i = submesh.indices[triangle * 3] as usize;
                let outward = Vec3::from(submesh.vertices[i].normal);
                assert!(n.dot(outward) > 0.0, "triangle {triangle} faces inward");
            }
        }
    }

    #[test]
    fn grid_covers_the_unit_square() {
        let grid = Mesh::grid(4, 2);
        let submesh = grid.submesh(0).unwrap();
        assert_eq!(submesh.vertices.len(), 15);
        assert_eq!(submesh.triangle_count(), 16);
        assert_eq!(submesh.vertices.last().unwrap().position, [1.0, 0.0, 1.0]);
    }

    #[test]
    fn fullscreen_triangle_is_a_single_submesh() {
        let mesh = Mesh::fullscreen_triangle();
        assert_eq!(mesh.submesh_count(), 1);
        assert_eq!(mesh.submesh(0).unwrap().triangle_count(), 1);
        assert!(mesh.submesh(1).is_none());
    }

    #[test]
    fn transform_matrix_applies_scale_then_translation() {
        let transform = Transform::new()
            .position(Vec3::new(1.0, 2.0, 3.0))
            .uniform_scale(2.0);
        let p = transform.matrix().transform_point3(Vec3::ONE);
        assert_eq!(p, Vec3::new(3.0, 4.0, 5.0));
    }
}
