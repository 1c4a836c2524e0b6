//! Scene storage and traversal.
//!
//! Entities live in a `hecs` world. Components must be `Send + Sync`, so models (which hold
//! `Rc` meshes and materials) stay in a library owned by the [`Scene`] and entities refer to
//! them by [`ModelId`].
//!
//! Each frame, [`Scene::collect`] hands the current camera, drawcalls and lights to the
//! renderer, in spawn order.
//!
//! # Example
//!
//! ```ignore
//! let mut scene = Scene::new();
//! let cube = scene.add_model(Model::new(Rc::new(Mesh::cube()), material));
//! scene.spawn_model("cube", cube, Transform::from_position(Vec3::Y));
//! scene.spawn_light("sun", LightDescriptor::directional(Vec3::new(-0.3, -1.0, -0.3)));
//! scene.spawn_camera("main", Camera::new().at(0.0, 2.0, 5.0).looking_at(0.0, 0.0, 0.0));
//!
//! // every frame
//! scene.collect(&mut renderer);
//! renderer.render();
//! ```

use glam::Mat4;
use hecs::{Entity, World};

use crate::camera::Camera;
use crate::light::{LightDescriptor, LightKind};
use crate::mesh::{Model, Transform};
use crate::renderer::Renderer;

/// Handle to a model in a [`Scene`]'s model library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModelId(usize);

/// Entity name, used by [`Scene::find`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name(pub String);

/// Draws a library model. Combine with a [`Transform`] to place it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderModel {
    pub model: ModelId,
    /// Drawcall collection the model's drawcalls go to.
    pub collection: usize,
}

/// A light. A [`Transform`] on the same entity moves point lights and rotates directions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneLight(pub LightDescriptor);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneCamera(pub Camera);

#[derive(Default)]
pub struct Scene {
    world: World,
    models: Vec<Model>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Adds a model to the library.
    pub fn add_model(&mut self, model: Model) -> ModelId {
        self.models.push(model);
        ModelId(self.models.len() - 1)
    }

    pub fn model(&self, id: ModelId) -> Option<&Model> {
        self.models.get(id.0)
    }

    /// Spawns a model drawn into collection 0.
    pub fn spawn_model(&mut self, name: &str, model: ModelId, transform: Transform) -> Entity {
        self.spawn_model_in(name, model, transform, 0)
    }

    pub fn spawn_model_in(
        &mut self,
        name: &str,
        model: ModelId,
        transform: Transform,
        collection: usize,
    ) -> Entity {
        self.world.spawn((
            Name(name.to_string()),
            transform,
            RenderModel { model, collection },
        ))
    }

    pub fn spawn_light(&mut self, name: &str, light: LightDescriptor) -> Entity {
        self.world.spawn((Name(name.to_string()), SceneLight(light)))
    }

    pub fn spawn_camera(&mut self, name: &str, camera: Camera) -> Entity {
        self.world.spawn((Name(name.to_string()), SceneCamera(camera)))
    }

    /// First entity named `name`, in spawn order.
    pub fn find(&self, name: &str) -> Option<Entity> {
        let mut query = self.world.query::<&Name>();
        query
            .iter()
            .filter(|(_, n)| n.0 == name)
            .map(|(entity, _)| entity)
            .min_by_key(|entity| entity.id())
    }

    /// Feeds the renderer for one frame: current camera, drawcalls and lights.
    ///
    /// Entities are visited in spawn order. Despawned slots are reused by hecs, so an entity
    /// spawned after a despawn may be visited before older ones.
    pub fn collect(&self, renderer: &mut Renderer) {
        let mut cameras: Vec<(Entity, Camera)> = self
            .world
            .query::<&SceneCamera>()
            .iter()
            .map(|(entity, camera)| (entity, camera.0))
            .collect();
        cameras.sort_by_key(|(entity, _)| entity.id());
        if let Some((_, camera)) = cameras.first() {
            renderer.set_current_camera(*camera);
        }

        let mut models: Vec<(Entity, RenderModel, Mat4)> = self
            .world
            .query::<(&RenderModel, Option<&Transform>)>()
            .iter()
            .map(|(entity, (model, transform))| {
                (entity, *model, transform.map_or(Mat4::IDENTITY, Transform::matrix))
            })
            .collect();
        models.sort_by_key(|(entity, _, _)| entity.id());
        for (entity, render_model, world_matrix) in models {
            match self.model(render_model.model) {
                Some(model) => renderer.add_model(model, world_matrix, render_model.collection),
                None => log::warn!("entity {entity:?} refers to unknown model {:?}", render_model.model),
            }
        }

        let mut lights: Vec<(Entity, LightDescriptor)> = self
            .world
            .query::<(&SceneLight, Option<&Transform>)>()
            .iter()
            .map(|(entity, (light, transform))| {
                (entity, transform.map_or(light.0, |t| place_light(light.0, t)))
            })
            .collect();
        lights.sort_by_key(|(entity, _)| entity.id());
        for (_, light) in lights {
            renderer.add_light(light);
        }
    }
}

fn place_light(mut light: LightDescriptor, transform: &Transform) -> LightDescriptor {
    match &mut light.kind {
        LightKind::Directional { direction } => {
            *direction = (transform.rotation * *direction).normalize_or(*direction);
        }
        LightKind::Point { position, .. } => {
            *position = transform.matrix().transform_point3(*position);
        }
    }
    light
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::material::Material;
    use crate::mesh::Mesh;
    use crate::shader::{ShaderProgram, VertexOutput};
    use glam::{Vec3, Vec4};
    use std::rc::Rc;

    fn model() -> Model {
        let program = ShaderProgram::builder("scene test")
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|_, _| Some(Vec4::ONE))
            .build()
            .unwrap();
        Model::new(
            Rc::new(Mesh::cube()),
            Material::new(Rc::new(program)).into_shared(),
        )
    }

    #[test]
    fn collect_feeds_camera_drawcalls_and_lights() {
        let mut scene = Scene::new();
        let cube = scene.add_model(model());
        scene.spawn_model("a", cube, Transform::from_position(Vec3::X));
        scene.spawn_model_in("b", cube, Transform::new(), 1);
        scene.spawn_model("c", cube, Transform::from_position(Vec3::Z));
        scene.spawn_light("lamp", LightDescriptor::point(Vec3::ZERO));
        scene.spawn_light("sun", LightDescriptor::directional(Vec3::NEG_Y));
        let camera = Camera::new().at(1.0, 2.0, 3.0);
        scene.spawn_camera("main", camera);

        let mut renderer = Renderer::new(Device::software(2, 2));
        scene.collect(&mut renderer);

        assert_eq!(*renderer.current_camera(), camera);
        let first = renderer.drawcalls(0);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].world_matrix, Mat4::from_translation(Vec3::X));
        assert_eq!(first[1].world_matrix, Mat4::from_translation(Vec3::Z));
        assert_eq!(renderer.drawcalls(1).len(), 1);
        assert_eq!(renderer.lights().len(), 2);
        assert!(renderer.lights().get(0).unwrap().is_directional());
    }

    #[test]
    fn transforms_place_lights() {
        let mut scene = Scene::new();
        let lamp = scene.spawn_light("lamp", LightDescriptor::point(Vec3::ZERO));
        scene
            .world_mut()
            .insert_one(lamp, Transform::from_position(Vec3::new(0.0, 4.0, 0.0)))
            .unwrap();

        let mut renderer = Renderer::new(Device::software(2, 2));
        scene.collect(&mut renderer);
        let light = renderer.lights().get(0).unwrap();
        assert_eq!(light.position_uniform(), Vec4::new(0.0, 4.0, 0.0, 1.0));
    }

    #[test]
    fn find_returns_the_first_match() {
        let mut scene = Scene::new();
        let first = scene.spawn_camera("main", Camera::new());
        scene.spawn_camera("main", Camera::new());
        assert_eq!(scene.find("main"), Some(first));
        assert_eq!(scene.find("missing"), None);
    }
}
