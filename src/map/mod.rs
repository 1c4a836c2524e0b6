//! The map demo: procedural terrain chunks with water, a skybox and height fog.
//!
//! Pass chain:
//!
//! 1. `OffscreenRenderPass` draws terrain and water into the scene framebuffer
//! 2. `SkyboxRenderPass` fills the uncovered pixels of the same framebuffer
//! 3. `PostFxRenderPass` applies height fog, reading scene colour and depth
//! 4. `PostFxRenderPass` copies the result to the screen

mod fog;
mod terrain;
mod water;

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use glam::{IVec2, Vec2, Vec3, Vec4};
use itugl::scene::{Scene, SceneCamera};
use itugl::{
    AppError, BlendEquation, BlendFactor, Camera, ColorSpace, Entity, Filter, Frame, Framebuffer,
    LightDescriptor, Material, Mesh, Model, OffscreenRenderPass, PostFxRenderPass, Renderer,
    SetupContext, SharedMaterial, SkyboxRenderPass, Texture, TextureFormat, Transform, Wrap,
    batched_light_update, programs,
};

use terrain::Heightfield;

/// World size of one terrain chunk.
const CHUNK_SIZE: f32 = 10.0;
/// Lights per batch in the terrain and water programs.
const MAX_LIGHTS: usize = 2;

#[derive(Clone, Debug)]
pub struct MapSettings {
    /// Chunks per side.
    pub chunks: u32,
    /// Grid cells per chunk side.
    pub grid: u32,
    pub seed: u32,
    /// Directory with `dirt.png`, `grass.jpg`, `rock.jpg`, `snow.jpg`, `water.png` and
    /// `sky.png`. Missing files fall back to generated textures.
    pub textures: Option<PathBuf>,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            chunks: 2,
            grid: 48,
            seed: 7,
            textures: None,
        }
    }
}

struct MapTextures {
    dirt: Rc<Texture>,
    grass: Rc<Texture>,
    rock: Rc<Texture>,
    snow: Rc<Texture>,
    water: Rc<Texture>,
    sky: Rc<Texture>,
}

impl MapTextures {
    fn load(directory: Option<&Path>, seed: u32) -> Self {
        let load = |file: &str, fallback: &[Vec3]| {
            let texture = directory
                .map(|dir| dir.join(file))
                .and_then(|path| match Texture::load(&path, ColorSpace::Srgb) {
                    Ok(texture) => Some(texture.with_wrap(Wrap::Repeat)),
                    Err(err) => {
                        log::warn!("{}: {err}, using a generated texture", path.display());
                        None
                    }
                })
                .unwrap_or_else(|| {
                    Texture::noise(file, 32, seed, fallback).with_filter(Filter::Nearest)
                });
            Rc::new(texture)
        };

        Self {
            dirt: load("dirt.png", &[Vec3::new(0.23, 0.15, 0.08), Vec3::new(0.3, 0.2, 0.1)]),
            grass: load("grass.jpg", &[Vec3::new(0.12, 0.3, 0.06), Vec3::new(0.16, 0.36, 0.08)]),
            rock: load("rock.jpg", &[Vec3::new(0.3, 0.29, 0.27), Vec3::new(0.22, 0.21, 0.2)]),
            snow: load("snow.jpg", &[Vec3::new(0.9, 0.92, 0.95), Vec3::new(0.82, 0.85, 0.9)]),
            water: load("water.png", &[Vec3::new(0.1, 0.3, 0.5), Vec3::new(0.12, 0.35, 0.55)]),
            sky: Rc::new(
                directory
                    .map(|dir| dir.join("sky.png"))
                    .and_then(|path| Texture::load(path, ColorSpace::Srgb).ok())
                    .unwrap_or_else(gradient_sky),
            ),
        }
    }
}

/// Equirectangular sky: deep blue overhead, pale at the horizon, dark below.
fn gradient_sky() -> Texture {
    let zenith = Vec3::new(0.08, 0.22, 0.55);
    let horizon = Vec3::new(0.65, 0.75, 0.85);
    let ground = Vec3::new(0.2, 0.2, 0.22);
    Texture::from_fn("gradient sky", 4, 64, |_, y| {
        let v = (y as f32 + 0.5) / 64.0;
        let rgb = if v < 0.5 {
            zenith.lerp(horizon, (v * 2.0).powf(3.0))
        } else {
            horizon.lerp(ground, ((v - 0.5) * 8.0).min(1.0))
        };
        rgb.extend(1.0)
    })
}

/// Scene and per-frame state of the map demo.
pub struct MapDemo {
    scene: Scene,
    camera: Entity,
    lantern: Entity,
    water: SharedMaterial,
    fog: SharedMaterial,
    extent: f32,
}

impl MapDemo {
    /// Builds the scene and registers programs and passes with the renderer.
    pub fn new(ctx: &mut SetupContext, settings: &MapSettings) -> Result<Self, AppError> {
        let textures = MapTextures::load(settings.textures.as_deref(), settings.seed);
        let renderer = &mut *ctx.renderer;

        let terrain_program = Rc::new(terrain::terrain_program(MAX_LIGHTS)?);
        let water_program = Rc::new(water::water_program(MAX_LIGHTS)?);
        for program in [&terrain_program, &water_program] {
            renderer.register_shader_program(
                program,
                programs::standard_transform_setup(program),
                Some(batched_light_update(program)),
            );
        }

        let mut base = Material::new(terrain_program);
        base.set_uniform_value("ColorTexture0", &textures.dirt);
        base.set_uniform_value("ColorTexture1", &textures.grass);
        base.set_uniform_value("ColorTexture2", &textures.rock);
        base.set_uniform_value("ColorTexture3", &textures.snow);
        base.set_uniform_value("ColorTextureRange01", Vec2::new(0.3, 0.5));
        base.set_uniform_value("ColorTextureRange12", Vec2::new(0.5, 0.7));
        base.set_uniform_value("ColorTextureRange23", Vec2::new(0.7, 0.8));
        base.set_uniform_value("ColorTextureScale", Vec2::splat(8.0));
        base.set_uniform_value("HeightScale", 1.0_f32);
        base.set_uniform_value("Color", Vec4::ONE);
        base.set_uniform_value("AmbientColor", Vec3::splat(0.25));
        base.set_uniform_value("Specular", Vec2::new(0.05, 16.0));

        let mut water = Material::new(water_program);
        water.set_uniform_value("ColorTexture", &textures.water);
        water.set_uniform_value("ColorTextureScale", Vec2::splat(4.0));
        water.set_uniform_value("Color", Vec4::new(1.0, 1.0, 1.0, 0.6));
        water.set_uniform_value("AmbientColor", Vec3::splat(0.25));
        water.set_uniform_value("Specular", Vec2::new(0.6, 64.0));
        water.set_blend_params(BlendFactor::SourceAlpha, BlendFactor::OneMinusSourceAlpha);
        water.set_blend_equation(BlendEquation::Add);
        let water = water.into_shared();

        let patch = Rc::new(Mesh::grid(settings.grid, settings.grid));
        let mut scene = Scene::new();
        let chunks = settings.chunks.max(1);
        let offset = chunks as f32 * 0.5;

        let water_model = scene.add_model(Model::new(Rc::clone(&patch), Rc::clone(&water)));
        let mut water_chunks = Vec::new();
        for z in 0..chunks {
            for x in 0..chunks {
                let field = Heightfield::generate(
                    settings.grid + 1,
                    IVec2::new(x as i32, z as i32),
                    settings.seed,
                );
                let mut material = base.clone();
                material.set_uniform_value(
                    "Heightmap",
                    Rc::new(field.height_texture(format!("heightmap {x},{z}"))),
                );
                material.set_uniform_value(
                    "NormalMap",
                    Rc::new(field.normal_texture(format!("normal map {x},{z}"), 1.0)),
                );
                let model = scene.add_model(Model::new(Rc::clone(&patch), material.into_shared()));

                let corner = Vec3::new(x as f32 - offset, 0.0, z as f32 - offset);
                scene.spawn_model(
                    &format!("terrain chunk {x},{z}"),
                    model,
                    Transform::from_position(CHUNK_SIZE * (corner + Vec3::new(0.0, -0.5, 0.0)))
                        .uniform_scale(CHUNK_SIZE),
                );
                water_chunks.push((
                    format!("water chunk {x},{z}"),
                    Transform::from_position(CHUNK_SIZE * (corner + Vec3::new(0.0, -0.15, 0.0)))
                        .uniform_scale(CHUNK_SIZE),
                ));
            }
        }
        // Water after all terrain, so it blends over what is below it.
        for (name, transform) in water_chunks {
            scene.spawn_model(&name, water_model, transform);
        }

        scene.spawn_light(
            "sun",
            LightDescriptor::directional(Vec3::new(-0.3, -1.0, -0.3)).with_intensity(1.0),
        );
        let lantern = scene.spawn_light(
            "lantern",
            LightDescriptor::point(Vec3::ZERO)
                .with_color(Vec3::new(1.0, 0.7, 0.4))
                .with_intensity(2.0)
                .with_attenuation(2.0, 12.0),
        );
        let camera = scene.spawn_camera("camera", Camera::new());

        let fog = Self::add_passes(renderer, &textures, ctx.width, ctx.height)?;
        log::info!(
            "map ready: {} chunks of {} cells, {} entities",
            chunks * chunks,
            settings.grid,
            scene.world().len()
        );

        let mut demo = Self {
            scene,
            camera,
            lantern,
            water,
            fog,
            extent: chunks as f32 * CHUNK_SIZE,
        };
        demo.animate(0.0, ctx.aspect());
        Ok(demo)
    }

    fn add_passes(
        renderer: &mut Renderer,
        textures: &MapTextures,
        width: u32,
        height: u32,
    ) -> Result<SharedMaterial, AppError> {
        let scene_pass = OffscreenRenderPass::new("scene", width, height)?
            .with_clear_color(Vec4::new(0.0, 0.0, 0.0, 1.0));
        let scene_framebuffer = Rc::clone(scene_pass.framebuffer());
        let scene_color = Rc::clone(scene_pass.color_texture());
        let scene_depth = Rc::clone(scene_pass.depth_texture());

        let fog_color = Rc::new(
            Texture::new("fog color", width, height, TextureFormat::Rgba32F)
                .with_filter(Filter::Nearest),
        );
        let fog_framebuffer = Rc::new(
            Framebuffer::builder("fog")
                .color(Rc::clone(&fog_color))
                .build()?,
        );

        let mut fog = Material::new(Rc::new(fog::fog_program()?));
        fog.set_uniform_value("SourceTexture", scene_color);
        fog.set_uniform_value("DepthTexture", scene_depth);
        fog.set_uniform_value("FogColor", Vec3::new(0.62, 0.7, 0.78));
        fog.set_uniform_value("FogDensity", 0.04_f32);
        fog.set_uniform_value("FogHeight", -3.0_f32);
        fog.set_uniform_value("FogFalloff", 0.35_f32);
        fog.set_uniform_value("HorizonHaze", 0.5_f32);
        let fog = fog.into_shared();

        let mut copy = Material::new(Rc::new(programs::copy()?));
        copy.set_uniform_value("SourceTexture", fog_color);

        renderer.add_render_pass(scene_pass);
        renderer.add_render_pass(
            SkyboxRenderPass::new(Rc::clone(&textures.sky))?.with_target(scene_framebuffer),
        );
        renderer.add_render_pass(
            PostFxRenderPass::new(Rc::clone(&fog)).with_target(fog_framebuffer),
        );
        renderer.add_render_pass(PostFxRenderPass::new(copy.into_shared()));
        Ok(fog)
    }

    /// Advances the animation and feeds the renderer for one frame.
    pub fn update(&mut self, frame: &mut Frame) {
        self.animate(frame.time, frame.aspect());
        self.scene.collect(frame.renderer);
        if frame.index % 300 == 0 {
            log::debug!("frame {} at {:.0} fps", frame.index, frame.fps());
        }
    }

    fn animate(&mut self, time: f32, aspect: f32) {
        let angle = time * 0.1;
        let radius = self.extent * 0.9 + 4.0;
        let camera = Camera::new()
            .at(angle.cos() * radius, self.extent * 0.45 + 2.0, angle.sin() * radius)
            .looking_at(0.0, -2.0, 0.0)
            .with_aspect(aspect)
            .with_clip_planes(0.1, self.extent * 4.0 + 50.0);

        let world = self.scene.world();
        if let Ok(mut scene_camera) = world.get::<&mut SceneCamera>(self.camera) {
            scene_camera.0 = camera;
        }

        let lantern_angle = time * TAU / 20.0;
        let lantern = Transform::from_position(Vec3::new(
            lantern_angle.cos() * self.extent * 0.3,
            2.0,
            lantern_angle.sin() * self.extent * 0.3,
        ));
        if let Err(err) = self.scene.world_mut().insert_one(self.lantern, lantern) {
            log::warn!("lantern light is gone: {err}");
        }

        self.water.borrow_mut().set_uniform_value("Time", time);
        let mut fog = self.fog.borrow_mut();
        fog.set_uniform_value("InvViewProjMatrix", camera.view_projection_matrix().inverse());
        fog.set_uniform_value("CameraPosition", camera.extract_translation());
    }
}
