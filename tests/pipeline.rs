use std::rc::Rc;

use itugl::{
    BlendEquation, BlendFactor, BlendState, Camera, DepthFunction, Device, DrawcallInfo, Feature,
    ForwardRenderPass, Framebuffer, LightDescriptor, Mat4, Material, Mesh, PostFxRenderPass,
    Renderer, ShaderProgram, Texture, TextureFormat, UniformKind, Vec3, Vec4, Vertex3d,
    VertexOutput, batched_light_update, programs,
};

fn flat_program(name: &str) -> Rc<ShaderProgram> {
    Rc::new(
        ShaderProgram::builder(name)
            .uniform("Color", UniformKind::Vec4)
            .vertex(|_, v| VertexOutput::new(Vec3::from(v.position).extend(1.0)))
            .fragment(|u, _| Some(u.get_or("Color", Vec4::ONE)))
            .build()
            .unwrap(),
    )
}

/// Screen-space rectangle spanning `x0..x1` in NDC, full height.
fn quad(x0: f32, x1: f32) -> Rc<Mesh> {
    let normal = [0.0, 0.0, 1.0];
    Rc::new(Mesh::new(
        vec![
            Vertex3d::new([x0, -1.0, 0.0], normal, [0.0, 0.0]),
            Vertex3d::new([x1, -1.0, 0.0], normal, [1.0, 0.0]),
            Vertex3d::new([x1, 1.0, 0.0], normal, [1.0, 1.0]),
            Vertex3d::new([x0, 1.0, 0.0], normal, [0.0, 1.0]),
        ],
        vec![0, 1, 2, 0, 2, 3],
    ))
}

fn forward_renderer(width: u32, height: u32) -> Renderer {
    let mut renderer = Renderer::new(Device::software(width, height));
    renderer.add_render_pass(ForwardRenderPass::new());
    renderer
}

fn assert_rgb_near(actual: Vec4, expected: Vec3) {
    assert!(
        (actual.truncate() - expected).length() < 1e-5,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn each_drawcall_uses_only_its_own_material_state() {
    let program = flat_program("flat");
    let mut blended = Material::new(Rc::clone(&program));
    blended.set_uniform_value("Color", Vec4::new(1.0, 0.0, 0.0, 0.5));
    blended.set_blend_params(BlendFactor::SourceAlpha, BlendFactor::OneMinusSourceAlpha);
    blended.set_blend_equation(BlendEquation::Add);
    let mut opaque = Material::new(Rc::clone(&program));
    opaque.set_uniform_value("Color", Vec4::new(0.0, 1.0, 0.0, 1.0));

    let mut renderer = forward_renderer(4, 4);
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(quad(-1.0, 0.0), 0, blended.into_shared(), Mat4::IDENTITY),
    );
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(quad(0.0, 1.0), 0, opaque.into_shared(), Mat4::IDENTITY),
    );
    renderer.device_mut().clear(Some(Vec4::ZERO), Some(1.0));
    renderer.render();

    let device = renderer.device();
    assert_rgb_near(device.read_pixel(0, 1), Vec3::new(0.5, 0.0, 0.0));
    // Neither the blend state nor the red colour of the first drawcall leaks into the second.
    assert_rgb_near(device.read_pixel(3, 1), Vec3::new(0.0, 1.0, 0.0));
    let history = device.draw_history();
    assert_eq!(history.len(), 2);
    assert!(history[0].blend_enabled);
    assert!(!history[1].blend_enabled);
}

#[test]
fn cloned_materials_keep_separate_uniforms() {
    let mut base = Material::new(flat_program("flat"));
    base.set_uniform_value("Color", Vec4::new(0.2, 0.2, 0.2, 1.0));
    let mut variant = base.clone();
    variant.set_uniform_value("Color", Vec4::new(0.8, 0.6, 0.4, 1.0));

    assert_eq!(
        base.get_uniform::<Vec4>("Color"),
        Ok(Vec4::new(0.2, 0.2, 0.2, 1.0))
    );
    assert!(Rc::ptr_eq(base.shader_program(), variant.shader_program()));

    let mut renderer = forward_renderer(4, 4);
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(quad(-1.0, 0.0), 0, base.into_shared(), Mat4::IDENTITY),
    );
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(quad(0.0, 1.0), 0, variant.into_shared(), Mat4::IDENTITY),
    );
    renderer.render();

    assert_rgb_near(renderer.device().read_pixel(1, 2), Vec3::splat(0.2));
    assert_rgb_near(renderer.device().read_pixel(2, 2), Vec3::new(0.8, 0.6, 0.4));
}

fn lit_scene(max_lights: usize, lights: &[LightDescriptor]) -> Renderer {
    let program = Rc::new(programs::lit(max_lights).unwrap());
    let mut renderer = forward_renderer(8, 8);
    renderer.register_shader_program(
        &program,
        programs::standard_transform_setup(&program),
        Some(batched_light_update(&program)),
    );

    let mut material = Material::new(program);
    material.set_uniform_value("Color", Vec4::new(0.2, 0.2, 0.2, 1.0));
    material.set_uniform_value("AmbientColor", Vec3::splat(0.1));
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(Rc::new(Mesh::plane(20.0)), 0, material.into_shared(), Mat4::IDENTITY),
    );
    renderer.set_current_camera(Camera::new().at(0.0, 3.0, 2.0).looking_at(0.0, 0.0, 0.0));
    for light in lights {
        renderer.add_light(*light);
    }
    renderer.device_mut().clear(Some(Vec4::ZERO), Some(1.0));
    renderer
}

#[test]
fn light_batches_add_up_to_a_single_pass() {
    let lights: Vec<LightDescriptor> = (0..5)
        .map(|i| {
            LightDescriptor::point(Vec3::new(i as f32 - 2.0, 1.5, 0.0))
                .with_color(Vec3::new(1.0, 0.8, 0.6))
                .with_intensity(0.15)
        })
        .collect();

    let mut batched = lit_scene(2, &lights);
    batched.render();
    let mut single = lit_scene(5, &lights);
    single.render();

    let history = batched.device().draw_history();
    assert_eq!(history.len(), 3);
    assert!(!history[0].blend_enabled);
    assert!(history[0].depth_write);
    assert_eq!(history[0].depth_function, DepthFunction::Less);
    for record in &history[1..] {
        assert!(record.blend_enabled);
        assert_eq!(record.blend, BlendState::additive());
        assert!(!record.depth_write);
        assert_eq!(record.depth_function, DepthFunction::LessEqual);
    }
    assert_eq!(single.device().draw_history().len(), 1);

    let summed = batched.device().read_pixel(4, 4);
    let reference = single.device().read_pixel(4, 4);
    assert!(reference.x > 0.02, "the plane should be lit");
    assert!((summed.truncate() - reference.truncate()).length() < 1e-4);
}

#[test]
fn camera_uniforms_upload_only_after_camera_changes() {
    let program = Rc::new(programs::lit(1).unwrap());
    let mut renderer = forward_renderer(4, 4);
    renderer.register_shader_program(
        &program,
        programs::standard_transform_setup(&program),
        Some(batched_light_update(&program)),
    );
    let material = Material::new(Rc::clone(&program)).into_shared();
    let mesh = Rc::new(Mesh::cube());
    let view_proj = program.uniform_location("ViewProjMatrix").unwrap();
    let world = program.uniform_location("WorldMatrix").unwrap();

    let frame = |renderer: &mut Renderer, camera: Option<Camera>| {
        if let Some(camera) = camera {
            renderer.set_current_camera(camera);
        }
        for x in 0..3 {
            renderer.add_drawcall(
                0,
                DrawcallInfo::new(
                    Rc::clone(&mesh),
                    0,
                    Rc::clone(&material),
                    Mat4::from_translation(Vec3::X * x as f32),
                ),
            );
        }
        renderer.render();
    };

    let camera = Camera::new().at(0.0, 2.0, 6.0);
    frame(&mut renderer, Some(camera));
    assert_eq!(program.upload_count(view_proj), 1);
    frame(&mut renderer, None);
    assert_eq!(program.upload_count(view_proj), 1);
    frame(&mut renderer, Some(camera.at(1.0, 2.0, 6.0)));
    assert_eq!(program.upload_count(view_proj), 2);
    assert_eq!(program.upload_count(world), 9);
}

#[test]
fn postfx_leaves_depth_test_and_srgb_as_it_found_them() {
    for depth_test in [false, true] {
        for srgb in [false, true] {
            let mut copy = Material::new(Rc::new(programs::copy().unwrap()));
            copy.set_uniform_value("SourceTexture", Rc::new(Texture::solid("src", Vec4::ONE)));
            let mut renderer = Renderer::new(Device::software(2, 2));
            renderer.add_render_pass(PostFxRenderPass::new(copy.into_shared()));

            let device = renderer.device_mut();
            device.set_feature_enabled(Feature::DepthTest, depth_test);
            device.set_feature_enabled(Feature::FramebufferSrgb, srgb);
            renderer.render();

            let device = renderer.device();
            assert_eq!(device.is_feature_enabled(Feature::DepthTest), depth_test);
            assert_eq!(device.is_feature_enabled(Feature::FramebufferSrgb), srgb);
            let record = &device.draw_history()[0];
            assert!(!record.depth_test);
            assert_eq!(record.fragments_written, 4);
        }
    }
}

#[test]
fn offscreen_then_copy_reproduces_the_scene_exactly() {
    let program = Rc::new(programs::lit(1).unwrap());
    let mut renderer = Renderer::new(Device::software(8, 6));
    renderer.register_shader_program(
        &program,
        programs::standard_transform_setup(&program),
        Some(batched_light_update(&program)),
    );

    let scene_color = Rc::new(Texture::new("scene color", 8, 6, TextureFormat::Rgba32F));
    let scene_depth = Rc::new(Texture::new("scene depth", 8, 6, TextureFormat::Depth32F));
    scene_depth.fill(Vec4::ONE);
    let scene = Framebuffer::builder("scene")
        .color(Rc::clone(&scene_color))
        .depth(scene_depth)
        .build()
        .unwrap();
    renderer.add_render_pass(
        ForwardRenderPass::new()
            .with_collection(0)
            .with_target(Rc::new(scene)),
    );

    let mut copy = Material::new(Rc::new(programs::copy().unwrap()));
    copy.set_uniform_value("SourceTexture", Rc::clone(&scene_color));
    renderer.add_render_pass(PostFxRenderPass::new(copy.into_shared()));

    let mut material = Material::new(program);
    material.set_uniform_value("Color", Vec4::new(0.6, 0.5, 0.4, 1.0));
    material.set_uniform_value("AmbientColor", Vec3::splat(0.1));
    renderer.add_drawcall(
        0,
        DrawcallInfo::new(Rc::new(Mesh::plane(20.0)), 0, material.into_shared(), Mat4::IDENTITY),
    );
    renderer.set_current_camera(
        Camera::new()
            .at(0.0, 3.0, 2.0)
            .looking_at(0.0, 0.0, 0.0)
            .with_aspect(8.0 / 6.0),
    );
    renderer.add_light(LightDescriptor::directional(Vec3::NEG_Y));
    renderer.render();

    let history = renderer.device().draw_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].target.as_deref(), Some("scene"));
    assert_eq!(history[1].target, None);

    let screen = renderer.device().screen_color().to_rgba32f();
    let offscreen = scene_color.to_rgba32f();
    assert_eq!(screen, offscreen);
    // Straight-down light on an upward plane: ambient plus full diffuse, no specular.
    let lit = Vec4::from_array(offscreen.get_pixel(4, 3).0);
    assert_rgb_near(lit, Vec3::new(0.6, 0.5, 0.4) * 1.1);
    assert_eq!(lit.w, 1.0);
}

#[test]
fn transparent_layers_composite_back_to_front() {
    let program = flat_program("flat");
    let layer = |color: Vec4| {
        let mut material = Material::new(Rc::clone(&program));
        material.set_uniform_value("Color", color);
        material.set_blend_params(BlendFactor::SourceAlpha, BlendFactor::OneMinusSourceAlpha);
        material.set_depth_write(false);
        material.into_shared()
    };
    let first = Vec4::new(0.8, 0.2, 0.0, 0.5);
    let second = Vec4::new(0.0, 0.4, 0.9, 0.25);
    let background = Vec3::new(0.1, 0.1, 0.1);

    let mut renderer = forward_renderer(2, 2);
    let fullscreen = Rc::new(Mesh::fullscreen_triangle());
    for color in [first, second] {
        renderer.add_drawcall(
            0,
            DrawcallInfo::new(Rc::clone(&fullscreen), 0, layer(color), Mat4::IDENTITY),
        );
    }
    renderer
        .device_mut()
        .clear(Some(background.extend(1.0)), Some(1.0));
    renderer.render();

    let over = |src: Vec4, dst: Vec3| src.truncate() * src.w + dst * (1.0 - src.w);
    let expected = over(second, over(first, background));
    assert_rgb_near(renderer.device().read_pixel(1, 0), expected);
}
