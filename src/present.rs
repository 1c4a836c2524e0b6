//! Puts the device backbuffer on screen.
//!
//! When the backbuffer was rendered by a GPU device on the presenter's own wgpu device, its
//! mirror is bound directly. Otherwise the host texels are uploaded as 32-bit floats. Either
//! way a fullscreen triangle loads one texel per pixel, so a render scale below 1 gives a crisp
//! pixelated upscale.
//!
//! Backbuffer values are already display-encoded. On an sRGB surface the blit decodes them
//! first, so the surface's own encode puts the same values on screen.

use crate::gpu::GpuContext;
use crate::texture::Texture;

const BLIT_SHADER: &str = r#"
@vertex
fn vs(@builtin(vertex_index) index: u32) -> @builtin(position) vec4f {
    let uv = vec2f(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4f(uv * vec2f(2.0, -2.0) + vec2f(-1.0, 1.0), 0.0, 1.0);
}

@group(0) @binding(0) var frame_texture: texture_2d<f32>;

fn load_frame(position: vec4f) -> vec4f {
    let size = vec2f(textureDimensions(frame_texture));
    let surface = vec2f(f32(blit.surface_width), f32(blit.surface_height));
    let texel = vec2i(floor(position.xy * size / surface));
    return saturate(textureLoad(frame_texture, texel, 0));
}

struct Blit {
    surface_width: u32,
    surface_height: u32,
};

@group(0) @binding(1) var<uniform> blit: Blit;

@fragment
fn fs(@builtin(position) position: vec4f) -> @location(0) vec4f {
    return load_frame(position);
}

@fragment
fn fs_decode(@builtin(position) position: vec4f) -> @location(0) vec4f {
    let color = load_frame(position);
    let low = color.rgb / 12.92;
    let high = pow((color.rgb + 0.055) / 1.055, vec3f(2.4));
    return vec4f(select(high, low, color.rgb <= vec3f(0.04045)), color.a);
}
"#;

const UPLOAD_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

/// Blits the backbuffer to the window surface.
pub struct Presenter {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniforms: wgpu::Buffer,
    texture: wgpu::Texture,
    size: (u32, u32),
}

impl Presenter {
    /// Creates the blit pipeline and an upload texture of `width` x `height`.
    pub fn new(gpu: &GpuContext, width: u32, height: u32) -> Self {
        let device = &gpu.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Present Shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Present Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Present Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let entry_point = if gpu.is_srgb() { "fs_decode" } else { "fs" };
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Present Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some(entry_point),
                targets: &[Some(wgpu::ColorTargetState {
                    format: gpu.config.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Present Uniforms"),
            size: std::mem::size_of::<[u32; 4]>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let (width, height) = (width.max(1), height.max(1));
        let texture = create_frame_texture(gpu, width, height);

        Self {
            pipeline,
            bind_group_layout,
            uniforms,
            texture,
            size: (width, height),
        }
    }

    /// Recreates the upload texture when the render size changed.
    pub fn resize(&mut self, gpu: &GpuContext, width: u32, height: u32) {
        let size = (width.max(1), height.max(1));
        if size == self.size {
            return;
        }
        self.texture = create_frame_texture(gpu, size.0, size.1);
        self.size = size;
        log::debug!("presenter texture resized to {}x{}", size.0, size.1);
    }

    /// Draws `frame` over the whole surface.
    pub fn present(&mut self, gpu: &GpuContext, frame: &Texture) -> Result<(), wgpu::SurfaceError> {
        let view = match resident_view(gpu, frame) {
            Some(view) => view,
            None => self.upload(gpu, frame),
        };
        let surface_size = [gpu.width(), gpu.height(), 0, 0];
        gpu.queue
            .write_buffer(&self.uniforms, 0, bytemuck::cast_slice(&surface_size));
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Present Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.uniforms.as_entire_binding(),
                },
            ],
        });

        let output = gpu.surface.get_current_texture()?;
        let target = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Present Encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Present Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&self.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }

        gpu.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }

    fn upload(&mut self, gpu: &GpuContext, frame: &Texture) -> wgpu::TextureView {
        let (width, height) = frame.size();
        self.resize(gpu, width, height);

        let texels = frame.texels();
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels.as_raw()),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(16 * width),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.texture.create_view(&wgpu::TextureViewDescriptor::default())
    }
}

/// The frame's own GPU texture, when it is current and lives on the presenting device.
fn resident_view(gpu: &GpuContext, frame: &Texture) -> Option<wgpu::TextureView> {
    if frame.is_gpu_stale() {
        return None;
    }
    let mirror = frame.gpu_mirror().try_borrow().ok()?;
    let mirror = mirror.as_ref()?;
    if mirror.device() != &gpu.device || !mirror.is_color() {
        return None;
    }
    Some(mirror.view())
}

fn create_frame_texture(gpu: &GpuContext, width: u32, height: u32) -> wgpu::Texture {
    gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Present Frame"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: UPLOAD_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}
