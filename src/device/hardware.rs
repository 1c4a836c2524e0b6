//! wgpu backend of the device.
//!
//! Every draw and clear is recorded into its own command encoder and submitted right away, so
//! passes observe each other's results in submission order, the same way they would on the
//! software rasterizer.
//!
//! Attachments and sampled textures live in GPU mirrors of the host textures:
//!
//! | host texture              | mirror format                                      |
//! |---------------------------|----------------------------------------------------|
//! | colour                    | `Rgba16Float` (filterable and blendable everywhere) |
//! | depth                     | `Depth32Float`                                     |
//! | backbuffer colour         | `Rgba8Unorm`, rendered through an sRGB view when `FramebufferSrgb` is on |
//!
//! Colour and depth mirrors are converted through an `Rgba32Float` staging texture on upload
//! and readback, since neither format can be copied to or from 32-bit float host data directly.

use std::collections::HashMap;
use std::iter;
use std::rc::Rc;
use std::sync::mpsc;

use glam::Vec4;
use image::{Rgba, Rgba32FImage};
use wgpu::util::DeviceExt;

use super::raster::RasterState;
use super::state::{BlendEquation, BlendFactor, BlendState, DepthFunction};
use crate::gpu::GpuDevice;
use crate::mesh::Mesh;
use crate::shader::wgsl::UniformLayout;
use crate::shader::{ProgramId, ShaderProgram, UniformValue};
use crate::texture::Texture;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const DISPLAY_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DISPLAY_SRGB_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const STAGING_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

const CONVERT_SHADER: &str = r#"
@group(0) @binding(0) var source: texture_2d<f32>;

@vertex
fn vs(@builtin(vertex_index) index: u32) -> @builtin(position) vec4f {
    let uv = vec2f(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4f(uv * 2.0 - 1.0, 0.0, 1.0);
}

@fragment
fn fs_color(@builtin(position) position: vec4f) -> @location(0) vec4f {
    return textureLoad(source, vec2i(position.xy), 0);
}

@fragment
fn fs_depth(@builtin(position) position: vec4f) -> @builtin(frag_depth) f32 {
    return textureLoad(source, vec2i(position.xy), 0).r;
}
"#;

/// Failure while moving texels between host and GPU.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("failed to map readback buffer: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("failed to wait for the GPU: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("readback was dropped before the buffer was mapped")]
    MapAborted,
}

/// Role of a mirror, which decides its GPU format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum MirrorKind {
    Color,
    Depth,
    Display,
}

impl MirrorKind {
    fn for_texture(texture: &Texture) -> Self {
        if texture.format().is_depth() {
            MirrorKind::Depth
        } else {
            MirrorKind::Color
        }
    }

    fn format(self) -> wgpu::TextureFormat {
        match self {
            MirrorKind::Color => COLOR_FORMAT,
            MirrorKind::Depth => DEPTH_FORMAT,
            MirrorKind::Display => DISPLAY_FORMAT,
        }
    }
}

/// GPU copy of a [`Texture`].
#[derive(Debug)]
pub(crate) struct GpuMirror {
    gpu: GpuDevice,
    converter: Rc<Converter>,
    texture: wgpu::Texture,
    kind: MirrorKind,
}

impl GpuMirror {
    pub(crate) fn device(&self) -> &wgpu::Device {
        &self.gpu.device
    }

    pub(crate) fn view(&self) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn size(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }

    /// Whether the mirror can be bound as a float texture.
    pub(crate) fn is_color(&self) -> bool {
        self.kind != MirrorKind::Depth
    }

    /// Downloads the mirror into host texels.
    pub(crate) fn read_back(&self) -> Result<Rgba32FImage, HardwareError> {
        let (width, height) = self.size();
        let device = &self.gpu.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("itugl readback"),
        });

        match self.kind {
            MirrorKind::Display => {
                let bytes = read_texture(&self.gpu, encoder, &self.texture, wgpu::TextureAspect::All, 4)?;
                let texels = bytes.chunks_exact(4).map(|texel| {
                    let rgba: [u8; 4] = bytemuck::pod_read_unaligned(texel);
                    Rgba(rgba.map(|c| c as f32 / 255.0))
                });
                Ok(image_from_texels(width, height, texels))
            }
            MirrorKind::Depth => {
                let bytes =
                    read_texture(&self.gpu, encoder, &self.texture, wgpu::TextureAspect::DepthOnly, 4)?;
                let texels = bytes.chunks_exact(4).map(|texel| {
                    let depth: f32 = bytemuck::pod_read_unaligned(texel);
                    Rgba([depth, depth, depth, 1.0])
                });
                Ok(image_from_texels(width, height, texels))
            }
            MirrorKind::Color => {
                let staging = create_texture(device, "itugl staging", STAGING_FORMAT, width, height, &[]);
                let source = self.view();
                let target = staging.create_view(&wgpu::TextureViewDescriptor::default());
                self.converter
                    .convert(device, &mut encoder, &source, &target, Conversion::ToStaging);
                let bytes = read_texture(&self.gpu, encoder, &staging, wgpu::TextureAspect::All, 16)?;
                let texels = bytes
                    .chunks_exact(16)
                    .map(|texel| Rgba(bytemuck::pod_read_unaligned::<[f32; 4]>(texel)));
                Ok(image_from_texels(width, height, texels))
            }
        }
    }
}

fn image_from_texels(width: u32, height: u32, texels: impl Iterator<Item = Rgba<f32>>) -> Rgba32FImage {
    let mut image = Rgba32FImage::new(width, height);
    for (pixel, texel) in image.pixels_mut().zip(texels) {
        *pixel = texel;
    }
    image
}

/// Copies a whole texture into a mappable buffer and returns its rows without padding.
fn read_texture(
    gpu: &GpuDevice,
    mut encoder: wgpu::CommandEncoder,
    texture: &wgpu::Texture,
    aspect: wgpu::TextureAspect,
    bytes_per_texel: u32,
) -> Result<Vec<u8>, HardwareError> {
    let (width, height) = (texture.width(), texture.height());
    let unpadded = bytes_per_texel * width;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = unpadded.div_ceil(align) * align;

    let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("itugl readback"),
        size: u64::from(padded * height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(iter::once(encoder.finish()));

    let slice = buffer.slice(..);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    gpu.device.poll(wgpu::PollType::wait_indefinitely())?;
    receiver.recv().map_err(|_| HardwareError::MapAborted)??;

    let data = slice.get_mapped_range();
    let mut bytes = Vec::with_capacity((unpadded * height) as usize);
    for row in 0..height {
        let start = (row * padded) as usize;
        bytes.extend_from_slice(&data[start..start + unpadded as usize]);
    }
    drop(data);
    buffer.unmap();
    Ok(bytes)
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
    view_formats: &[wgpu::TextureFormat],
) -> wgpu::Texture {
    let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
        | wgpu::TextureUsages::RENDER_ATTACHMENT
        | wgpu::TextureUsages::COPY_SRC;
    if format != DEPTH_FORMAT {
        usage |= wgpu::TextureUsages::COPY_DST;
    }
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Conversion {
    /// Staging texels into a colour mirror.
    ToColor,
    /// Staging texels into a depth mirror.
    ToDepth,
    /// Colour mirror into staging texels.
    ToStaging,
}

/// Fullscreen blits between staging textures and mirrors.
#[derive(Debug)]
pub(crate) struct Converter {
    layout: wgpu::BindGroupLayout,
    to_color: wgpu::RenderPipeline,
    to_depth: wgpu::RenderPipeline,
    to_staging: wgpu::RenderPipeline,
}

impl Converter {
    fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Convert Shader"),
            source: wgpu::ShaderSource::Wgsl(CONVERT_SHADER.into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Convert Bind Group Layout"),
            entries: &[texture_entry(0, false)],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Convert Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = |label: &str, color: Option<wgpu::TextureFormat>| {
            let targets: Vec<_> = color
                .map(|format| wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
                .into_iter()
                .map(Some)
                .collect();
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(if color.is_some() { "fs_color" } else { "fs_depth" }),
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: color.is_none().then(|| wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: Default::default(),
                    bias: Default::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        Self {
            to_color: pipeline("Convert To Color", Some(COLOR_FORMAT)),
            to_depth: pipeline("Convert To Depth", None),
            to_staging: pipeline("Convert To Staging", Some(STAGING_FORMAT)),
            layout,
        }
    }

    fn convert(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::TextureView,
        target: &wgpu::TextureView,
        conversion: Conversion,
    ) {
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Convert Bind Group"),
            layout: &self.layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(source),
            }],
        });
        let (pipeline, depth) = match conversion {
            Conversion::ToColor => (&self.to_color, false),
            Conversion::ToDepth => (&self.to_depth, true),
            Conversion::ToStaging => (&self.to_staging, false),
        };
        let color_attachments: Vec<_> = (!depth)
            .then(|| wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })
            .into_iter()
            .map(Some)
            .collect();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Convert Pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment: depth.then(|| wgpu::RenderPassDepthStencilAttachment {
                view: target,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}

fn texture_entry(binding: u32, depth: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: if depth {
                wgpu::TextureSampleType::Depth
            } else {
                wgpu::TextureSampleType::Float { filterable: false }
            },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

/// Vertex and index buffers of one mesh, uploaded on its first GPU draw.
#[derive(Debug)]
pub(crate) struct MeshBuffers {
    device: wgpu::Device,
    submeshes: Vec<Option<SubmeshBuffers>>,
}

#[derive(Debug)]
struct SubmeshBuffers {
    vertices: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
}

impl MeshBuffers {
    fn upload(device: &wgpu::Device, mesh: &Mesh) -> Self {
        let submeshes = mesh
            .submeshes()
            .iter()
            .map(|submesh| {
                if submesh.vertices.is_empty() || submesh.indices.len() < 3 {
                    return None;
                }
                let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("itugl vertices"),
                    contents: bytemuck::cast_slice(&submesh.vertices),
                    usage: wgpu::BufferUsages::VERTEX,
                });
                let indices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("itugl indices"),
                    contents: bytemuck::cast_slice(&submesh.indices),
                    usage: wgpu::BufferUsages::INDEX,
                });
                Some(SubmeshBuffers {
                    vertices,
                    indices,
                    index_count: (submesh.indices.len() / 3 * 3) as u32,
                })
            })
            .collect();
        Self {
            device: device.clone(),
            submeshes,
        }
    }
}

/// Compiled form of a [`ShaderProgram`].
struct GpuProgram {
    module: wgpu::ShaderModule,
    layout: UniformLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uniforms: wgpu::Buffer,
}

/// Everything a render pipeline is specialized on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramId,
    color: Option<wgpu::TextureFormat>,
    depth: bool,
    blend: Option<BlendState>,
    depth_test: bool,
    depth_write: bool,
    depth_function: DepthFunction,
    cull_back_faces: bool,
}

/// Attachments of the bound target.
pub(crate) struct RenderTarget<'a> {
    pub color: Option<&'a Texture>,
    pub depth: Option<&'a Texture>,
    /// The colour attachment is the backbuffer.
    pub display: bool,
    pub srgb: bool,
}

impl RenderTarget<'_> {
    fn contains(&self, texture: &Texture) -> bool {
        self.color.is_some_and(|color| std::ptr::eq(color, texture))
            || self.depth.is_some_and(|depth| std::ptr::eq(depth, texture))
    }

    fn color_format(&self) -> Option<wgpu::TextureFormat> {
        self.color.map(|_| match (self.display, self.srgb) {
            (true, true) => DISPLAY_SRGB_FORMAT,
            (true, false) => DISPLAY_FORMAT,
            (false, _) => COLOR_FORMAT,
        })
    }
}

/// The GPU half of a [`Device`](super::Device).
pub(crate) struct Hardware {
    gpu: GpuDevice,
    converter: Rc<Converter>,
    programs: HashMap<ProgramId, Option<Rc<GpuProgram>>>,
    pipelines: HashMap<PipelineKey, Option<wgpu::RenderPipeline>>,
    dummy_color: wgpu::TextureView,
    dummy_depth: wgpu::TextureView,
}

impl Hardware {
    pub(crate) fn new(gpu: &GpuDevice) -> Self {
        let device = &gpu.device;
        let converter = Rc::new(Converter::new(device));
        let dummy_color = create_texture(device, "itugl unbound texture", COLOR_FORMAT, 1, 1, &[])
            .create_view(&wgpu::TextureViewDescriptor::default());
        let dummy_depth = create_texture(device, "itugl unbound depth", DEPTH_FORMAT, 1, 1, &[])
            .create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            gpu: gpu.clone(),
            converter,
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            dummy_color,
            dummy_depth,
        }
    }

    pub(crate) fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Makes sure `texture` has an up-to-date mirror of the given kind and returns it.
    fn mirror(&self, texture: &Texture, kind: MirrorKind) -> wgpu::Texture {
        let (width, height) = texture.size();
        let existing = texture
            .gpu_mirror()
            .borrow()
            .as_ref()
            .filter(|mirror| {
                mirror.kind == kind
                    && mirror.gpu.device == self.gpu.device
                    && mirror.size() == (width, height)
            })
            .map(|mirror| mirror.texture.clone());

        let mirror = match existing {
            Some(mirror) => mirror,
            None => {
                // Keep texels the old mirror rendered before it is replaced.
                texture.sync_host();
                let view_formats: &[wgpu::TextureFormat] = if kind == MirrorKind::Display {
                    &[DISPLAY_SRGB_FORMAT]
                } else {
                    &[]
                };
                let mirror = create_texture(
                    &self.gpu.device,
                    texture.label(),
                    kind.format(),
                    width,
                    height,
                    view_formats,
                );
                *texture.gpu_mirror().borrow_mut() = Some(GpuMirror {
                    gpu: self.gpu.clone(),
                    converter: Rc::clone(&self.converter),
                    texture: mirror.clone(),
                    kind,
                });
                texture.mark_host_written();
                log::debug!(
                    "created {kind:?} mirror for texture `{}` ({width}x{height})",
                    texture.label()
                );
                mirror
            }
        };
        if texture.is_gpu_stale() {
            self.upload(texture, &mirror, kind);
            texture.mark_uploaded();
        }
        mirror
    }

    fn upload(&self, texture: &Texture, mirror: &wgpu::Texture, kind: MirrorKind) {
        let (width, height) = texture.size();
        let device = &self.gpu.device;
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        if kind == MirrorKind::Display {
            let pixels = texture.to_rgba8();
            self.gpu.queue.write_texture(
                copy_target(mirror),
                pixels.as_raw(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(4 * width),
                    rows_per_image: Some(height),
                },
                extent,
            );
            return;
        }

        let staging = create_texture(device, "itugl staging", STAGING_FORMAT, width, height, &[]);
        {
            let texels = texture.texels();
            self.gpu.queue.write_texture(
                copy_target(&staging),
                bytemuck::cast_slice(texels.as_raw()),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(16 * width),
                    rows_per_image: Some(height),
                },
                extent,
            );
        }
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("itugl upload"),
        });
        let source = staging.create_view(&wgpu::TextureViewDescriptor::default());
        let target = mirror.create_view(&wgpu::TextureViewDescriptor::default());
        let conversion = if kind == MirrorKind::Depth {
            Conversion::ToDepth
        } else {
            Conversion::ToColor
        };
        self.converter
            .convert(device, &mut encoder, &source, &target, conversion);
        self.gpu.queue.submit(iter::once(encoder.finish()));
    }

    fn mesh_buffers(&self, mesh: &Mesh) -> Rc<MeshBuffers> {
        let mut cache = mesh.gpu_buffers().borrow_mut();
        match cache.as_ref() {
            Some(buffers) if buffers.device == self.gpu.device => Rc::clone(buffers),
            _ => {
                let buffers = Rc::new(MeshBuffers::upload(&self.gpu.device, mesh));
                *cache = Some(Rc::clone(&buffers));
                buffers
            }
        }
    }

    fn program(&mut self, program: &ShaderProgram) -> Option<Rc<GpuProgram>> {
        if let Some(compiled) = self.programs.get(&program.id()) {
            return compiled.clone();
        }
        let compiled = self.compile(program).map(Rc::new);
        self.programs.insert(program.id(), compiled.clone());
        compiled
    }

    fn compile(&self, program: &ShaderProgram) -> Option<GpuProgram> {
        let Some(source) = program.wgsl_module() else {
            log::warn!(
                "program `{}` has no WGSL source; the GPU device skips its draws",
                program.name()
            );
            return None;
        };
        let device = &self.gpu.device;
        let layout = UniformLayout::new(program.declarations());

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        entries.extend(
            layout
                .textures
                .iter()
                .map(|slot| texture_entry(slot.binding, slot.depth)),
        );
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(program.name()),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(program.name()),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(program.name()),
            size: layout.size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            log::warn!("program `{}` failed to compile for the GPU: {err}", program.name());
            return None;
        }

        log::debug!(
            "compiled program `{}` for the GPU ({} uniform bytes, {} textures)",
            program.name(),
            layout.size,
            layout.textures.len()
        );
        Some(GpuProgram {
            module,
            layout,
            bind_group_layout,
            pipeline_layout,
            uniforms,
        })
    }

    fn pipeline(&mut self, key: PipelineKey, program: &GpuProgram) -> Option<wgpu::RenderPipeline> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return pipeline.clone();
        }
        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let targets: Vec<_> = key
            .color
            .map(|format| wgpu::ColorTargetState {
                format,
                blend: key.blend.map(blend_state),
                write_mask: wgpu::ColorWrites::ALL,
            })
            .into_iter()
            .map(Some)
            .collect();
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("itugl draw"),
            layout: Some(&program.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &program.module,
                entry_point: Some("itugl_vertex"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: size_of::<crate::mesh::Vertex3d>() as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![
                        0 => Float32x3,
                        1 => Float32x3,
                        2 => Float32x2
                    ],
                }],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.module,
                entry_point: Some("itugl_fragment"),
                targets: &targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: key.cull_back_faces.then_some(wgpu::Face::Back),
                ..Default::default()
            },
            depth_stencil: key.depth.then(|| wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: key.depth_test && key.depth_write,
                depth_compare: if key.depth_test {
                    compare_function(key.depth_function)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: Default::default(),
                bias: Default::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let pipeline = match pollster::block_on(device.pop_error_scope()) {
            Some(err) => {
                log::warn!("failed to create pipeline for {key:?}: {err}");
                None
            }
            None => {
                log::debug!("created pipeline for {key:?}");
                Some(pipeline)
            }
        };
        self.pipelines.insert(key, pipeline.clone());
        pipeline
    }

    fn attachment_views(&self, target: &RenderTarget) -> (Option<wgpu::TextureView>, Option<wgpu::TextureView>) {
        let color = target.color.map(|texture| {
            let kind = if target.display {
                MirrorKind::Display
            } else {
                MirrorKind::Color
            };
            self.mirror(texture, kind)
                .create_view(&wgpu::TextureViewDescriptor {
                    format: target.color_format(),
                    ..Default::default()
                })
        });
        let depth = target.depth.map(|texture| {
            self.mirror(texture, MirrorKind::Depth)
                .create_view(&wgpu::TextureViewDescriptor::default())
        });
        (color, depth)
    }

    /// Clears the attachments of `target`. `color` is linear.
    pub(crate) fn clear(&mut self, target: &RenderTarget, color: Option<Vec4>, depth: Option<f32>) {
        let (color_view, depth_view) = self.attachment_views(target);
        let color_view = color_view.filter(|_| color.is_some());
        let depth_view = depth_view.filter(|_| depth.is_some());
        if color_view.is_none() && depth_view.is_none() {
            return;
        }

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("itugl clear"),
            });
        {
            let value = color.unwrap_or(Vec4::ZERO).as_dvec4();
            let color_attachments: Vec<_> = color_view
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color {
                                r: value.x,
                                g: value.y,
                                b: value.z,
                                a: value.w,
                            }),
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })
                })
                .collect();
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("itugl clear"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_view.as_ref().map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Clear(depth.unwrap_or(1.0).clamp(0.0, 1.0)),
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.gpu.queue.submit(iter::once(encoder.finish()));

        if let (Some(texture), Some(_)) = (target.color, color_view) {
            texture.mark_gpu_written();
        }
        if let (Some(texture), Some(_)) = (target.depth, depth_view) {
            texture.mark_gpu_written();
        }
    }

    /// Draws one submesh. Returns `false` when the draw was skipped.
    pub(crate) fn draw(
        &mut self,
        program: &ShaderProgram,
        mesh: &Mesh,
        submesh: usize,
        state: &RasterState,
        target: &RenderTarget,
    ) -> bool {
        let Some(compiled) = self.program(program) else {
            return false;
        };
        let buffers = self.mesh_buffers(mesh);
        let Some(Some(geometry)) = buffers.submeshes.get(submesh) else {
            return false;
        };

        let key = PipelineKey {
            program: program.id(),
            color: target.color_format(),
            depth: target.depth.is_some(),
            blend: state.blend,
            depth_test: state.depth_test && target.depth.is_some(),
            depth_write: state.depth_write,
            depth_function: state.depth_function,
            cull_back_faces: state.cull_back_faces,
        };
        let Some(pipeline) = self.pipeline(key, &compiled) else {
            return false;
        };
        let (color_view, depth_view) = self.attachment_views(target);

        let values = program.values();
        let mut texture_views = Vec::with_capacity(compiled.layout.textures.len());
        for slot in &compiled.layout.textures {
            let view = match values.get(slot.location) {
                Some(Some(UniformValue::Texture(texture))) if target.contains(texture) => {
                    texture.warn_feedback();
                    None
                }
                Some(Some(UniformValue::Texture(texture))) => Some(
                    self.mirror(texture, MirrorKind::for_texture(texture))
                        .create_view(&wgpu::TextureViewDescriptor::default()),
                ),
                _ => None,
            };
            texture_views.push(view.unwrap_or_else(|| {
                if slot.depth {
                    self.dummy_depth.clone()
                } else {
                    self.dummy_color.clone()
                }
            }));
        }

        let size = target
            .color
            .or(target.depth)
            .map(|texture| texture.size())
            .unwrap_or((1, 1));
        let bytes = compiled
            .layout
            .pack(&values, size, |texture| !target.contains(texture));
        drop(values);
        self.gpu.queue.write_buffer(&compiled.uniforms, 0, &bytes);

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: compiled.uniforms.as_entire_binding(),
        }];
        entries.extend(
            compiled
                .layout
                .textures
                .iter()
                .zip(&texture_views)
                .map(|(slot, view)| wgpu::BindGroupEntry {
                    binding: slot.binding,
                    resource: wgpu::BindingResource::TextureView(view),
                }),
        );
        let bind_group = self
            .gpu
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(program.name()),
                layout: &compiled.bind_group_layout,
                entries: &entries,
            });

        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("itugl draw"),
            });
        {
            let color_attachments: Vec<_> = color_view
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                        depth_slice: None,
                    })
                })
                .collect();
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(program.name()),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_view.as_ref().map(|view| {
                    wgpu::RenderPassDepthStencilAttachment {
                        view,
                        depth_ops: Some(wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        }),
                        stencil_ops: None,
                    }
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_vertex_buffer(0, geometry.vertices.slice(..));
            pass.set_index_buffer(geometry.indices.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..geometry.index_count, 0, 0..1);
        }
        self.gpu.queue.submit(iter::once(encoder.finish()));

        if let Some(texture) = target.color {
            texture.mark_gpu_written();
        }
        if let Some(texture) = target.depth.filter(|_| key.depth_test && key.depth_write) {
            texture.mark_gpu_written();
        }
        true
    }
}

fn copy_target(texture: &wgpu::Texture) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d::ZERO,
        aspect: wgpu::TextureAspect::All,
    }
}

fn compare_function(function: DepthFunction) -> wgpu::CompareFunction {
    match function {
        DepthFunction::Never => wgpu::CompareFunction::Never,
        DepthFunction::Less => wgpu::CompareFunction::Less,
        DepthFunction::Equal => wgpu::CompareFunction::Equal,
        DepthFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        DepthFunction::Greater => wgpu::CompareFunction::Greater,
        DepthFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        DepthFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        DepthFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SourceColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSourceColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::DestinationColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDestinationColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::SourceAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSourceAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DestinationAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDestinationAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

fn blend_state(blend: BlendState) -> wgpu::BlendState {
    let (operation, min_max) = match blend.equation {
        BlendEquation::Add => (wgpu::BlendOperation::Add, false),
        BlendEquation::Subtract => (wgpu::BlendOperation::Subtract, false),
        BlendEquation::ReverseSubtract => (wgpu::BlendOperation::ReverseSubtract, false),
        BlendEquation::Min => (wgpu::BlendOperation::Min, true),
        BlendEquation::Max => (wgpu::BlendOperation::Max, true),
    };
    // Min and max ignore the factors, and wgpu requires them to be one.
    let component = if min_max {
        wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::One,
            operation,
        }
    } else {
        wgpu::BlendComponent {
            src_factor: blend_factor(blend.source),
            dst_factor: blend_factor(blend.destination),
            operation,
        }
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_and_max_blending_use_unit_factors() {
        let blend = blend_state(BlendState {
            equation: BlendEquation::Max,
            source: BlendFactor::SourceAlpha,
            destination: BlendFactor::Zero,
        });
        assert_eq!(blend.color.src_factor, wgpu::BlendFactor::One);
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::One);
        assert_eq!(blend.alpha.operation, wgpu::BlendOperation::Max);
    }

    #[test]
    fn alpha_blending_maps_factors() {
        let blend = blend_state(BlendState::alpha());
        assert_eq!(blend.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
        assert_eq!(blend.color.operation, wgpu::BlendOperation::Add);
    }

    #[test]
    fn backbuffer_targets_switch_to_the_srgb_view() {
        let texture = Texture::new("screen", 2, 2, crate::texture::TextureFormat::Rgba32F);
        let mut target = RenderTarget {
            color: Some(&texture),
            depth: None,
            display: true,
            srgb: true,
        };
        assert_eq!(target.color_format(), Some(DISPLAY_SRGB_FORMAT));
        target.srgb = false;
        assert_eq!(target.color_format(), Some(DISPLAY_FORMAT));
        target.display = false;
        assert_eq!(target.color_format(), Some(COLOR_FORMAT));
        assert!(target.contains(&texture));
    }
}
