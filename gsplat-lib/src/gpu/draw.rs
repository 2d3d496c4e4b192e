use std::ops::Range;

use tracing::trace_span;

use crate::camera::CameraData;
use crate::gpu::resources::SplatResources;
use crate::gpu::{storage_entry, uniform_entry, GpuContext};

/// Vertices per splat instance: one quad as two triangles.
pub const SPLAT_VERTEX_COUNT: u32 = 6;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct CameraUniforms {
    view: [[f32; 4]; 4],
    proj: [[f32; 4]; 4],
}

/// Vertex and instance ranges of the splat draw. Padding slots of the sort
/// buffers are never instanced.
#[inline]
pub fn draw_ranges(instance_count: u32) -> (Range<u32>, Range<u32>) {
    (0..SPLAT_VERTEX_COUNT, 0..instance_count)
}

// Splats arrive nearest first, so each fragment is composited behind what is
// already in the target ("under"). Fragment output is premultiplied.
const UNDER_BLEND: wgpu::BlendComponent = wgpu::BlendComponent {
    src_factor: wgpu::BlendFactor::OneMinusDstAlpha,
    dst_factor: wgpu::BlendFactor::One,
    operation: wgpu::BlendOperation::Add,
};

/// Render pipeline drawing the records of one splat set through its sorted
/// value buffer.
pub struct SplatDrawPipeline {
    pipeline: wgpu::RenderPipeline,
    camera: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    instance_count: u32,
}

impl SplatDrawPipeline {
    pub fn new(ctx: &GpuContext, resources: &SplatResources, format: wgpu::TextureFormat) -> Self {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Splat Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/splat.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Splat Bind Group Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::VERTEX, false, None),
                storage_entry(1, wgpu::ShaderStages::VERTEX, true),
                storage_entry(2, wgpu::ShaderStages::VERTEX, true),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Splat Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Splat Render Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState {
                        color: UNDER_BLEND,
                        alpha: UNDER_BLEND,
                    }),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let camera = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Splat Camera Uniforms"),
            size: size_of::<CameraUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Splat Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: camera.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: resources.records.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: resources.sort.values.as_entire_binding(),
                },
            ],
        });

        Self {
            pipeline,
            camera,
            bind_group,
            instance_count: resources.count(),
        }
    }

    pub fn update_camera(&self, queue: &wgpu::Queue, camera: &CameraData, aspect: f32, near: f32, far: f32) {
        let uniforms = CameraUniforms {
            view: camera.world_to_camera().to_cols_array_2d(),
            proj: camera.projection(aspect, near, far).to_cols_array_2d(),
        };
        queue.write_buffer(&self.camera, 0, bytemuck::bytes_of(&uniforms));
    }

    /// Records the draw into `view`, clearing it first when `clear` is set.
    /// Returns the instance count.
    pub fn draw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        view: &wgpu::TextureView,
        clear: Option<wgpu::Color>,
    ) -> u32 {
        let _span = trace_span!("Draw splats", instances = self.instance_count).entered();

        let load = match clear {
            Some(color) => wgpu::LoadOp::Clear(color),
            None => wgpu::LoadOp::Load,
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Splat Render Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let (vertices, instances) = draw_ranges(self.instance_count);
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.draw(vertices, instances);
        self.instance_count
    }
}
