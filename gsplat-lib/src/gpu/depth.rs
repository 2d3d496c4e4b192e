use tracing::trace_span;

use crate::camera::CameraData;
use crate::common::dispatch_size;
use crate::gpu::resources::SplatResources;
use crate::gpu::{storage_entry, uniform_entry, GpuContext};

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DepthUniforms {
    sort_transform: [[f32; 4]; 4],
    splat_count: u32,
    capacity: u32,
    _pad: [u32; 2],
}

/// Compute kernels filling the sort buffers of one splat set: the one-time
/// init kernel and the per-camera depth key kernel.
pub struct DepthKeyPass {
    init_pipeline: wgpu::ComputePipeline,
    depth_pipeline: wgpu::ComputePipeline,
    uniforms: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    splat_count: u32,
    capacity: u32,
}

impl DepthKeyPass {
    pub fn new(ctx: &GpuContext, resources: &SplatResources) -> Self {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Depth Key Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/depth.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Depth Key Bind Group Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::COMPUTE, false, None),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, true),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(3, wgpu::ShaderStages::COMPUTE, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Depth Key Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let create_pipeline = |label, entry_point| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let init_pipeline = create_pipeline("Init Sort Buffers Pipeline", "init_sort_buffers");
        let depth_pipeline = create_pipeline("Depth Key Pipeline", "calc_depth_keys");

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Depth Key Uniforms"),
            size: size_of::<DepthUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Depth Key Bind Group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: resources.positions.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: resources.sort.keys.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: resources.sort.values.as_entire_binding(),
                },
            ],
        });

        Self {
            init_pipeline,
            depth_pipeline,
            uniforms,
            bind_group,
            splat_count: resources.count(),
            capacity: resources.capacity(),
        }
    }

    fn write_uniforms(&self, queue: &wgpu::Queue, sort_transform: glam::Mat4) {
        let uniforms = DepthUniforms {
            sort_transform: sort_transform.to_cols_array_2d(),
            splat_count: self.splat_count,
            capacity: self.capacity,
            _pad: [0; 2],
        };
        queue.write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));
    }

    fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, pipeline: &wgpu::ComputePipeline, label: &str) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        let (x, y) = dispatch_size(self.capacity);
        pass.dispatch_workgroups(x, y, 1);
    }

    /// Identity values and sentinel padding, submitted right away.
    pub fn init(&self, ctx: &GpuContext) {
        self.write_uniforms(&ctx.queue, glam::Mat4::IDENTITY);
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Init Sort Buffers Encoder"),
            });
        self.dispatch(&mut encoder, &self.init_pipeline, "Init Sort Buffers Pass");
        ctx.queue.submit(Some(encoder.finish()));
    }

    /// Records the key pass for `camera`. The uniform write lands with the
    /// next queue submission, so submit `encoder` before recording another camera.
    pub fn record(&self, ctx: &GpuContext, encoder: &mut wgpu::CommandEncoder, camera: &CameraData) {
        let _span = trace_span!("Depth keys", count = self.splat_count).entered();
        self.write_uniforms(&ctx.queue, camera.sort_transform());
        self.dispatch(encoder, &self.depth_pipeline, "Depth Key Pass");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::depth_key;
    use crate::gpu::test_context;
    use crate::structures::{SplatCloud, SplatRecord, SENTINEL_INDEX, SENTINEL_KEY};
    use glam::Vec3;
    use zerocopy::FromZeros;

    #[test]
    fn gpu_keys_match_cpu_mirror() {
        let Some(ctx) = test_context() else { return };

        let points = [
            [0.0, 0.0, 3.0],
            [1.0, -2.0, 0.5],
            [-4.0, 1.0, 8.0],
            [0.0, 0.0, -2.0],
            [2.0, 2.0, 2.0],
        ];
        let cloud = SplatCloud {
            records: points
                .iter()
                .map(|&pos| SplatRecord {
                    pos,
                    ..SplatRecord::new_zeroed()
                })
                .collect(),
        };
        let resources = SplatResources::new(&ctx, cloud).expect("upload");
        let pass = DepthKeyPass::new(&ctx, &resources);
        pass.init(&ctx);

        let camera = CameraData::look_at(Vec3::new(1.0, 1.0, -3.0), Vec3::ZERO, Vec3::Y, 1.0);
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        pass.record(&ctx, &mut encoder, &camera);
        ctx.queue.submit(Some(encoder.finish()));

        let (keys, values) = resources.sort.read_back(&ctx).expect("read back");
        let m = camera.sort_transform();
        for (i, &p) in points.iter().enumerate() {
            let expected = depth_key(&m, Vec3::from_array(p));
            assert!((keys[i] - expected).abs() < 1e-4, "slot {}", i);
            assert_eq!(values[i], i as u32);
        }
        assert_eq!(&keys[5..], &[SENTINEL_KEY; 3]);
        assert_eq!(&values[5..], &[SENTINEL_INDEX; 3]);
    }
}
