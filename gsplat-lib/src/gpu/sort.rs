//! Ascending key/value sort over device-resident buffers.
//!
//! Sorters order the whole power-of-two buffer. Padding slots carry
//! [`crate::structures::SENTINEL_KEY`], which is what keeps them behind every
//! real splat; no sorter special-cases the live count.

use tracing::{debug, trace_span};
use wgpu::util::DeviceExt;

use crate::common::{align_to, dispatch_size};
use crate::error::{Result, SplatError};
use crate::gpu::resources::SortBuffers;
use crate::gpu::{storage_entry, uniform_entry, GpuContext};

/// A GPU key/value sort. Implementations allocate their scratch for
/// `capacity` slots up front and free it on drop.
pub trait GpuSorter: Sized {
    fn new(ctx: &GpuContext, capacity: u32) -> Result<Self>;

    fn capacity(&self) -> u32;

    /// Records an ascending sort of `buffers` by key into `encoder`.
    /// Tie order is unspecified.
    fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, buffers: &SortBuffers) -> Result<()>;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct SortParams {
    pub k: u32,
    pub j: u32,
    pub pad: [u32; 2],
}

/// Every `(k, j)` step for `capacity` slots, in execution order. The schedule
/// for a smaller power of two is a prefix of this one.
pub(crate) fn bitonic_passes(capacity: u32) -> Vec<SortParams> {
    let mut passes = Vec::new();
    let mut k = 2;
    while k <= capacity {
        let mut j = k / 2;
        while j > 0 {
            passes.push(SortParams { k, j, pad: [0; 2] });
            j /= 2;
        }
        k *= 2;
    }
    passes
}

/// Number of passes needed for `capacity` slots, log2(n) * (log2(n) + 1) / 2.
#[inline]
fn pass_count(capacity: u32) -> usize {
    let stages = capacity.trailing_zeros() as usize;
    stages * (stages + 1) / 2
}

/// Bitonic sorter. All step parameters for the full capacity live in one
/// uniform buffer addressed with dynamic offsets.
pub struct BitonicSorter {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    params_stride: u64,
    capacity: u32,
    device: wgpu::Device,
}

impl GpuSorter for BitonicSorter {
    fn new(ctx: &GpuContext, capacity: u32) -> Result<Self> {
        let device = &ctx.device;
        if !capacity.is_power_of_two() {
            return Err(SplatError::BufferTooLarge {
                label: "sort capacity (not a power of two)",
                size: u64::from(capacity),
                limit: u64::from(capacity.next_power_of_two()),
            });
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Bitonic Sort Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/bitonic.wgsl").into()),
        });

        let param_size = size_of::<SortParams>() as u64;
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Bitonic Sort Bind Group Layout"),
            entries: &[
                uniform_entry(
                    0,
                    wgpu::ShaderStages::COMPUTE,
                    true,
                    wgpu::BufferSize::new(param_size),
                ),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Bitonic Sort Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Bitonic Sort Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("bitonic_step"),
            compilation_options: Default::default(),
            cache: None,
        });

        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let params_stride = align_to(param_size, alignment);
        let passes = bitonic_passes(capacity);
        let mut contents = vec![0u8; passes.len().max(1) * params_stride as usize];
        for (i, pass) in passes.iter().enumerate() {
            let at = i * params_stride as usize;
            contents[at..at + param_size as usize].copy_from_slice(bytemuck::bytes_of(pass));
        }

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Bitonic Sort Params"),
            contents: &contents,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        debug!(capacity, passes = passes.len(), "Created bitonic sorter");

        Ok(Self {
            pipeline,
            bind_group_layout,
            params,
            params_stride,
            capacity,
            device: device.clone(),
        })
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn dispatch(&self, encoder: &mut wgpu::CommandEncoder, buffers: &SortBuffers) -> Result<()> {
        if buffers.capacity > self.capacity {
            return Err(SplatError::BufferTooLarge {
                label: "sort buffers",
                size: u64::from(buffers.capacity),
                limit: u64::from(self.capacity),
            });
        }
        if buffers.capacity <= 1 {
            return Ok(());
        }

        let _span = trace_span!("Bitonic sort", count = buffers.count, capacity = buffers.capacity)
            .entered();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Bitonic Sort Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.params,
                        offset: 0,
                        size: wgpu::BufferSize::new(size_of::<SortParams>() as u64),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffers.keys.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.values.as_entire_binding(),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Bitonic Sort Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);

        // each invocation handles one compare-and-swap pair
        let (x, y) = dispatch_size(buffers.capacity / 2);
        for i in 0..pass_count(buffers.capacity) {
            let offset = (i as u64 * self.params_stride) as wgpu::DynamicOffset;
            pass.set_bind_group(0, &bind_group, &[offset]);
            pass.dispatch_workgroups(x, y, 1);
        }
        Ok(())
    }
}

impl Drop for BitonicSorter {
    fn drop(&mut self) {
        self.params.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{depth_key, CameraData};
    use crate::common::initial_sort_pairs;
    use crate::gpu::test_context;
    use crate::structures::{MAX_LIVE_KEY, SENTINEL_INDEX};
    use glam::Vec3;
    use rand::Rng;

    /// Runs the schedule exactly as the kernel does, one invocation at a time.
    fn emulate(keys: &mut [f32], values: &mut [u32]) {
        let n = keys.len() as u32;
        for p in bitonic_passes(n) {
            for t in 0..n / 2 {
                let lo = (2 * p.j * (t / p.j) + (t % p.j)) as usize;
                let hi = lo + p.j as usize;
                let ascending = (lo as u32 & p.k) == 0;
                if (keys[lo] > keys[hi]) == ascending {
                    keys.swap(lo, hi);
                    values.swap(lo, hi);
                }
            }
        }
    }

    #[test]
    fn test_num_passes_calculation() {
        for (capacity, expected) in [(1, 0), (2, 1), (4, 3), (8, 6), (1024, 55), (131_072, 153)] {
            assert_eq!(bitonic_passes(capacity).len(), expected, "capacity {}", capacity);
            assert_eq!(pass_count(capacity), expected);
        }
    }

    #[test]
    fn smaller_schedules_are_prefixes() {
        let full = bitonic_passes(1 << 12);
        for m in 1..12 {
            let small = bitonic_passes(1 << m);
            assert_eq!(&full[..small.len()], small.as_slice());
        }
    }

    #[test]
    fn schedule_sorts_and_keeps_padding_last() {
        let mut rng = rand::rng();
        for count in [1u32, 2, 3, 5, 17, 100, 255, 256, 257, 1000] {
            let (mut keys, mut values) = initial_sort_pairs(count);
            for key in keys.iter_mut().take(count as usize) {
                *key = rng.random_range(-50.0..50.0);
            }
            let original = keys.clone();
            emulate(&mut keys, &mut values);

            assert!(keys.windows(2).all(|w| w[0] <= w[1]), "count {}", count);
            let (real, padding) = values.split_at(count as usize);
            assert!(real.iter().all(|&v| v < count));
            assert!(padding.iter().all(|&v| v == u32::MAX));
            for (k, &v) in keys.iter().zip(real) {
                assert_eq!(*k, original[v as usize]);
            }
        }
    }

    #[test]
    fn clamped_non_finite_keys_sort_before_padding() {
        let camera = CameraData::look_at(Vec3::ZERO, Vec3::Z, Vec3::Y, 1.0);
        let m = camera.sort_transform();
        for (count, bad) in [(3u32, 2usize), (13, 9), (37, 0)] {
            let (mut keys, mut values) = initial_sort_pairs(count);
            for (i, key) in keys.iter_mut().take(count as usize).enumerate() {
                let z = if i == bad { f32::NAN } else { i as f32 };
                *key = depth_key(&m, Vec3::new(0.0, 0.0, z));
            }
            emulate(&mut keys, &mut values);

            let (live, padding) = values.split_at(count as usize);
            assert!(padding.iter().all(|&v| v == SENTINEL_INDEX), "count {}", count);
            assert_eq!(live.last(), Some(&(bad as u32)));
            assert_eq!(keys[count as usize - 1], MAX_LIVE_KEY);
        }
    }

    #[test]
    fn test_sorting_gpu() {
        let Some(ctx) = test_context() else { return };
        let mut rng = rand::rng();

        for count in [3u32, 64, 1000, 70_000] {
            let buffers = SortBuffers::new(&ctx, count).expect("buffers");
            let (mut keys, values) = initial_sort_pairs(count);
            for key in keys.iter_mut().take(count as usize) {
                *key = rng.random_range(0.0..1000.0);
            }
            ctx.queue.write_buffer(&buffers.keys, 0, bytemuck::cast_slice(&keys));
            ctx.queue.write_buffer(&buffers.values, 0, bytemuck::cast_slice(&values));

            let sorter = BitonicSorter::new(&ctx, buffers.capacity).expect("sorter");
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
            sorter.dispatch(&mut encoder, &buffers).expect("dispatch");
            ctx.queue.submit(Some(encoder.finish()));

            let (sorted_keys, sorted_values) = buffers.read_back(&ctx).expect("read back");
            assert!(sorted_keys.windows(2).all(|w| w[0] <= w[1]));
            for (k, &v) in sorted_keys.iter().zip(&sorted_values[..count as usize]) {
                assert_eq!(*k, keys[v as usize]);
            }
            assert!(sorted_values[count as usize..].iter().all(|&v| v == u32::MAX));
        }
    }

    #[test]
    fn rejects_buffers_above_capacity() {
        let Some(ctx) = test_context() else { return };
        let sorter = BitonicSorter::new(&ctx, 4).expect("sorter");
        let buffers = SortBuffers::new(&ctx, 9).expect("buffers");
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        assert!(matches!(
            sorter.dispatch(&mut encoder, &buffers),
            Err(SplatError::BufferTooLarge { size: 16, limit: 4, .. })
        ));
    }
}
