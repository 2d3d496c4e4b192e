pub mod depth;
pub mod draw;
pub mod resources;
pub mod sort;
pub mod target;

use std::sync::mpsc;

use tracing::info;

use crate::error::{Result, SplatError};

/// Device and queue the splat pipeline records into.
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    compute_supported: bool,
    draw_supported: bool,
}

impl GpuContext {
    /// Wraps a device owned by the host renderer.
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        downlevel: &wgpu::DownlevelCapabilities,
    ) -> Self {
        let limits = device.limits();
        // the draw reads records and order from storage buffers in the vertex stage
        let draw_supported = downlevel
            .flags
            .contains(wgpu::DownlevelFlags::VERTEX_STORAGE)
            && limits.max_storage_buffers_per_shader_stage >= 2
            && limits.max_storage_buffer_binding_size > 0;
        Self {
            device,
            queue,
            compute_supported: draw_supported
                && limits.max_storage_buffers_per_shader_stage >= 3
                && downlevel
                    .flags
                    .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            draw_supported,
        }
    }

    /// Creates a device without a surface, for tools and tests.
    pub async fn headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| SplatError::NoAdapter(e.to_string()))?;

        let adapter_info = adapter.get_info();
        info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "Using GPU adapter");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gsplat device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| SplatError::RequestDevice(e.to_string()))?;

        Ok(Self::new(device, queue, &adapter.get_downlevel_capabilities()))
    }

    pub fn headless_blocking() -> Result<Self> {
        pollster::block_on(Self::headless())
    }

    /// Whether compute passes (key generation and sorting) can run at all.
    #[inline]
    pub fn compute_supported(&self) -> bool {
        self.compute_supported
    }

    /// Whether splats can be drawn at all, sorted or not.
    #[inline]
    pub fn draw_supported(&self) -> bool {
        self.draw_supported
    }

    /// Fails with [`SplatError::BufferTooLarge`] if the device cannot hold a
    /// storage buffer of `size` bytes.
    pub(crate) fn check_storage_size(&self, label: &'static str, size: u64) -> Result<()> {
        let limits = self.device.limits();
        let limit = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        if size > limit {
            return Err(SplatError::BufferTooLarge { label, size, limit });
        }
        Ok(())
    }

    /// Copies `size` bytes of `buffer` to the CPU. Blocks until the queue is idle.
    pub fn read_buffer(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        self.map_staging(&staging)
    }

    /// Maps a `MAP_READ` buffer once all submitted work finished and copies it out.
    pub(crate) fn map_staging(&self, staging: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| SplatError::BufferMap(e.to_string()))?;
        receiver
            .recv()
            .map_err(|e| SplatError::BufferMap(e.to_string()))?
            .map_err(|e| SplatError::BufferMap(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

pub(crate) fn storage_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    read_only: bool,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn uniform_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    has_dynamic_offset: bool,
    min_binding_size: Option<wgpu::BufferSize>,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset,
            min_binding_size,
        },
        count: None,
    }
}

/// Acquires a headless device for GPU tests, `None` on machines without one.
#[cfg(test)]
pub(crate) fn test_context() -> Option<GpuContext> {
    match GpuContext::headless_blocking() {
        Ok(ctx) if ctx.compute_supported() => Some(ctx),
        Ok(_) => {
            eprintln!("Skipping GPU test: adapter has no compute support");
            None
        }
        Err(e) => {
            eprintln!("Skipping GPU test: {}", e);
            None
        }
    }
}
