use crate::common::align_to;
use crate::error::Result;
use crate::gpu::GpuContext;

/// Color attachment a frame is drawn into.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget<'a> {
    pub view: &'a wgpu::TextureView,
    /// Must equal the rasterizer's `color_format`.
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
}

impl RenderTarget<'_> {
    #[inline]
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

/// Texture owned by the caller of a headless render, readable on the CPU.
pub struct OffscreenTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    width: u32,
    height: u32,
}

impl OffscreenTarget {
    /// Four bytes per pixel formats only.
    pub fn new(ctx: &GpuContext, width: u32, height: u32, format: wgpu::TextureFormat) -> Self {
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            format,
            width,
            height,
        }
    }

    pub fn target(&self) -> RenderTarget<'_> {
        RenderTarget {
            view: &self.view,
            format: self.format,
            width: self.width,
            height: self.height,
        }
    }

    /// Tightly packed rows of RGBA bytes. Waits for all submitted work.
    pub fn read_pixels(&self, ctx: &GpuContext) -> Result<Vec<u8>> {
        let row_bytes = u64::from(self.width) * 4;
        let padded_row = align_to(row_bytes, u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT));

        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Offscreen Readback Buffer"),
            size: padded_row * u64::from(self.height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Offscreen Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row as u32),
                    rows_per_image: Some(self.height),
                },
            },
            self.texture.size(),
        );
        ctx.queue.submit(Some(encoder.finish()));

        let padded = ctx.map_staging(&staging)?;
        Ok(padded
            .chunks_exact(padded_row as usize)
            .flat_map(|row| &row[..row_bytes as usize])
            .copied()
            .collect())
    }
}

impl Drop for OffscreenTarget {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}
