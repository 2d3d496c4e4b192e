use glam::Vec3;
use tracing::debug;
use wgpu::util::DeviceExt;
use zerocopy::IntoBytes;

use crate::common::{initial_sort_pairs, padded_capacity};
use crate::error::{Result, SplatError};
use crate::gpu::GpuContext;
use crate::structures::{Bounds, SplatCloud, SplatRecord};

/// Key/value scratch pair, `capacity` slots each.
#[derive(Debug)]
pub struct SortBuffers {
    pub keys: wgpu::Buffer,
    pub values: wgpu::Buffer,
    pub count: u32,
    pub capacity: u32,
}

impl SortBuffers {
    /// Allocates both buffers for `count` splats. Contents are undefined until
    /// [`Self::upload_identity`] or the init kernel ran.
    pub fn new(ctx: &GpuContext, count: u32) -> Result<Self> {
        let capacity = padded_capacity(count);
        let size = u64::from(capacity) * 4;
        ctx.check_storage_size("sort keys", size)?;

        let create = |label| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };

        Ok(Self {
            keys: create("Sort Keys Buffer"),
            values: create("Sort Values Buffer"),
            count,
            capacity,
        })
    }

    /// Writes identity values and sentinel padding from the CPU.
    pub fn upload_identity(&self, queue: &wgpu::Queue) {
        let (keys, values) = initial_sort_pairs(self.count);
        queue.write_buffer(&self.keys, 0, bytemuck::cast_slice(&keys));
        queue.write_buffer(&self.values, 0, bytemuck::cast_slice(&values));
    }

    /// Reads keys and values back, waiting for all submitted work.
    pub fn read_back(&self, ctx: &GpuContext) -> Result<(Vec<f32>, Vec<u32>)> {
        let size = u64::from(self.capacity) * 4;
        let keys = ctx.read_buffer(&self.keys, size)?;
        let values = ctx.read_buffer(&self.values, size)?;
        Ok((
            bytemuck::pod_collect_to_vec(&keys),
            bytemuck::pod_collect_to_vec(&values),
        ))
    }
}

/// Device buffers of one loaded splat set. Dropping it releases everything.
#[derive(Debug)]
pub struct SplatResources {
    pub positions: wgpu::Buffer,
    pub records: wgpu::Buffer,
    pub sort: SortBuffers,
    bounds: Bounds,
    cloud: SplatCloud,
}

impl SplatResources {
    /// Computes bounds and uploads positions and records. Takes ownership of
    /// the CPU records; they live exactly as long as the device copies.
    pub fn new(ctx: &GpuContext, cloud: SplatCloud) -> Result<Self> {
        let count = u32::try_from(cloud.len()).map_err(|_| SplatError::BufferTooLarge {
            label: "splat records",
            size: cloud.len() as u64,
            limit: u64::from(u32::MAX),
        })?;

        let bounds = cloud
            .bounds()
            .unwrap_or(Bounds::new(Vec3::ZERO, Vec3::ZERO))
            .flip_z();

        let positions = cloud.positions();
        ctx.check_storage_size("positions", positions.as_bytes().len() as u64)?;
        ctx.check_storage_size("splat records", cloud.records.as_bytes().len() as u64)?;
        let sort = SortBuffers::new(ctx, count)?;

        let positions = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Splat Positions Buffer"),
                contents: bytemuck::cast_slice(&positions),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });

        let records = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Splat Data Buffer"),
                contents: cloud.records.as_bytes(),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            });

        debug!(
            count,
            capacity = sort.capacity,
            record_bytes = cloud.records.as_bytes().len(),
            "Uploaded splat buffers"
        );

        Ok(Self {
            positions,
            records,
            sort,
            bounds,
            cloud,
        })
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.sort.count
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.sort.capacity
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// CPU copy of the uploaded records, in index order.
    pub fn records(&self) -> &[SplatRecord] {
        &self.cloud.records
    }
}

impl Drop for SplatResources {
    fn drop(&mut self) {
        self.positions.destroy();
        self.records.destroy();
        self.sort.keys.destroy();
        self.sort.values.destroy();
        debug!(count = self.sort.count, "Released splat buffers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::test_context;
    use crate::structures::{SENTINEL_INDEX, SENTINEL_KEY};
    use zerocopy::FromZeros;

    #[test]
    fn uploads_and_initializes_identity() {
        let Some(ctx) = test_context() else { return };

        let records: Vec<_> = (0..5)
            .map(|i| SplatRecord {
                pos: [i as f32, 0.0, 1.0 + i as f32],
                ..SplatRecord::new_zeroed()
            })
            .collect();
        let resources = SplatResources::new(&ctx, SplatCloud { records }).expect("upload");
        assert_eq!(resources.count(), 5);
        assert_eq!(resources.capacity(), 8);
        assert_eq!(resources.bounds().center(), Vec3::new(2.0, 0.0, -3.0));

        resources.sort.upload_identity(&ctx.queue);
        let (keys, values) = resources.sort.read_back(&ctx).expect("read back");
        assert_eq!(&values[..5], &[0, 1, 2, 3, 4]);
        assert!(values[5..].iter().all(|&v| v == SENTINEL_INDEX));
        assert!(keys[5..].iter().all(|&k| k == SENTINEL_KEY));

        let positions = ctx
            .read_buffer(&resources.positions, 5 * 12)
            .expect("read back");
        let positions: Vec<[f32; 3]> = bytemuck::pod_collect_to_vec(&positions);
        assert_eq!(positions[4], [4.0, 0.0, 5.0]);

        let records = ctx
            .read_buffer(&resources.records, 248 * 5)
            .expect("read back");
        assert_eq!(records.as_slice(), resources.records().as_bytes());
    }
}
