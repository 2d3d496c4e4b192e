pub mod camera;
pub mod common;
pub mod config;
pub mod error;
pub mod gpu;
pub mod ply;
pub mod preprocess;
pub mod rasterizer;
pub mod structures;

use std::path::Path;

use tracing::{debug, info};

pub use camera::CameraData;
pub use config::{LoaderConfig, RasterizerConfig};
pub use error::{Result, SplatError};
pub use gpu::sort::{BitonicSorter, GpuSorter};
pub use gpu::target::{OffscreenTarget, RenderTarget};
pub use gpu::GpuContext;
pub use rasterizer::{FrameStats, SplatRasterizer};
pub use structures::{Bounds, SplatCloud, SplatRecord};

use ply::PlyData;

/// Decodes and preprocesses an already read file. [`load_splats`] is this
/// on top of [`ply::read_file`].
pub fn prepare_cloud(data: PlyData, config: &LoaderConfig) -> Result<SplatCloud> {
    let vertex_count = data.header.vertex_count;
    let mut cloud = SplatCloud::from_ply(data)?;
    debug!(vertex_count, "Decoded splat records");

    preprocess::reorder_sh(&mut cloud.records);
    let relocated = preprocess::remove_distant_splats(&mut cloud.records, config.clipping_radius);
    info!(
        count = cloud.len(),
        relocated,
        radius = config.clipping_radius,
        "Loaded splats"
    );
    Ok(cloud)
}

/// Reads, decodes and preprocesses a splat file: SH coefficients interleaved,
/// splats outside `config.clipping_radius` moved to the sentinel position.
pub fn load_splats(path: impl AsRef<Path>, config: &LoaderConfig) -> Result<SplatCloud> {
    let data = ply::read_file(path, config.max_file_size)?;
    prepare_cloud(data, config)
}

cfg_if::cfg_if! {
if #[cfg(feature = "async")] {
    #[inline(never)]
    pub async fn load_splats_async(
        path: impl AsRef<Path>,
        config: &LoaderConfig,
    ) -> Result<SplatCloud> {
        let data = ply::read_file_async(path, config.max_file_size).await?;
        prepare_cloud(data, config)
    }
}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::{SENTINEL_POSITION, SH_COUNT};
    use std::io::Write;
    use zerocopy::FromZeros;

    fn planar_record(pos: [f32; 3]) -> SplatRecord {
        let mut record = SplatRecord {
            pos,
            ..SplatRecord::new_zeroed()
        };
        for (i, v) in record.sh.iter_mut().enumerate() {
            *v = i as f32;
        }
        record.opacity = 0.25;
        record
    }

    fn write_fixture(records: &[SplatRecord]) -> tempfile::NamedTempFile {
        let mut bytes = Vec::new();
        ply::write_ply(&mut bytes, records).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file
    }

    #[test]
    fn load_reorders_and_culls() {
        let file = write_fixture(&[planar_record([1.0, 0.0, 0.0]), planar_record([0.0, 9.0, 0.0])]);
        let cloud = load_splats(file.path(), &LoaderConfig::default()).unwrap();

        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.records[0].pos, [1.0, 0.0, 0.0]);
        assert_eq!(cloud.records[1].pos, SENTINEL_POSITION);
        for record in &cloud.records {
            assert_eq!(record.opacity, 0.25);
            // band 1, green came from planar offset 15 + 1
            assert_eq!(record.sh_coeff(1), Some([1.0, (SH_COUNT + 1) as f32, (2 * SH_COUNT + 1) as f32]));
        }
    }

    #[test]
    fn custom_radius_is_applied() {
        let file = write_fixture(&[planar_record([0.0, 9.0, 0.0])]);
        let config = LoaderConfig {
            clipping_radius: 10.0,
            ..Default::default()
        };
        let cloud = load_splats(file.path(), &config).unwrap();
        assert_eq!(cloud.records[0].pos, [0.0, 9.0, 0.0]);
    }

    #[test]
    fn empty_file_loads_as_empty_cloud() {
        let file = write_fixture(&[]);
        let cloud = load_splats(file.path(), &LoaderConfig::default()).unwrap();
        assert!(cloud.is_empty());
        assert!(cloud.bounds().is_none());
    }

    #[test]
    fn prepared_file_matches_load() {
        let file = write_fixture(&[planar_record([0.2, 0.0, 0.0]), planar_record([0.0, 0.0, 6.0])]);
        let config = LoaderConfig::default();
        let data = ply::read_file(file.path(), config.max_file_size).unwrap();
        assert_eq!(data.header.vertex_count, 2);

        let prepared = prepare_cloud(data, &config).unwrap();
        assert_eq!(prepared, load_splats(file.path(), &config).unwrap());
        assert_eq!(prepared.records[1].pos, SENTINEL_POSITION);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_splats("does/not/exist.ply", &LoaderConfig::default()).unwrap_err();
        assert!(matches!(err, SplatError::FileNotFound(_)));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_load_matches_blocking() {
        let file = write_fixture(&[planar_record([0.5, 0.5, 0.5]), planar_record([7.0, 0.0, 0.0])]);
        let config = LoaderConfig::default();
        let blocking = load_splats(file.path(), &config).unwrap();
        let async_cloud = load_splats_async(file.path(), &config).await.unwrap();
        assert_eq!(blocking, async_cloud);
    }
}
