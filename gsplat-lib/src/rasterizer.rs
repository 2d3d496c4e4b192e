//! Per-camera orchestration of one loaded splat set: depth keys, sort, draw.

use std::path::Path;

use tracing::{debug, info, trace_span, warn};

use crate::camera::CameraData;
use crate::config::{LoaderConfig, RasterizerConfig};
use crate::error::{Result, SplatError};
use crate::gpu::depth::DepthKeyPass;
use crate::gpu::draw::SplatDrawPipeline;
use crate::gpu::resources::SplatResources;
use crate::gpu::sort::{BitonicSorter, GpuSorter};
use crate::gpu::target::RenderTarget;
use crate::gpu::GpuContext;
use crate::structures::{Bounds, SplatCloud};

/// What one `render_for_camera` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Splat instances drawn, always the live count.
    pub instance_count: u32,
    /// Slots of the padded sort buffers.
    pub capacity: u32,
    /// `false` when the frame was drawn in upload order or not at all.
    pub sorted: bool,
    pub drawn: bool,
}

impl FrameStats {
    /// Nothing recorded: no splat set active, the active set is empty, or the
    /// device cannot draw splats.
    pub const fn skipped() -> Self {
        Self {
            instance_count: 0,
            capacity: 0,
            sorted: false,
            drawn: false,
        }
    }
}

struct ActiveSplats<S> {
    // `None` when the device cannot run compute passes
    ordering: Option<(DepthKeyPass, S)>,
    draw: SplatDrawPipeline,
    resources: SplatResources,
}

enum State<S> {
    Inactive,
    /// Loaded a file without splats.
    Empty,
    /// Loaded, but the device has no vertex-stage storage buffers.
    Undrawable { count: u32 },
    Active(Box<ActiveSplats<S>>),
}

/// Owns the GPU state of at most one splat set between `activate` and
/// `deactivate`. Rendering takes `&mut self`, so camera passes over the same
/// set are recorded and submitted one after another.
pub struct SplatRasterizer<S: GpuSorter = BitonicSorter> {
    ctx: GpuContext,
    config: RasterizerConfig,
    state: State<S>,
}

impl<S: GpuSorter> SplatRasterizer<S> {
    pub fn new(ctx: GpuContext, config: RasterizerConfig) -> Self {
        Self {
            ctx,
            config,
            state: State::Inactive,
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn config(&self) -> &RasterizerConfig {
        &self.config
    }

    /// Loads, preprocesses and uploads the splat file at `path`. Any previous
    /// set is released first. On error the rasterizer stays inactive.
    pub fn activate(&mut self, path: impl AsRef<Path>, clipping_radius: f32) -> Result<()> {
        self.deactivate();
        let path = path.as_ref();
        let loader = LoaderConfig {
            clipping_radius,
            ..self.config.loader
        };
        let cloud = crate::load_splats(path, &loader)?;
        debug!(path = %path.display(), "Uploading splat file");
        self.activate_cloud(cloud)
    }

    /// Uploads an already loaded cloud, as returned by [`crate::load_splats`].
    pub fn activate_cloud(&mut self, cloud: SplatCloud) -> Result<()> {
        self.deactivate();
        if cloud.is_empty() {
            warn!("Splat set has no splats to render");
            self.state = State::Empty;
            return Ok(());
        }
        if !self.ctx.draw_supported() {
            let count = u32::try_from(cloud.len()).unwrap_or(u32::MAX);
            warn!(count, "Device cannot read storage buffers while drawing, splats are not drawn");
            self.state = State::Undrawable { count };
            return Ok(());
        }

        let resources = SplatResources::new(&self.ctx, cloud)?;
        let ordering = if self.ctx.compute_supported() {
            let depth = DepthKeyPass::new(&self.ctx, &resources);
            depth.init(&self.ctx);
            let sorter = S::new(&self.ctx, resources.capacity())?;
            Some((depth, sorter))
        } else {
            warn!("Compute shaders unsupported, splats are drawn in upload order");
            resources.sort.upload_identity(&self.ctx.queue);
            None
        };
        let draw = SplatDrawPipeline::new(&self.ctx, &resources, self.config.color_format);

        info!(
            count = resources.count(),
            capacity = resources.capacity(),
            sorted = ordering.is_some(),
            "Activated splat set"
        );
        self.state = State::Active(Box::new(ActiveSplats {
            ordering,
            draw,
            resources,
        }));
        Ok(())
    }

    /// Releases every GPU buffer and the CPU records of the active set.
    pub fn deactivate(&mut self) {
        if !matches!(self.state, State::Inactive) {
            debug!("Deactivating splat set");
        }
        self.state = State::Inactive;
    }

    /// True only while a non-empty set is loaded.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    /// Splats of the loaded set, drawable or not.
    pub fn splat_count(&self) -> u32 {
        match &self.state {
            State::Active(active) => active.resources.count(),
            State::Undrawable { count } => *count,
            State::Inactive | State::Empty => 0,
        }
    }

    /// Bounds of the active set with z flipped.
    pub fn bounds(&self) -> Option<Bounds> {
        self.resources().map(SplatResources::bounds)
    }

    pub fn resources(&self) -> Option<&SplatResources> {
        match &self.state {
            State::Active(active) => Some(&active.resources),
            _ => None,
        }
    }

    /// Runs key generation and the sort for `camera` without drawing.
    /// Returns whether the sort buffers now hold a depth order.
    pub fn sort_for_camera(&mut self, camera: &CameraData) -> Result<bool> {
        let State::Active(active) = &self.state else {
            return Ok(false);
        };
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Splat Sort Encoder"),
            });
        let sorted = record_ordering(&self.ctx, active, &mut encoder, camera)?;
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(sorted)
    }

    /// Records key generation, sort and draw for one camera into a single
    /// encoder and submits it. Inactive, empty or undrawable sets draw nothing.
    ///
    /// `target.format` must equal [`RasterizerConfig::color_format`].
    pub fn render_for_camera(
        &mut self,
        camera: &CameraData,
        target: &RenderTarget,
    ) -> Result<FrameStats> {
        let State::Active(active) = &self.state else {
            return Ok(FrameStats::skipped());
        };
        if target.format != self.config.color_format {
            return Err(SplatError::TargetFormat {
                expected: self.config.color_format,
                found: target.format,
            });
        }
        let _span = trace_span!("Render splats", count = active.resources.count()).entered();

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Splat Frame Encoder"),
            });
        let sorted = record_ordering(&self.ctx, active, &mut encoder, camera)?;

        active.draw.update_camera(
            &self.ctx.queue,
            camera,
            target.aspect(),
            self.config.depth_near,
            self.config.depth_far,
        );
        let instance_count = active
            .draw
            .draw(&mut encoder, target.view, self.config.clear_color);
        self.ctx.queue.submit(Some(encoder.finish()));

        Ok(FrameStats {
            instance_count,
            capacity: active.resources.capacity(),
            sorted,
            drawn: true,
        })
    }
}

fn record_ordering<S: GpuSorter>(
    ctx: &GpuContext,
    active: &ActiveSplats<S>,
    encoder: &mut wgpu::CommandEncoder,
    camera: &CameraData,
) -> Result<bool> {
    let Some((depth, sorter)) = &active.ordering else {
        return Ok(false);
    };
    depth.record(ctx, encoder, camera);
    sorter.dispatch(encoder, &active.resources.sort)?;
    Ok(true)
}
