use crate::common::{DEFAULT_CLIPPING_RADIUS, MAX_PLY_FILE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderConfig {
    /// Files of this size or larger are rejected.
    pub max_file_size: u64,
    /// Splats farther than this from the origin are moved out of view.
    pub clipping_radius: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: MAX_PLY_FILE_SIZE,
            clipping_radius: DEFAULT_CLIPPING_RADIUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterizerConfig {
    pub loader: LoaderConfig,
    /// Format of the targets passed to `render_for_camera`.
    pub color_format: wgpu::TextureFormat,
    pub depth_near: f32,
    pub depth_far: f32,
    /// `None` keeps the target contents; splats are composited in front of them.
    pub clear_color: Option<wgpu::Color>,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        Self {
            loader: LoaderConfig::default(),
            color_format: wgpu::TextureFormat::Rgba8UnormSrgb,
            depth_near: 0.1,
            depth_far: 1000.0,
            clear_color: Some(wgpu::Color::TRANSPARENT),
        }
    }
}
