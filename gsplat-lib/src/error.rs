use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SplatError>;

#[derive(Debug, Error)]
pub enum SplatError {
    #[error("File {0:?} does not exist")]
    FileNotFound(PathBuf),

    #[error("PLY files of {size} bytes are not supported, the limit is {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Failed to parse the PLY header: {0}")]
    ParseHeader(String),

    #[error("Splat record size mismatch, we expect {expected} bytes, file has {found}")]
    StrideMismatch { expected: usize, found: usize },

    #[error("Read error, expected {expected} data bytes got {found}")]
    Truncated { expected: usize, found: usize },

    #[error("No suitable GPU adapter found: {0}")]
    NoAdapter(String),

    #[error("Failed to request a GPU device: {0}")]
    RequestDevice(String),

    #[error("Buffer '{label}' needs {size} bytes, the device allows {limit}")]
    BufferTooLarge {
        label: &'static str,
        size: u64,
        limit: u64,
    },

    #[error("Render target format {found:?} does not match the pipeline format {expected:?}")]
    TargetFormat {
        expected: wgpu::TextureFormat,
        found: wgpu::TextureFormat,
    },

    #[error("Failed to read back GPU buffer: {0}")]
    BufferMap(String),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}
