//! Error types for the viewer core.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors reported by the viewer core.
///
/// Structural failures (handles, allocator exhaustion, fence errors) propagate
/// to the caller. Per-texture decode failures never surface here: they are
/// logged and the channel falls back to the placeholder image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewerError {
    #[error("Failed to create GPU resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Failed to map buffer: {0}")]
    MapFailed(String),
    #[error("Descriptor table exhausted: requested {requested}, {available} free")]
    OutOfSlots { requested: u32, available: u32 },
    #[error("No run of {requested} contiguous descriptor slots ({available} free)")]
    NoContiguousRun { requested: u32, available: u32 },
    #[error("Invalid descriptor handle: {0}")]
    InvalidHandle(String),
    #[error("Descriptor index {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: u64, capacity: u32 },
    #[error("Degenerate transform: {0}")]
    DegenerateTransform(String),
    #[error("Scene has {count} meshes, limit is {limit}")]
    TooManyMeshes { count: usize, limit: usize },
    #[error("Invalid texture: {0}")]
    InvalidTexture(String),
    #[error("No CPU-side resources to release: {0}")]
    NoCpuResource(String),
    #[error("No GPU-side resources to release: {0}")]
    NoGpuResource(String),
    #[error("Device lost: {0}")]
    DeviceLost(String),
    #[error("Failed to load scene: {0}")]
    SceneLoad(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type ViewerResult<T> = Result<T, ViewerError>;

impl From<BackendError> for ViewerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ResourceCreationFailed(msg) => ViewerError::ResourceCreationFailed(msg),
            BackendError::MapFailed(msg) => ViewerError::MapFailed(msg),
            BackendError::InvalidHandle(msg) => ViewerError::InvalidHandle(msg),
            BackendError::DeviceLost(msg) => ViewerError::DeviceLost(msg),
            BackendError::InvalidOperation(msg) => ViewerError::InvalidOperation(msg),
        }
    }
}
