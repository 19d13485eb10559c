//! Model Viewer - descriptor-table model viewer core
//!
//! Loads a mesh/material scene, uploads it to device-local memory through
//! staging buffers and renders it every frame with a perspective camera and a
//! directional light.
//!
//! # Features
//! - Free-list descriptor allocator with contiguous multi-slot ranges
//! - Two-phase (CPU staging, then GPU copy) uploads with batched barriers
//! - Frame ring gated by a monotonic fence
//! - 28-channel materials whose unused channels sample a fallback checkerboard
//! - Software device for headless runs and tests

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod sync;
pub mod upload;
pub mod viewer;

use std::time::Duration;

pub use error::{ViewerError, ViewerResult};
pub use viewer::Viewer;

/// Configuration for initializing the viewer
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window title
    pub title: String,
    /// Initial width
    pub width: u32,
    /// Initial height
    pub height: u32,
    /// Size used while full screen
    pub full_screen_width: u32,
    pub full_screen_height: u32,
    /// Frames in flight, and the number of swap chain buffers
    pub ring_depth: usize,
    /// Meshes across all loaded models
    pub max_meshes: usize,
    /// Back buffer clear color
    pub clear_color: [f32; 4],
    /// Fence waits longer than this count as device loss
    pub fence_timeout: Duration,
    /// Model spin about the vertical axis, in radians per second
    pub spin_rate: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "Model Viewer".to_string(),
            width: 1280,
            height: 720,
            full_screen_width: 1920,
            full_screen_height: 1080,
            ring_depth: 2,
            max_meshes: 64,
            clear_color: [0.18, 0.2, 0.41, 1.0],
            fence_timeout: sync::FrameSync::DEFAULT_TIMEOUT,
            spin_rate: 0.5,
        }
    }
}
