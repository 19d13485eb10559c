//! Device abstraction layer
//!
//! Provides the [`GpuDevice`] trait the viewer core records through and the
//! software device that implements it without GPU hardware.

pub mod software;
pub mod traits;
pub mod types;

pub use software::{ExecutionMode, GpuTimeline, SoftwareDevice};
pub use traits::*;
pub use types::*;
