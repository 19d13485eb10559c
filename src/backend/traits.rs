//! Core device abstraction traits
//!
//! The viewer core records work through [`GpuDevice`]: explicit heaps, explicit
//! resource-state barriers, descriptor heaps addressed by handle arithmetic and a
//! monotonic fence. The software device in [`super::software`] implements it on
//! the CPU.

use crate::backend::types::*;
use std::time::Duration;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create resource: {0}")]
    ResourceCreationFailed(String),
    #[error("Failed to map buffer: {0}")]
    MapFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Device lost: {0}")]
    DeviceLost(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub(crate) u64);

/// GPU virtual address of a byte inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuVirtualAddress(pub u64);

impl GpuVirtualAddress {
    pub fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// CPU-side descriptor handle, used to write descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    /// Handle `index` slots past this one.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + index as u64 * increment as u64)
    }
}

/// GPU-side descriptor handle, used to bind descriptor tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    /// Handle `index` slots past this one.
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + index as u64 * increment as u64)
    }
}

/// Either kind of resource, for barriers and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// Resource barrier for state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl ResourceBarrier {
    pub fn buffer(buffer: BufferHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: ResourceId::Buffer(buffer),
            before,
            after,
        }
    }

    pub fn texture(texture: TextureHandle, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: ResourceId::Texture(texture),
            before,
            after,
        }
    }
}

/// Descriptor heap descriptor
#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    pub label: Option<String>,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Base handles and geometry of a created descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub heap: DescriptorHeapHandle,
    pub cpu_start: CpuDescriptorHandle,
    /// `None` for heaps that are not shader visible.
    pub gpu_start: Option<GpuDescriptorHandle>,
    pub increment: u32,
    pub capacity: u32,
}

/// Vertex buffer view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub location: GpuVirtualAddress,
    pub size: u32,
    pub stride: u32,
}

/// Index buffer view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub location: GpuVirtualAddress,
    pub size: u32,
    pub format: IndexFormat,
}

/// Root parameter slots of the viewer's root signature
pub mod root {
    /// Per-frame constant buffer (b0).
    pub const FRAME_CONSTANTS: u32 = 0;
    /// Per-draw constant buffer (b1).
    pub const MESH_CONSTANTS: u32 = 1;
    /// Material texture table (t0..t27).
    pub const MATERIAL_TABLE: u32 = 2;
    /// Descriptors in the material texture table.
    pub const MATERIAL_TABLE_SIZE: u32 = 28;
}

/// Low-level device the viewer core records work through
pub trait GpuDevice {
    /// Human-readable device name
    fn name(&self) -> &str;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a 2D texture in the default heap
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Copy `data` into a CPU-visible buffer at `offset`
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Read `len` bytes from a CPU-visible buffer at `offset`
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> BackendResult<Vec<u8>>;

    /// GPU virtual address of the first byte of `buffer`
    fn buffer_gpu_address(&self, buffer: BufferHandle) -> BackendResult<GpuVirtualAddress>;

    // Descriptors

    /// Create a descriptor heap
    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapInfo>;

    /// Write a shader resource view of `texture` into `dest`
    fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        format: TextureFormat,
        dest: CpuDescriptorHandle,
    ) -> BackendResult<()>;

    /// Copy one descriptor from `src` to `dest`
    fn copy_descriptor(
        &mut self,
        dest: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
    ) -> BackendResult<()>;

    // Command recording and execution

    /// Reset the command allocator of ring slot `allocator` and open the command list
    fn reset_command_list(&mut self, allocator: usize) -> BackendResult<()>;

    /// Record resource barriers
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);

    /// Record a buffer-to-buffer copy
    fn copy_buffer_region(
        &mut self,
        dst: BufferHandle,
        dst_offset: u64,
        src: BufferHandle,
        src_offset: u64,
        size: u64,
    );

    /// Record a copy from a buffer footprint into a texture
    fn copy_buffer_to_texture(
        &mut self,
        dst: TextureHandle,
        src: BufferHandle,
        footprint: TextureFootprint,
    );

    /// Record a copy from a texture into a buffer footprint
    fn copy_texture_to_buffer(
        &mut self,
        dst: BufferHandle,
        footprint: TextureFootprint,
        src: TextureHandle,
    );

    /// Bind the shader-visible descriptor heap
    fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    /// Bind a constant buffer view at a root parameter
    fn set_graphics_root_constant_buffer_view(&mut self, root_index: u32, address: GpuVirtualAddress);

    /// Bind a descriptor table at a root parameter
    fn set_graphics_root_descriptor_table(&mut self, root_index: u32, table: GpuDescriptorHandle);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, view: VertexBufferView);

    /// Set index buffer
    fn set_index_buffer(&mut self, view: IndexBufferView);

    /// Set viewport
    fn set_viewport(&mut self, viewport: Viewport);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, rect: ScissorRect);

    /// Clear a render target
    fn clear_render_target(&mut self, target: TextureHandle, color: [f32; 4]);

    /// Clear a depth buffer
    fn clear_depth(&mut self, target: TextureHandle, depth: f32);

    /// Bind render and depth targets
    fn set_render_targets(&mut self, color: TextureHandle, depth: Option<TextureHandle>);

    /// Draw indexed primitives
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    );

    /// Close the command list and submit it to the queue
    fn close_and_execute(&mut self) -> BackendResult<()>;

    /// Close the command list without submitting anything it recorded
    fn discard_command_list(&mut self);

    // Fence

    /// Queue a fence signal of `value` after all submitted work
    fn signal(&mut self, value: u64) -> BackendResult<()>;

    /// Last fence value the GPU has reached
    fn completed_value(&self) -> u64;

    /// Block until the fence reaches `value`; a timeout means the device is lost
    fn wait_for_value(&mut self, value: u64, timeout: Duration) -> BackendResult<()>;

    // Swap chain

    /// Recreate the swap chain back buffers
    fn resize_swap_chain(&mut self, width: u32, height: u32, buffer_count: u32) -> BackendResult<()>;

    /// Index of the back buffer the next frame renders into
    fn current_back_buffer_index(&self) -> u32;

    /// Back buffer texture at `index`
    fn back_buffer(&self, index: u32) -> BackendResult<TextureHandle>;

    /// Queue a present of the current back buffer
    fn present(&mut self) -> BackendResult<()>;

    // Resource cleanup

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);
}
