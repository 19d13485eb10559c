//! Common types shared by the device layer and the resource sets

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Row pitch alignment required for buffer <-> texture copies.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;

/// Placement alignment of a constant buffer view.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Align `value` up to the next multiple of `alignment` (which must be a power of two).
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, TextureFormat::Rgba8UnormSrgb)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Depth32Float => 4,
        }
    }
}

/// Memory heap a buffer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// Device-local memory, not CPU-visible.
    Default,
    /// CPU-writable, GPU-readable staging memory.
    Upload,
    /// GPU-writable, CPU-readable memory.
    Readback,
}

impl HeapType {
    pub fn is_cpu_visible(&self) -> bool {
        !matches!(self, HeapType::Default)
    }
}

/// Usage state of a GPU resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    CopyDest,
    CopySource,
    GenericRead,
    VertexOrConstant,
    IndexBuffer,
    PixelShaderResource,
    DepthWrite,
    RenderTarget,
    Present,
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub heap: HeapType,
    pub initial_state: ResourceState,
}

impl BufferDescriptor {
    /// Device-local buffer starting in `Common`.
    pub fn device_local(label: &str, size: u64) -> Self {
        Self {
            label: Some(label.to_string()),
            size,
            heap: HeapType::Default,
            initial_state: ResourceState::Common,
        }
    }

    /// Upload-heap buffer, which is always in `GenericRead`.
    pub fn upload(label: &str, size: u64) -> Self {
        Self {
            label: Some(label.to_string()),
            size,
            heap: HeapType::Upload,
            initial_state: ResourceState::GenericRead,
        }
    }

    /// Readback-heap buffer, which is always a copy destination.
    pub fn readback(label: &str, size: u64) -> Self {
        Self {
            label: Some(label.to_string()),
            size,
            heap: HeapType::Readback,
            initial_state: ResourceState::CopyDest,
        }
    }
}

/// Texture descriptor (2D, single mip)
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub initial_state: ResourceState,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8Unorm,
            initial_state: ResourceState::Common,
        }
    }
}

/// Placement of a 2D texture image inside a linear buffer.
///
/// Rows start every `row_pitch` bytes. Only the first `width * bpp` bytes of
/// each row carry texels; the rest of the pitch is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFootprint {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
    pub format: TextureFormat,
}

impl TextureFootprint {
    /// Footprint with the row pitch rounded up to [`TEXTURE_DATA_PITCH_ALIGNMENT`].
    pub fn aligned(width: u32, height: u32, format: TextureFormat) -> Self {
        let packed = width as u64 * format.bytes_per_pixel() as u64;
        Self {
            offset: 0,
            width,
            height,
            row_pitch: align_up(packed, TEXTURE_DATA_PITCH_ALIGNMENT as u64) as u32,
            format,
        }
    }

    /// Bytes of texel data in one row, without padding.
    pub fn packed_row_size(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    /// Bytes the footprint covers in the buffer.
    pub fn total_size(&self) -> u64 {
        self.row_pitch as u64 * self.height as u64
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Viewport in render target pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }
}

/// Mesh vertex with position, normal, UV, tangent and bitangent
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec3,
    pub bitangent: Vec3,
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Per-frame constants bound at root parameter 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameConstants {
    pub view: Mat4,
    pub projection: Mat4,
    pub light_direction: Vec4,
    pub light_color: Vec4,
}

/// Per-draw constants bound at root parameter 1
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshConstants {
    pub world: Mat4,
    pub normal_matrix: Mat4,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub opacity: f32,
    pub texture_flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_footprint_pads_rows() {
        let footprint = TextureFootprint::aligned(3, 2, TextureFormat::Rgba8Unorm);
        assert_eq!(footprint.packed_row_size(), 12);
        assert_eq!(footprint.row_pitch, 256);
        assert_eq!(footprint.total_size(), 512);

        let exact = TextureFootprint::aligned(64, 4, TextureFormat::Rgba8UnormSrgb);
        assert_eq!(exact.row_pitch, 256);
        assert_eq!(exact.total_size(), 1024);
    }

    #[test]
    fn test_constants_fit_one_cbv() {
        assert!(std::mem::size_of::<FrameConstants>() as u64 <= CONSTANT_BUFFER_ALIGNMENT);
        assert!(std::mem::size_of::<MeshConstants>() as u64 <= CONSTANT_BUFFER_ALIGNMENT);
    }
}
