//! Recorded commands and execution records of the software device.

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command recorded into the software command list.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Vec<ResourceBarrier>),
    CopyBufferRegion {
        dst: BufferHandle,
        dst_offset: u64,
        src: BufferHandle,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: TextureHandle,
        src: BufferHandle,
        footprint: TextureFootprint,
    },
    CopyTextureToBuffer {
        dst: BufferHandle,
        footprint: TextureFootprint,
        src: TextureHandle,
    },
    SetDescriptorHeap(DescriptorHeapHandle),
    SetRootConstantBufferView {
        root_index: u32,
        address: GpuVirtualAddress,
    },
    SetRootDescriptorTable {
        root_index: u32,
        table: GpuDescriptorHandle,
    },
    SetVertexBuffer(VertexBufferView),
    SetIndexBuffer(IndexBufferView),
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetRenderTargets {
        color: TextureHandle,
        depth: Option<TextureHandle>,
    },
    ClearRenderTarget {
        target: TextureHandle,
        color: [f32; 4],
    },
    ClearDepth {
        target: TextureHandle,
        depth: f32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
}

impl Command {
    /// Short name used in logs and ordering assertions.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Barrier(_) => CommandKind::Barrier,
            Command::CopyBufferRegion { .. }
            | Command::CopyBufferToTexture { .. }
            | Command::CopyTextureToBuffer { .. } => CommandKind::Copy,
            Command::SetDescriptorHeap(_)
            | Command::SetRootConstantBufferView { .. }
            | Command::SetRootDescriptorTable { .. }
            | Command::SetVertexBuffer(_)
            | Command::SetIndexBuffer(_)
            | Command::SetViewport(_)
            | Command::SetScissorRect(_)
            | Command::SetRenderTargets { .. } => CommandKind::State,
            Command::ClearRenderTarget { .. } | Command::ClearDepth { .. } => CommandKind::Clear,
            Command::DrawIndexed { .. } => CommandKind::Draw,
        }
    }

    /// Whether the command names `resource` directly (addresses are not resolved here).
    pub fn names(&self, resource: ResourceId) -> bool {
        match (self, resource) {
            (Command::Barrier(barriers), _) => barriers.iter().any(|b| b.resource == resource),
            (Command::CopyBufferRegion { dst, src, .. }, ResourceId::Buffer(b)) => *dst == b || *src == b,
            (Command::CopyBufferToTexture { src, .. }, ResourceId::Buffer(b)) => *src == b,
            (Command::CopyBufferToTexture { dst, .. }, ResourceId::Texture(t)) => *dst == t,
            (Command::CopyTextureToBuffer { dst, .. }, ResourceId::Buffer(b)) => *dst == b,
            (Command::CopyTextureToBuffer { src, .. }, ResourceId::Texture(t)) => *src == t,
            (Command::SetRenderTargets { color, depth }, ResourceId::Texture(t)) => {
                *color == t || *depth == Some(t)
            }
            (Command::ClearRenderTarget { target, .. }, ResourceId::Texture(t))
            | (Command::ClearDepth { target, .. }, ResourceId::Texture(t)) => *target == t,
            _ => false,
        }
    }

    /// GPU address the command reads through a view, if any.
    pub fn address(&self) -> Option<GpuVirtualAddress> {
        match self {
            Command::SetRootConstantBufferView { address, .. } => Some(*address),
            Command::SetVertexBuffer(view) => Some(view.location),
            Command::SetIndexBuffer(view) => Some(view.location),
            _ => None,
        }
    }
}

/// Coarse command category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Barrier,
    Copy,
    State,
    Clear,
    Draw,
}

/// A command list as it was submitted to the queue.
#[derive(Debug, Clone)]
pub struct Submission {
    pub allocator: usize,
    pub commands: Vec<Command>,
}

impl Submission {
    /// Barriers of this submission, flattened in recording order.
    pub fn barriers(&self) -> impl Iterator<Item = &ResourceBarrier> {
        self.commands.iter().flat_map(|c| match c {
            Command::Barrier(b) => b.as_slice(),
            _ => &[][..],
        })
    }

    /// Command kinds in recording order.
    pub fn kinds(&self) -> Vec<CommandKind> {
        self.commands.iter().map(Command::kind).collect()
    }
}

/// What a draw observed when the simulated GPU executed it.
#[derive(Debug, Clone)]
pub struct ExecutedDraw {
    pub index_count: u32,
    pub vertex_buffer: Option<BufferHandle>,
    pub index_buffer: Option<BufferHandle>,
    pub material_table: Option<GpuDescriptorHandle>,
    /// Bytes at the frame constant address at execution time.
    pub frame_constants: Vec<u8>,
    /// Bytes at the mesh constant address at execution time.
    pub mesh_constants: Vec<u8>,
    pub render_target: Option<TextureHandle>,
}

impl ExecutedDraw {
    pub fn decode_mesh_constants(&self) -> Option<MeshConstants> {
        (self.mesh_constants.len() >= std::mem::size_of::<MeshConstants>()).then(|| {
            bytemuck::pod_read_unaligned(&self.mesh_constants[..std::mem::size_of::<MeshConstants>()])
        })
    }

    pub fn decode_frame_constants(&self) -> Option<FrameConstants> {
        (self.frame_constants.len() >= std::mem::size_of::<FrameConstants>()).then(|| {
            bytemuck::pod_read_unaligned(&self.frame_constants[..std::mem::size_of::<FrameConstants>()])
        })
    }
}

/// A shader resource view written into a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceView {
    pub texture: TextureHandle,
    pub format: TextureFormat,
}
