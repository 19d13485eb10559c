//! Simulated GPU memory, queue and fence timeline.
//!
//! Everything the simulated GPU touches lives in one [`DeviceState`] behind a
//! `parking_lot::Mutex`, shared between the [`super::SoftwareDevice`] (the CPU
//! side) and any number of [`GpuTimeline`] handles (the GPU side).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::command::*;
use crate::backend::traits::*;
use crate::backend::types::*;

pub(crate) struct BufferRecord {
    pub label: String,
    pub heap: HeapType,
    pub data: Vec<u8>,
    pub state: ResourceState,
    pub address: GpuVirtualAddress,
}

pub(crate) struct TextureRecord {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub state: ResourceState,
}

impl TextureRecord {
    fn row_size(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel() as usize
    }
}

pub(crate) struct HeapRecord {
    pub info: DescriptorHeapInfo,
    pub slots: Vec<Option<ShaderResourceView>>,
}

pub(crate) enum QueueItem {
    Execute {
        id: u64,
        commands: Vec<Command>,
    },
    Signal(u64),
    Present {
        back_buffer: TextureHandle,
    },
}

/// Bindings in effect while one command list executes.
#[derive(Default)]
struct Bindings {
    heap: Option<DescriptorHeapHandle>,
    root_cbv: HashMap<u32, GpuVirtualAddress>,
    table: Option<GpuDescriptorHandle>,
    vertex: Option<VertexBufferView>,
    index: Option<IndexBufferView>,
    color: Option<TextureHandle>,
}

#[derive(Default)]
pub(crate) struct DeviceState {
    pub buffers: HashMap<BufferHandle, BufferRecord>,
    pub textures: HashMap<TextureHandle, TextureRecord>,
    pub address_map: BTreeMap<u64, BufferHandle>,
    pub heaps: Vec<HeapRecord>,
    pub queue: VecDeque<QueueItem>,
    pub completed: u64,
    /// Id of the last command list the GPU finished.
    pub executed_through: u64,
    pub submissions: Vec<Submission>,
    pub executed_draws: Vec<ExecutedDraw>,
    pub validation: Vec<String>,
    pub presents: u64,
    pub allocated_bytes: u64,
}

impl DeviceState {
    pub fn validation_error(&mut self, message: String) {
        log::error!("SoftwareDevice validation: {}", message);
        self.validation.push(message);
    }

    /// Buffer and byte offset that `address` points into.
    pub fn resolve_address(&self, address: GpuVirtualAddress) -> Option<(BufferHandle, u64)> {
        let (base, handle) = self.address_map.range(..=address.0).next_back()?;
        let buffer = self.buffers.get(handle)?;
        let offset = address.0 - base;
        (offset < buffer.data.len() as u64).then_some((*handle, offset))
    }

    /// Heap index and slot index of a CPU descriptor handle.
    pub fn resolve_cpu_descriptor(&self, handle: CpuDescriptorHandle) -> Option<(usize, usize)> {
        self.heaps.iter().enumerate().find_map(|(heap_index, heap)| {
            let start = heap.info.cpu_start.0;
            let increment = heap.info.increment as u64;
            let end = start + heap.info.capacity as u64 * increment;
            if handle.0 < start || handle.0 >= end || (handle.0 - start) % increment != 0 {
                return None;
            }
            Some((heap_index, ((handle.0 - start) / increment) as usize))
        })
    }

    /// Heap index and slot index of a GPU descriptor handle.
    pub fn resolve_gpu_descriptor(&self, handle: GpuDescriptorHandle) -> Option<(usize, usize)> {
        self.heaps.iter().enumerate().find_map(|(heap_index, heap)| {
            let start = heap.info.gpu_start?.0;
            let increment = heap.info.increment as u64;
            let end = start + heap.info.capacity as u64 * increment;
            if handle.0 < start || handle.0 >= end || (handle.0 - start) % increment != 0 {
                return None;
            }
            Some((heap_index, ((handle.0 - start) / increment) as usize))
        })
    }

    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        match resource {
            ResourceId::Buffer(b) => self.buffers.get(&b).map(|r| r.state),
            ResourceId::Texture(t) => self.textures.get(&t).map(|r| r.state),
        }
    }

    fn set_resource_state(&mut self, resource: ResourceId, state: ResourceState) {
        match resource {
            ResourceId::Buffer(b) => {
                if let Some(record) = self.buffers.get_mut(&b) {
                    record.state = state;
                }
            }
            ResourceId::Texture(t) => {
                if let Some(record) = self.textures.get_mut(&t) {
                    record.state = state;
                }
            }
        }
    }

    /// Whether queued, not yet executed work still uses `resource`.
    pub fn is_pending_use(&self, resource: ResourceId) -> bool {
        self.queue.iter().any(|item| match item {
            QueueItem::Execute { commands, .. } => commands.iter().any(|command| {
                command.names(resource)
                    || match (command.address(), resource) {
                        (Some(address), ResourceId::Buffer(buffer)) => self
                            .resolve_address(address)
                            .is_some_and(|(resolved, _)| resolved == buffer),
                        _ => false,
                    }
            }),
            QueueItem::Present { back_buffer } => resource == ResourceId::Texture(*back_buffer),
            QueueItem::Signal(_) => false,
        })
    }

    /// Execute the next queued item. Returns `false` when the queue is empty.
    pub fn retire_next(&mut self) -> bool {
        let Some(item) = self.queue.pop_front() else {
            return false;
        };
        match item {
            QueueItem::Execute { id, commands } => {
                let mut bindings = Bindings::default();
                for command in &commands {
                    self.execute(command, &mut bindings);
                }
                self.executed_through = id;
            }
            QueueItem::Signal(value) => {
                if value < self.completed {
                    self.validation_error(format!(
                        "fence signaled with {} after reaching {}",
                        value, self.completed
                    ));
                } else {
                    log::trace!("SoftwareDevice: fence reached {}", value);
                    self.completed = value;
                }
            }
            QueueItem::Present { back_buffer } => {
                let state = self.resource_state(ResourceId::Texture(back_buffer));
                if state != Some(ResourceState::Present) {
                    self.validation_error(format!(
                        "present of back buffer {:?} in state {:?}",
                        back_buffer, state
                    ));
                }
                self.presents += 1;
            }
        }
        true
    }

    /// Execute queued work until the fence reaches `value`. Returns whether it did.
    pub fn retire_through(&mut self, value: u64) -> bool {
        while self.completed < value {
            if !self.retire_next() {
                return false;
            }
        }
        true
    }

    fn expect_state(&mut self, resource: ResourceId, expected: ResourceState, action: &str) -> bool {
        match self.resource_state(resource) {
            Some(state) if state == expected => true,
            Some(state) => {
                self.validation_error(format!(
                    "{}: {:?} is in {:?}, expected {:?}",
                    action, resource, state, expected
                ));
                false
            }
            None => {
                self.validation_error(format!("{}: {:?} does not exist", action, resource));
                false
            }
        }
    }

    fn execute(&mut self, command: &Command, bindings: &mut Bindings) {
        match command {
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    self.expect_state(barrier.resource, barrier.before, "barrier");
                    self.set_resource_state(barrier.resource, barrier.after);
                }
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => self.copy_buffer_region(*dst, *dst_offset, *src, *src_offset, *size),
            Command::CopyBufferToTexture { dst, src, footprint } => {
                self.copy_buffer_to_texture(*dst, *src, footprint)
            }
            Command::CopyTextureToBuffer { dst, footprint, src } => {
                self.copy_texture_to_buffer(*dst, footprint, *src)
            }
            Command::SetDescriptorHeap(heap) => {
                let visible = self
                    .heaps
                    .iter()
                    .any(|h| h.info.heap == *heap && h.info.gpu_start.is_some());
                if !visible {
                    self.validation_error(format!("bound descriptor heap {:?} is not shader visible", heap));
                }
                bindings.heap = Some(*heap);
            }
            Command::SetRootConstantBufferView { root_index, address } => {
                if address.0 % CONSTANT_BUFFER_ALIGNMENT != 0 {
                    self.validation_error(format!("constant buffer view at unaligned address {:#x}", address.0));
                }
                bindings.root_cbv.insert(*root_index, *address);
            }
            Command::SetRootDescriptorTable { table, .. } => bindings.table = Some(*table),
            Command::SetVertexBuffer(view) => bindings.vertex = Some(*view),
            Command::SetIndexBuffer(view) => bindings.index = Some(*view),
            Command::SetViewport(_) | Command::SetScissorRect(_) => {}
            Command::SetRenderTargets { color, depth } => {
                self.expect_state(ResourceId::Texture(*color), ResourceState::RenderTarget, "set render target");
                if let Some(depth) = depth {
                    self.expect_state(ResourceId::Texture(*depth), ResourceState::DepthWrite, "set depth target");
                }
                bindings.color = Some(*color);
            }
            Command::ClearRenderTarget { target, color } => {
                if self.expect_state(ResourceId::Texture(*target), ResourceState::RenderTarget, "clear") {
                    if let Some(texture) = self.textures.get_mut(target) {
                        let texel = encode_color(texture.format, *color);
                        for chunk in texture.data.chunks_exact_mut(4) {
                            chunk.copy_from_slice(&texel);
                        }
                    }
                }
            }
            Command::ClearDepth { target, depth } => {
                if self.expect_state(ResourceId::Texture(*target), ResourceState::DepthWrite, "clear depth") {
                    let format = self.textures.get(target).map(|texture| texture.format);
                    if format.is_some_and(|format| !format.is_depth()) {
                        self.validation_error(format!("clear depth: {:?} is {:?}", target, format));
                    } else if let Some(texture) = self.textures.get_mut(target) {
                        let texel = depth.to_le_bytes();
                        for chunk in texture.data.chunks_exact_mut(4) {
                            chunk.copy_from_slice(&texel);
                        }
                    }
                }
            }
            Command::DrawIndexed {
                index_count,
                start_index,
                ..
            } => self.draw(*index_count, *start_index, bindings),
        }
    }

    fn copy_buffer_region(&mut self, dst: BufferHandle, dst_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        let Some(source) = self.buffers.get(&src) else {
            self.validation_error(format!("copy from destroyed buffer {:?}", src));
            return;
        };
        if source.heap != HeapType::Upload && source.state != ResourceState::CopySource {
            let state = source.state;
            self.validation_error(format!("copy source {:?} is in {:?}", src, state));
            return;
        }
        let end = src_offset + size;
        if end > source.data.len() as u64 {
            self.validation_error(format!("copy reads past the end of {:?}", src));
            return;
        }
        let bytes = source.data[src_offset as usize..end as usize].to_vec();

        if !self.expect_state(ResourceId::Buffer(dst), ResourceState::CopyDest, "copy buffer") {
            return;
        }
        let Some(target) = self.buffers.get_mut(&dst) else {
            return;
        };
        let end = dst_offset + size;
        if end > target.data.len() as u64 {
            self.validation_error(format!("copy writes past the end of {:?}", dst));
            return;
        }
        target.data[dst_offset as usize..end as usize].copy_from_slice(&bytes);
    }

    fn copy_buffer_to_texture(&mut self, dst: TextureHandle, src: BufferHandle, footprint: &TextureFootprint) {
        if footprint.row_pitch % TEXTURE_DATA_PITCH_ALIGNMENT != 0 {
            self.validation_error(format!("row pitch {} is not aligned", footprint.row_pitch));
            return;
        }
        let Some(source) = self.buffers.get(&src) else {
            self.validation_error(format!("copy from destroyed buffer {:?}", src));
            return;
        };
        if footprint.offset + footprint.total_size() > source.data.len() as u64 {
            let message = format!("footprint exceeds staging buffer {}", source.label);
            self.validation_error(message);
            return;
        }
        let rows: Vec<Vec<u8>> = (0..footprint.height as u64)
            .map(|row| {
                let start = (footprint.offset + row * footprint.row_pitch as u64) as usize;
                source.data[start..start + footprint.packed_row_size() as usize].to_vec()
            })
            .collect();

        if !self.expect_state(ResourceId::Texture(dst), ResourceState::CopyDest, "copy to texture") {
            return;
        }
        let Some(texture) = self.textures.get_mut(&dst) else {
            return;
        };
        if texture.width != footprint.width
            || texture.height != footprint.height
            || texture.format.bytes_per_pixel() != footprint.format.bytes_per_pixel()
        {
            let message = format!(
                "footprint {}x{} does not match texture {} ({}x{})",
                footprint.width, footprint.height, texture.label, texture.width, texture.height
            );
            self.validation_error(message);
            return;
        }
        let row_size = texture.row_size();
        for (row, bytes) in rows.iter().enumerate() {
            texture.data[row * row_size..(row + 1) * row_size].copy_from_slice(bytes);
        }
    }

    fn copy_texture_to_buffer(&mut self, dst: BufferHandle, footprint: &TextureFootprint, src: TextureHandle) {
        if !self.expect_state(ResourceId::Texture(src), ResourceState::CopySource, "copy from texture") {
            return;
        }
        let Some(texture) = self.textures.get(&src) else {
            return;
        };
        let row_size = texture.row_size();
        let rows: Vec<Vec<u8>> = texture.data.chunks_exact(row_size).map(<[u8]>::to_vec).collect();

        if !self.expect_state(ResourceId::Buffer(dst), ResourceState::CopyDest, "copy to buffer") {
            return;
        }
        let Some(target) = self.buffers.get_mut(&dst) else {
            return;
        };
        if footprint.offset + footprint.total_size() > target.data.len() as u64 {
            let message = format!("footprint exceeds readback buffer {}", target.label);
            self.validation_error(message);
            return;
        }
        for (row, bytes) in rows.iter().enumerate() {
            let start = (footprint.offset + row as u64 * footprint.row_pitch as u64) as usize;
            target.data[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    fn read_constants(&mut self, bindings: &Bindings, root_index: u32, size: usize) -> Vec<u8> {
        let Some(address) = bindings.root_cbv.get(&root_index) else {
            self.validation_error(format!("draw without a constant buffer at root {}", root_index));
            return Vec::new();
        };
        let Some((buffer, offset)) = self.resolve_address(*address) else {
            self.validation_error(format!("constant buffer address {:#x} is not mapped", address.0));
            return Vec::new();
        };
        let record = &self.buffers[&buffer];
        let start = offset as usize;
        let end = (start + size).min(record.data.len());
        record.data[start..end].to_vec()
    }

    fn bound_buffer(&mut self, address: Option<GpuVirtualAddress>, expected: ResourceState, what: &str) -> Option<BufferHandle> {
        let Some(address) = address else {
            self.validation_error(format!("draw without {}", what));
            return None;
        };
        let Some((buffer, _)) = self.resolve_address(address) else {
            self.validation_error(format!("{} address {:#x} is not mapped", what, address.0));
            return None;
        };
        self.expect_state(ResourceId::Buffer(buffer), expected, what);
        Some(buffer)
    }

    fn check_material_table(&mut self, bindings: &Bindings) {
        let Some(table) = bindings.table else {
            self.validation_error("draw without a material descriptor table".to_string());
            return;
        };
        let Some((heap_index, first)) = self.resolve_gpu_descriptor(table) else {
            self.validation_error(format!("descriptor table {:#x} is not in any heap", table.0));
            return;
        };
        if bindings.heap != Some(self.heaps[heap_index].info.heap) {
            self.validation_error("descriptor table is not in the bound heap".to_string());
        }
        let last = first + root::MATERIAL_TABLE_SIZE as usize;
        if last > self.heaps[heap_index].slots.len() {
            self.validation_error("descriptor table runs past the end of its heap".to_string());
            return;
        }
        let views: Vec<Option<ShaderResourceView>> = self.heaps[heap_index].slots[first..last].to_vec();
        for (channel, view) in views.into_iter().enumerate() {
            match view {
                None => self.validation_error(format!("descriptor table slot {} is empty", channel)),
                Some(view) => {
                    self.expect_state(
                        ResourceId::Texture(view.texture),
                        ResourceState::PixelShaderResource,
                        "sample texture",
                    );
                }
            }
        }
    }

    fn draw(&mut self, index_count: u32, start_index: u32, bindings: &Bindings) {
        let vertex_buffer = self.bound_buffer(
            bindings.vertex.map(|v| v.location),
            ResourceState::VertexOrConstant,
            "vertex buffer",
        );
        let index_buffer = self.bound_buffer(
            bindings.index.map(|v| v.location),
            ResourceState::IndexBuffer,
            "index buffer",
        );
        if let Some(view) = bindings.index {
            let available = view.size as u64 / view.format.size();
            if start_index as u64 + index_count as u64 > available {
                self.validation_error(format!(
                    "draw reads {} indices from {} but the view holds {}",
                    index_count, start_index, available
                ));
            }
        }
        self.check_material_table(bindings);
        if bindings.color.is_none() {
            self.validation_error("draw without a render target".to_string());
        }
        let frame_constants = self.read_constants(
            bindings,
            root::FRAME_CONSTANTS,
            std::mem::size_of::<FrameConstants>(),
        );
        let mesh_constants = self.read_constants(
            bindings,
            root::MESH_CONSTANTS,
            std::mem::size_of::<MeshConstants>(),
        );
        self.executed_draws.push(ExecutedDraw {
            index_count,
            vertex_buffer,
            index_buffer,
            material_table: bindings.table,
            frame_constants,
            mesh_constants,
            render_target: bindings.color,
        });
    }
}

fn encode_color(format: TextureFormat, color: [f32; 4]) -> [u8; 4] {
    let [r, g, b, a] = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    match format {
        TextureFormat::Bgra8Unorm => [b, g, r, a],
        _ => [r, g, b, a],
    }
}

/// Handle to the simulated GPU timeline of a [`super::SoftwareDevice`].
///
/// Cloneable and `Send`; tests keep one to observe or drive GPU progress while
/// the device itself is owned elsewhere.
#[derive(Clone)]
pub struct GpuTimeline {
    pub(crate) state: Arc<Mutex<DeviceState>>,
}

impl GpuTimeline {
    /// Last fence value the simulated GPU reached.
    pub fn completed_value(&self) -> u64 {
        self.state.lock().completed
    }

    /// Queue items (command lists, signals, presents) not yet executed.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Execute the next queued item. Returns `false` when idle.
    pub fn retire_next(&self) -> bool {
        self.state.lock().retire_next()
    }

    /// Execute all queued work. Returns how many items ran.
    pub fn retire_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.retire_next() {
            count += 1;
        }
        count
    }

    /// Execute queued work until the fence reaches `value`.
    pub fn retire_through(&self, value: u64) -> bool {
        self.state.lock().retire_through(value)
    }
}

impl std::fmt::Debug for GpuTimeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GpuTimeline")
            .field("completed", &state.completed)
            .field("pending", &state.queue.len())
            .finish()
    }
}
