//! Software GPU device for headless runs and testing.
//!
//! The device simulates a GPU on the CPU: buffers and textures have real byte
//! storage, copies move real data, every barrier is checked against the tracked
//! state of its resource, and submitted work runs on a simulated timeline.
//!
//! In [`ExecutionMode::Immediate`] work executes as soon as it is queued. In
//! [`ExecutionMode::Deferred`] it stays queued until a fence wait needs it or a
//! [`GpuTimeline`] handle retires it, which lets tests observe the CPU running
//! ahead of the GPU.
//!
//! Misuse the real API would reject (wrong `before` state, resetting a command
//! allocator whose work is still queued, destroying a resource queued work
//! still reads) is recorded as a validation message and logged at `error`.

mod command;
mod state;

pub use command::{Command, CommandKind, ExecutedDraw, ShaderResourceView, Submission};
pub use state::GpuTimeline;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;
use state::{BufferRecord, DeviceState, HeapRecord, QueueItem, TextureRecord};

/// Descriptor handle increment reported by the software device.
pub const DESCRIPTOR_INCREMENT: u32 = 32;

/// Largest texture dimension the software device accepts.
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;

const BUFFER_PLACEMENT: u64 = 64 * 1024;

/// When queued GPU work executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Execute on submission.
    #[default]
    Immediate,
    /// Execute only when a fence wait or a timeline handle asks for it.
    Deferred,
}

struct Recording {
    allocator: usize,
    commands: Vec<Command>,
}

#[derive(Default)]
struct SwapChain {
    width: u32,
    height: u32,
    back_buffers: Vec<TextureHandle>,
    index: u32,
}

/// Software GPU device.
pub struct SoftwareDevice {
    name: String,
    mode: ExecutionMode,
    state: Arc<Mutex<DeviceState>>,
    recording: Option<Recording>,
    allocator_last_submission: HashMap<usize, u64>,
    next_submission: u64,
    next_handle: u64,
    next_address: u64,
    memory_budget: Option<u64>,
    swap_chain: SwapChain,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(ExecutionMode::Immediate)
    }
}

impl SoftwareDevice {
    /// Create a new software device.
    pub fn new(mode: ExecutionMode) -> Self {
        log::debug!("SoftwareDevice: created ({:?} execution)", mode);
        Self {
            name: "Software Device".to_string(),
            mode,
            state: Arc::new(Mutex::new(DeviceState::default())),
            recording: None,
            allocator_last_submission: HashMap::new(),
            next_submission: 0,
            next_handle: 1,
            next_address: BUFFER_PLACEMENT,
            memory_budget: None,
            swap_chain: SwapChain::default(),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Handle to the simulated GPU timeline.
    pub fn timeline(&self) -> GpuTimeline {
        GpuTimeline {
            state: Arc::clone(&self.state),
        }
    }

    /// Limit the bytes of buffer and texture storage; creation beyond it fails.
    pub fn set_memory_budget(&mut self, budget: Option<u64>) {
        self.memory_budget = budget;
    }

    /// Command lists submitted so far, in submission order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Draws the simulated GPU has executed, in execution order.
    pub fn executed_draws(&self) -> Vec<ExecutedDraw> {
        self.state.lock().executed_draws.clone()
    }

    /// Validation messages recorded so far.
    pub fn validation_messages(&self) -> Vec<String> {
        self.state.lock().validation.clone()
    }

    /// Number of presents the simulated GPU has executed.
    pub fn presents(&self) -> u64 {
        self.state.lock().presents
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_texture_count(&self) -> usize {
        self.state.lock().textures.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated_bytes
    }

    pub fn buffer_exists(&self, buffer: BufferHandle) -> bool {
        self.state.lock().buffers.contains_key(&buffer)
    }

    pub fn texture_exists(&self, texture: TextureHandle) -> bool {
        self.state.lock().textures.contains_key(&texture)
    }

    /// State the simulated GPU last left `resource` in.
    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.state.lock().resource_state(resource)
    }

    /// Tightly packed contents of a texture.
    pub fn texture_data(&self, texture: TextureHandle) -> Option<Vec<u8>> {
        self.state.lock().textures.get(&texture).map(|t| t.data.clone())
    }

    /// Contents of the descriptor slot at `handle`.
    pub fn descriptor(&self, handle: CpuDescriptorHandle) -> Option<ShaderResourceView> {
        let state = self.state.lock();
        let (heap, slot) = state.resolve_cpu_descriptor(handle)?;
        state.heaps[heap].slots[slot]
    }

    /// Contents of the shader-visible descriptor slot at `handle`.
    pub fn descriptor_at_gpu(&self, handle: GpuDescriptorHandle) -> Option<ShaderResourceView> {
        let state = self.state.lock();
        let (heap, slot) = state.resolve_gpu_descriptor(handle)?;
        state.heaps[heap].slots[slot]
    }

    /// Current swap chain size.
    pub fn swap_chain_size(&self) -> (u32, u32) {
        (self.swap_chain.width, self.swap_chain.height)
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn reserve(&self, state: &DeviceState, bytes: u64, label: &str) -> BackendResult<()> {
        match self.memory_budget {
            Some(budget) if state.allocated_bytes + bytes > budget => {
                Err(BackendError::ResourceCreationFailed(format!(
                    "{}: {} bytes exceed the remaining budget of {}",
                    label,
                    bytes,
                    budget.saturating_sub(state.allocated_bytes)
                )))
            }
            _ => Ok(()),
        }
    }

    fn record(&mut self, command: Command) {
        match self.recording.as_mut() {
            Some(recording) => recording.commands.push(command),
            None => self
                .state
                .lock()
                .validation_error(format!("{:?} recorded with no open command list", command.kind())),
        }
    }

    fn enqueue(&mut self, item: QueueItem) {
        let mut state = self.state.lock();
        state.queue.push_back(item);
        if self.mode == ExecutionMode::Immediate {
            while state.retire_next() {}
        }
    }

    fn destroy_resource(&mut self, resource: ResourceId) {
        let mut state = self.state.lock();
        if state.is_pending_use(resource) {
            state.validation_error(format!("{:?} destroyed while queued work still uses it", resource));
        }
        let freed = match resource {
            ResourceId::Buffer(buffer) => state.buffers.remove(&buffer).map(|record| {
                log::trace!("SoftwareDevice: destroying buffer {}", record.label);
                record.data.len() as u64
            }),
            ResourceId::Texture(texture) => state.textures.remove(&texture).map(|record| {
                log::trace!("SoftwareDevice: destroying texture {}", record.label);
                record.data.len() as u64
            }),
        };
        match freed {
            Some(bytes) => {
                state.allocated_bytes -= bytes;
                if let ResourceId::Buffer(buffer) = resource {
                    state.address_map.retain(|_, b| *b != buffer);
                }
            }
            None => log::warn!("SoftwareDevice: destroying unknown {:?}", resource),
        }
    }
}

impl GpuDevice for SoftwareDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let label = desc.label.clone().unwrap_or_else(|| "buffer".to_string());
        log::trace!("SoftwareDevice: creating buffer {} (size: {}, heap: {:?})", label, desc.size, desc.heap);
        if desc.size == 0 {
            return Err(BackendError::ResourceCreationFailed(format!("{}: zero-sized buffer", label)));
        }
        let required_state = match desc.heap {
            HeapType::Default => None,
            HeapType::Upload => Some(ResourceState::GenericRead),
            HeapType::Readback => Some(ResourceState::CopyDest),
        };
        if let Some(required) = required_state {
            if desc.initial_state != required {
                return Err(BackendError::ResourceCreationFailed(format!(
                    "{}: {:?} heap buffers must start in {:?}",
                    label, desc.heap, required
                )));
            }
        }

        let handle = BufferHandle(self.next_handle());
        let address = GpuVirtualAddress(self.next_address);
        let mut state = self.state.lock();
        self.reserve(&state, desc.size, &label)?;
        self.next_address += align_up(desc.size, BUFFER_PLACEMENT);
        state.allocated_bytes += desc.size;
        state.address_map.insert(address.0, handle);
        state.buffers.insert(
            handle,
            BufferRecord {
                label,
                heap: desc.heap,
                data: vec![0; desc.size as usize],
                state: desc.initial_state,
                address,
            },
        );
        Ok(handle)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let label = desc.label.clone().unwrap_or_else(|| "texture".to_string());
        log::trace!(
            "SoftwareDevice: creating texture {} ({}x{}, {:?})",
            label,
            desc.width,
            desc.height,
            desc.format
        );
        if desc.width == 0
            || desc.height == 0
            || desc.width > MAX_TEXTURE_DIMENSION
            || desc.height > MAX_TEXTURE_DIMENSION
        {
            return Err(BackendError::ResourceCreationFailed(format!(
                "{}: unsupported size {}x{}",
                label, desc.width, desc.height
            )));
        }
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        let handle = TextureHandle(self.next_handle());
        let mut state = self.state.lock();
        self.reserve(&state, size, &label)?;
        state.allocated_bytes += size;
        state.textures.insert(
            handle,
            TextureRecord {
                label,
                width: desc.width,
                height: desc.height,
                format: desc.format,
                data: vec![0; size as usize],
                state: desc.initial_state,
            },
        );
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let record = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        if record.heap != HeapType::Upload {
            return Err(BackendError::MapFailed(format!(
                "{} lives in the {:?} heap and cannot be written by the CPU",
                record.label, record.heap
            )));
        }
        let end = offset + data.len() as u64;
        if end > record.data.len() as u64 {
            return Err(BackendError::MapFailed(format!(
                "write of {} bytes at {} overruns {} ({} bytes)",
                data.len(),
                offset,
                record.label,
                record.data.len()
            )));
        }
        record.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let state = self.state.lock();
        let record = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        if !record.heap.is_cpu_visible() {
            return Err(BackendError::MapFailed(format!("{} is not CPU visible", record.label)));
        }
        let end = offset + len;
        if end > record.data.len() as u64 {
            return Err(BackendError::MapFailed(format!("read past the end of {}", record.label)));
        }
        Ok(record.data[offset as usize..end as usize].to_vec())
    }

    fn buffer_gpu_address(&self, buffer: BufferHandle) -> BackendResult<GpuVirtualAddress> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|record| record.address)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapInfo> {
        log::trace!(
            "SoftwareDevice: creating descriptor heap {:?} ({} slots, shader visible: {})",
            desc.label,
            desc.capacity,
            desc.shader_visible
        );
        if desc.capacity == 0 {
            return Err(BackendError::ResourceCreationFailed("empty descriptor heap".to_string()));
        }
        let id = self.next_handle();
        let info = DescriptorHeapInfo {
            heap: DescriptorHeapHandle(id),
            cpu_start: CpuDescriptorHandle(id << 32),
            gpu_start: desc
                .shader_visible
                .then_some(GpuDescriptorHandle((1 << 48) | (id << 32))),
            increment: DESCRIPTOR_INCREMENT,
            capacity: desc.capacity,
        };
        self.state.lock().heaps.push(HeapRecord {
            info,
            slots: vec![None; desc.capacity as usize],
        });
        Ok(info)
    }

    fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        format: TextureFormat,
        dest: CpuDescriptorHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        if !state.textures.contains_key(&texture) {
            return Err(BackendError::InvalidHandle(format!("{:?}", texture)));
        }
        let (heap, slot) = state
            .resolve_cpu_descriptor(dest)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor {:#x}", dest.0)))?;
        state.heaps[heap].slots[slot] = Some(ShaderResourceView { texture, format });
        Ok(())
    }

    fn copy_descriptor(
        &mut self,
        dest: CpuDescriptorHandle,
        src: CpuDescriptorHandle,
    ) -> BackendResult<()> {
        let mut state = self.state.lock();
        let (src_heap, src_slot) = state
            .resolve_cpu_descriptor(src)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor {:#x}", src.0)))?;
        if state.heaps[src_heap].info.gpu_start.is_some() {
            return Err(BackendError::InvalidOperation(
                "descriptor copies must read from a non shader-visible heap".to_string(),
            ));
        }
        let (dest_heap, dest_slot) = state
            .resolve_cpu_descriptor(dest)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor {:#x}", dest.0)))?;
        let view = state.heaps[src_heap].slots[src_slot];
        state.heaps[dest_heap].slots[dest_slot] = view;
        Ok(())
    }

    fn reset_command_list(&mut self, allocator: usize) -> BackendResult<()> {
        if self.recording.is_some() {
            return Err(BackendError::InvalidOperation(
                "command list reset while still open".to_string(),
            ));
        }
        if let Some(&submission) = self.allocator_last_submission.get(&allocator) {
            let mut state = self.state.lock();
            if submission > state.executed_through {
                let message = format!(
                    "command allocator {} reset while submission {} is still queued",
                    allocator, submission
                );
                state.validation_error(message.clone());
                return Err(BackendError::InvalidOperation(message));
            }
        }
        log::trace!("SoftwareDevice: reset command list on allocator {}", allocator);
        self.recording = Some(Recording {
            allocator,
            commands: Vec::new(),
        });
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        if !barriers.is_empty() {
            self.record(Command::Barrier(barriers.to_vec()));
        }
    }

    fn copy_buffer_region(
        &mut self,
        dst: BufferHandle,
        dst_offset: u64,
        src: BufferHandle,
        src_offset: u64,
        size: u64,
    ) {
        self.record(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }

    fn copy_buffer_to_texture(
        &mut self,
        dst: TextureHandle,
        src: BufferHandle,
        footprint: TextureFootprint,
    ) {
        self.record(Command::CopyBufferToTexture { dst, src, footprint });
    }

    fn copy_texture_to_buffer(
        &mut self,
        dst: BufferHandle,
        footprint: TextureFootprint,
        src: TextureHandle,
    ) {
        self.record(Command::CopyTextureToBuffer { dst, footprint, src });
    }

    fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.record(Command::SetDescriptorHeap(heap));
    }

    fn set_graphics_root_constant_buffer_view(&mut self, root_index: u32, address: GpuVirtualAddress) {
        self.record(Command::SetRootConstantBufferView { root_index, address });
    }

    fn set_graphics_root_descriptor_table(&mut self, root_index: u32, table: GpuDescriptorHandle) {
        self.record(Command::SetRootDescriptorTable { root_index, table });
    }

    fn set_vertex_buffer(&mut self, view: VertexBufferView) {
        self.record(Command::SetVertexBuffer(view));
    }

    fn set_index_buffer(&mut self, view: IndexBufferView) {
        self.record(Command::SetIndexBuffer(view));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.record(Command::SetScissorRect(rect));
    }

    fn clear_render_target(&mut self, target: TextureHandle, color: [f32; 4]) {
        self.record(Command::ClearRenderTarget { target, color });
    }

    fn clear_depth(&mut self, target: TextureHandle, depth: f32) {
        self.record(Command::ClearDepth { target, depth });
    }

    fn set_render_targets(&mut self, color: TextureHandle, depth: Option<TextureHandle>) {
        self.record(Command::SetRenderTargets { color, depth });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    fn close_and_execute(&mut self) -> BackendResult<()> {
        let recording = self
            .recording
            .take()
            .ok_or_else(|| BackendError::InvalidOperation("no open command list".to_string()))?;
        self.next_submission += 1;
        let id = self.next_submission;
        log::trace!(
            "SoftwareDevice: executing command list {} ({} commands, allocator {})",
            id,
            recording.commands.len(),
            recording.allocator
        );
        self.allocator_last_submission.insert(recording.allocator, id);
        self.state.lock().submissions.push(Submission {
            allocator: recording.allocator,
            commands: recording.commands.clone(),
        });
        self.enqueue(QueueItem::Execute {
            id,
            commands: recording.commands,
        });
        Ok(())
    }

    fn discard_command_list(&mut self) {
        if let Some(recording) = self.recording.take() {
            log::debug!(
                "SoftwareDevice: discarding {} recorded commands on allocator {}",
                recording.commands.len(),
                recording.allocator
            );
        }
    }

    fn signal(&mut self, value: u64) -> BackendResult<()> {
        log::trace!("SoftwareDevice: queue signal {}", value);
        self.enqueue(QueueItem::Signal(value));
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.state.lock().completed
    }

    fn wait_for_value(&mut self, value: u64, timeout: Duration) -> BackendResult<()> {
        let mut state = self.state.lock();
        if state.retire_through(value) {
            Ok(())
        } else {
            Err(BackendError::DeviceLost(format!(
                "fence stuck at {} waiting for {} ({:?} timeout)",
                state.completed, value, timeout
            )))
        }
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32, buffer_count: u32) -> BackendResult<()> {
        log::debug!("SoftwareDevice: resizing swap chain to {}x{} ({} buffers)", width, height, buffer_count);
        if buffer_count == 0 {
            return Err(BackendError::ResourceCreationFailed("swap chain without buffers".to_string()));
        }
        for back_buffer in std::mem::take(&mut self.swap_chain.back_buffers) {
            self.destroy_resource(ResourceId::Texture(back_buffer));
        }
        let mut back_buffers = Vec::with_capacity(buffer_count as usize);
        for index in 0..buffer_count {
            back_buffers.push(self.create_texture(&TextureDescriptor {
                label: Some(format!("back buffer {}", index)),
                width,
                height,
                format: TextureFormat::Bgra8Unorm,
                initial_state: ResourceState::Present,
            })?);
        }
        self.swap_chain = SwapChain {
            width,
            height,
            back_buffers,
            index: 0,
        };
        Ok(())
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.swap_chain.index
    }

    fn back_buffer(&self, index: u32) -> BackendResult<TextureHandle> {
        self.swap_chain
            .back_buffers
            .get(index as usize)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("back buffer {}", index)))
    }

    fn present(&mut self) -> BackendResult<()> {
        let back_buffer = self.back_buffer(self.swap_chain.index)?;
        self.swap_chain.index = (self.swap_chain.index + 1) % self.swap_chain.back_buffers.len() as u32;
        self.enqueue(QueueItem::Present { back_buffer });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.destroy_resource(ResourceId::Buffer(buffer));
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.destroy_resource(ResourceId::Texture(texture));
    }
}
