//! Staging upload pipeline.
//!
//! Moving CPU data into device-local memory takes two phases:
//!
//! 1. CPU phase: create the device-local resource in `Common`, create an
//!    upload-heap [`StagingBuffer`] of matching size and copy the source bytes
//!    into it. Image rows land at the aligned row pitch.
//! 2. GPU phase: an [`UploadBatch`] records, for every queued asset, a
//!    `Common -> CopyDest` barrier, the copy, and a `CopyDest -> terminal`
//!    barrier. The barriers of a batch are grouped: all entry barriers first,
//!    then all copies, then all terminal barriers.
//!
//! Queuing a target leaves its state tag alone. The tag only moves to the
//! terminal state through [`UploadBatch::complete_buffer`] or
//! [`UploadBatch::complete_texture`] once the batch has been submitted, so a
//! batch abandoned before submission leaves every target reusable.
//!
//! Staging buffers stay alive until the fence value signaled after the batch
//! has been reached; only then may their owner release them.

use crate::backend::*;
use crate::error::{ViewerError, ViewerResult};
use crate::sync::FrameSync;

/// Command allocator used for one-shot work outside the frame loop.
///
/// Kept apart from the frame ring's allocators: an upload may still be queued
/// when the next frame resets its ring slot.
pub const ONE_SHOT_ALLOCATOR: usize = usize::MAX;

/// Device-local buffer and the state its owner last transitioned it to.
#[derive(Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    handle: BufferHandle,
    size: u64,
    state: ResourceState,
}

impl GpuBuffer {
    /// Create a device-local buffer in `Common`.
    pub fn create<D: GpuDevice>(device: &mut D, label: &str, size: u64) -> ViewerResult<Self> {
        let handle = device.create_buffer(&BufferDescriptor::device_local(label, size))?;
        Ok(Self {
            handle,
            size,
            state: ResourceState::Common,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// State after all work recorded so far has executed.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn release<D: GpuDevice>(self, device: &mut D) {
        device.destroy_buffer(self.handle);
    }
}

/// Device-local 2D texture and the state its owner last transitioned it to.
#[derive(Debug, PartialEq, Eq)]
pub struct GpuTexture {
    handle: TextureHandle,
    width: u32,
    height: u32,
    format: TextureFormat,
    state: ResourceState,
}

impl GpuTexture {
    /// Create a device-local texture in `Common`.
    pub fn create<D: GpuDevice>(
        device: &mut D,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> ViewerResult<Self> {
        let handle = device.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            format,
            initial_state: ResourceState::Common,
        })?;
        Ok(Self {
            handle,
            width,
            height,
            format,
            state: ResourceState::Common,
        })
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// State after all work recorded so far has executed.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Footprint of this texture at the aligned row pitch.
    pub fn footprint(&self) -> TextureFootprint {
        TextureFootprint::aligned(self.width, self.height, self.format)
    }

    pub fn release<D: GpuDevice>(self, device: &mut D) {
        device.destroy_texture(self.handle);
    }
}

/// Upload-heap buffer holding one asset's bytes until the GPU has copied them.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingBuffer {
    handle: BufferHandle,
    size: u64,
}

impl StagingBuffer {
    /// Create a staging buffer holding `bytes` verbatim.
    pub fn from_bytes<D: GpuDevice>(device: &mut D, label: &str, bytes: &[u8]) -> ViewerResult<Self> {
        let handle = device.create_buffer(&BufferDescriptor::upload(label, bytes.len() as u64))?;
        let staging = Self {
            handle,
            size: bytes.len() as u64,
        };
        if let Err(err) = device.write_buffer(handle, 0, bytes) {
            device.destroy_buffer(handle);
            return Err(err.into());
        }
        Ok(staging)
    }

    /// Create a staging buffer holding tightly packed `pixels` at the footprint's row pitch.
    ///
    /// Only the texel bytes of each row are written; the padding up to the
    /// pitch keeps whatever the buffer held.
    pub fn from_image<D: GpuDevice>(
        device: &mut D,
        label: &str,
        footprint: &TextureFootprint,
        pixels: &[u8],
    ) -> ViewerResult<Self> {
        let row_size = footprint.packed_row_size() as usize;
        if pixels.len() != row_size * footprint.height as usize {
            return Err(ViewerError::InvalidTexture(format!(
                "{}: {} bytes of pixels for a {}x{} image",
                label,
                pixels.len(),
                footprint.width,
                footprint.height
            )));
        }
        let size = footprint.offset + footprint.total_size();
        let handle = device.create_buffer(&BufferDescriptor::upload(label, size))?;
        for (row, texels) in pixels.chunks_exact(row_size).enumerate() {
            let offset = footprint.offset + row as u64 * footprint.row_pitch as u64;
            if let Err(err) = device.write_buffer(handle, offset, texels) {
                device.destroy_buffer(handle);
                return Err(err.into());
            }
        }
        Ok(Self { handle, size })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn release<D: GpuDevice>(self, device: &mut D) {
        device.destroy_buffer(self.handle);
    }
}

#[derive(Debug, Clone, Copy)]
enum CopyKind {
    Buffer { dst: BufferHandle, size: u64 },
    Texture { dst: TextureHandle, footprint: TextureFootprint },
}

#[derive(Debug, Clone, Copy)]
struct UploadItem {
    copy: CopyKind,
    staging: BufferHandle,
    terminal: ResourceState,
}

impl UploadItem {
    fn resource(&self) -> ResourceId {
        match self.copy {
            CopyKind::Buffer { dst, .. } => ResourceId::Buffer(dst),
            CopyKind::Texture { dst, .. } => ResourceId::Texture(dst),
        }
    }
}

/// Uploads recorded together into one command list.
#[derive(Debug, Default)]
pub struct UploadBatch {
    items: Vec<UploadItem>,
    fence: Option<u64>,
}

impl UploadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fence value that retires the batch, once submitted.
    pub fn fence(&self) -> Option<u64> {
        self.fence
    }

    /// Queue a buffer copy from `staging` into `target`, ending in `terminal`.
    ///
    /// `target` must be in `Common` and not queued yet.
    pub fn add_buffer(
        &mut self,
        target: &GpuBuffer,
        staging: &StagingBuffer,
        terminal: ResourceState,
    ) -> ViewerResult<()> {
        self.check_target(ResourceId::Buffer(target.handle), target.state)?;
        if staging.size < target.size {
            return Err(ViewerError::InvalidOperation(format!(
                "staging buffer of {} bytes cannot fill {} bytes",
                staging.size, target.size
            )));
        }
        self.items.push(UploadItem {
            copy: CopyKind::Buffer {
                dst: target.handle,
                size: target.size,
            },
            staging: staging.handle,
            terminal,
        });
        Ok(())
    }

    /// Queue an image copy from `staging` into `target`, ending in `terminal`.
    pub fn add_texture(
        &mut self,
        target: &GpuTexture,
        staging: &StagingBuffer,
        terminal: ResourceState,
    ) -> ViewerResult<()> {
        self.check_target(ResourceId::Texture(target.handle), target.state)?;
        let footprint = target.footprint();
        if staging.size < footprint.total_size() {
            return Err(ViewerError::InvalidOperation(format!(
                "staging buffer of {} bytes cannot hold a {} byte footprint",
                staging.size,
                footprint.total_size()
            )));
        }
        self.items.push(UploadItem {
            copy: CopyKind::Texture {
                dst: target.handle,
                footprint,
            },
            staging: staging.handle,
            terminal,
        });
        Ok(())
    }

    fn check_target(&self, resource: ResourceId, state: ResourceState) -> ViewerResult<()> {
        if self.fence.is_some() {
            return Err(ViewerError::InvalidOperation(
                "upload batch was already submitted".to_string(),
            ));
        }
        if state != ResourceState::Common {
            return Err(ViewerError::InvalidOperation(format!(
                "upload target {:?} is in {:?}, expected Common",
                resource, state
            )));
        }
        if self.terminal_state(resource).is_some() {
            return Err(ViewerError::InvalidOperation(format!(
                "upload target {:?} is already queued",
                resource
            )));
        }
        Ok(())
    }

    fn terminal_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.items
            .iter()
            .find(|item| item.resource() == resource)
            .map(|item| item.terminal)
    }

    /// Record the batch in a one-shot command list and submit it.
    ///
    /// Returns the fence value that retires the copies. A batch is submitted
    /// once.
    pub fn submit<D: GpuDevice>(&mut self, device: &mut D, sync: &mut FrameSync) -> ViewerResult<u64> {
        if let Some(fence) = self.fence {
            return Err(ViewerError::InvalidOperation(format!(
                "upload batch was already submitted at fence {}",
                fence
            )));
        }
        let fence = submit_one_shot(device, sync, |device| {
            self.record(device);
            Ok(())
        })?;
        self.fence = Some(fence);
        Ok(fence)
    }

    /// Move the state tag of a submitted buffer to its terminal state.
    ///
    /// Returns `false` when `target` is not part of this batch.
    pub fn complete_buffer(&self, target: &mut GpuBuffer) -> ViewerResult<bool> {
        match self.completed_state(ResourceId::Buffer(target.handle))? {
            Some(state) => {
                target.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move the state tag of a submitted texture to its terminal state.
    ///
    /// Returns `false` when `target` is not part of this batch.
    pub fn complete_texture(&self, target: &mut GpuTexture) -> ViewerResult<bool> {
        match self.completed_state(ResourceId::Texture(target.handle))? {
            Some(state) => {
                target.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn completed_state(&self, resource: ResourceId) -> ViewerResult<Option<ResourceState>> {
        if self.fence.is_none() {
            return Err(ViewerError::InvalidOperation(format!(
                "upload of {:?} completed before its batch was submitted",
                resource
            )));
        }
        Ok(self.terminal_state(resource))
    }

    fn record<D: GpuDevice>(&self, device: &mut D) {
        if self.items.is_empty() {
            return;
        }
        let entry: Vec<ResourceBarrier> = self
            .items
            .iter()
            .map(|item| ResourceBarrier {
                resource: item.resource(),
                before: ResourceState::Common,
                after: ResourceState::CopyDest,
            })
            .collect();
        device.resource_barrier(&entry);

        for item in &self.items {
            match item.copy {
                CopyKind::Buffer { dst, size } => device.copy_buffer_region(dst, 0, item.staging, 0, size),
                CopyKind::Texture { dst, footprint } => {
                    device.copy_buffer_to_texture(dst, item.staging, footprint)
                }
            }
        }

        let terminal: Vec<ResourceBarrier> = self
            .items
            .iter()
            .map(|item| ResourceBarrier {
                resource: item.resource(),
                before: ResourceState::CopyDest,
                after: item.terminal,
            })
            .collect();
        device.resource_barrier(&terminal);
        log::debug!("UploadBatch: recorded {} uploads", self.items.len());
    }
}

/// Run `record` in a one-shot command list, submit it and signal the fence.
///
/// The GPU is drained first so the shared allocator can be reset. Returns the
/// fence value that marks completion of the recorded work. If `record` fails,
/// nothing it recorded is submitted.
pub fn submit_one_shot<D, F>(device: &mut D, sync: &mut FrameSync, record: F) -> ViewerResult<u64>
where
    D: GpuDevice,
    F: FnOnce(&mut D) -> ViewerResult<()>,
{
    sync.wait_for_idle(device)?;
    device.reset_command_list(ONE_SHOT_ALLOCATOR)?;
    if let Err(err) = record(device) {
        device.discard_command_list();
        return Err(err);
    }
    device.close_and_execute()?;
    sync.signal(device)
}

/// Copy a texture back to the CPU and return its tightly packed texels.
///
/// The texture goes through `CopySource` and is returned to its tagged state.
pub fn read_back_texture<D: GpuDevice>(
    device: &mut D,
    sync: &mut FrameSync,
    texture: &GpuTexture,
) -> ViewerResult<Vec<u8>> {
    let footprint = texture.footprint();
    let readback = device.create_buffer(&BufferDescriptor::readback("texture readback", footprint.total_size()))?;

    let fence = submit_one_shot(device, sync, |device| {
        device.resource_barrier(&[ResourceBarrier::texture(
            texture.handle,
            texture.state,
            ResourceState::CopySource,
        )]);
        device.copy_texture_to_buffer(readback, footprint, texture.handle);
        device.resource_barrier(&[ResourceBarrier::texture(
            texture.handle,
            ResourceState::CopySource,
            texture.state,
        )]);
        Ok(())
    });
    let result = fence
        .and_then(|fence| sync.wait_for_value(device, fence))
        .and_then(|()| {
            device
                .read_buffer(readback, 0, footprint.total_size())
                .map_err(ViewerError::from)
        });
    device.destroy_buffer(readback);

    let padded = result?;
    let row_size = footprint.packed_row_size() as usize;
    Ok(padded
        .chunks(footprint.row_pitch as usize)
        .take(footprint.height as usize)
        .flat_map(|row| row[..row_size].iter().copied())
        .collect())
}
