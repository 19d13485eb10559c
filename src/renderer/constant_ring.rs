//! Constant buffer ring for per-frame and per-draw data.
//!
//! One upload-heap buffer holds `ring_depth` regions, one per frame-ring slot,
//! of `slots_per_frame` constant blocks each. Every block is padded to the
//! 256-byte constant buffer alignment.
//!
//! Draw `d` of the frame recorded into ring slot `f` always lands in block
//! `f * slots_per_frame + d`, so no two draws of one frame share a block and
//! a frame never touches a region another in-flight frame reads. Rewriting
//! region `f` is safe once [`crate::sync::FrameSync::advance_frame`] has
//! handed out slot `f`.
//!
//! # Thread Safety
//!
//! `ConstantRing` is NOT synchronized; only the render thread writes to it.

use bytemuck::Pod;

use crate::backend::*;
use crate::error::{ViewerError, ViewerResult};

/// Slot-indexed ring of constant blocks in one upload buffer
#[derive(Debug)]
pub struct ConstantRing {
    buffer: BufferHandle,
    base: GpuVirtualAddress,
    ring_depth: usize,
    slots_per_frame: u32,
    stride: u64,
}

impl ConstantRing {
    /// Create a ring for `ring_depth` frames of `slots_per_frame` blocks of `element_size` bytes.
    pub fn new<D: GpuDevice>(
        device: &mut D,
        ring_depth: usize,
        slots_per_frame: u32,
        element_size: u64,
        label: &str,
    ) -> ViewerResult<Self> {
        if ring_depth == 0 || slots_per_frame == 0 || element_size == 0 {
            return Err(ViewerError::InvalidOperation(format!(
                "{}: constant ring needs a non-zero depth, slot count and element size",
                label
            )));
        }
        let stride = align_up(element_size, CONSTANT_BUFFER_ALIGNMENT);
        let size = stride * slots_per_frame as u64 * ring_depth as u64;
        let buffer = device.create_buffer(&BufferDescriptor::upload(label, size))?;
        let base = match device.buffer_gpu_address(buffer) {
            Ok(base) => base,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err.into());
            }
        };
        log::debug!(
            "ConstantRing {}: {} frames x {} blocks of {} bytes",
            label,
            ring_depth,
            slots_per_frame,
            stride
        );
        Ok(Self {
            buffer,
            base,
            ring_depth,
            slots_per_frame,
            stride,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn ring_depth(&self) -> usize {
        self.ring_depth
    }

    pub fn slots_per_frame(&self) -> u32 {
        self.slots_per_frame
    }

    /// Bytes between consecutive blocks.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Block index of draw `draw` in frame slot `frame_slot`.
    pub fn slot_index(&self, frame_slot: usize, draw: u32) -> ViewerResult<u64> {
        if frame_slot >= self.ring_depth {
            return Err(ViewerError::InvalidOperation(format!(
                "frame slot {} outside a ring of {}",
                frame_slot, self.ring_depth
            )));
        }
        if draw >= self.slots_per_frame {
            return Err(ViewerError::TooManyMeshes {
                count: draw as usize + 1,
                limit: self.slots_per_frame as usize,
            });
        }
        Ok(frame_slot as u64 * self.slots_per_frame as u64 + draw as u64)
    }

    /// Byte offset of a block within the buffer.
    pub fn offset(&self, frame_slot: usize, draw: u32) -> ViewerResult<u64> {
        Ok(self.slot_index(frame_slot, draw)? * self.stride)
    }

    /// Write `value` into its block and return the block's GPU address.
    pub fn write<D: GpuDevice, T: Pod>(
        &self,
        device: &mut D,
        frame_slot: usize,
        draw: u32,
        value: &T,
    ) -> ViewerResult<GpuVirtualAddress> {
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() as u64 > self.stride {
            return Err(ViewerError::InvalidOperation(format!(
                "{} bytes do not fit a {} byte constant block",
                bytes.len(),
                self.stride
            )));
        }
        let offset = self.offset(frame_slot, draw)?;
        device.write_buffer(self.buffer, offset, bytes)?;
        Ok(self.base.offset(offset))
    }

    /// Destroy the buffer. The GPU must be idle.
    pub fn release<D: GpuDevice>(self, device: &mut D) {
        device.destroy_buffer(self.buffer);
    }
}
