//! Shader-visible descriptor slot allocator.
//!
//! A [`DescriptorAllocator`] owns the free list of one fixed-capacity,
//! shader-visible descriptor heap. Slot `i` maps to the handle pair
//! `start + i * increment` on both the CPU and the GPU side.
//!
//! Contiguous ranges let a material bind all of its channel slots as a single
//! descriptor table. The free list is appended to on release and only sorted
//! again by the next allocation, which scans it first-fit for a run of
//! consecutive indices. Once ranges are released out of order the pool can
//! fragment, so [`ViewerError::NoContiguousRun`] is a real outcome.
//!
//! The allocator is not synchronized: every call comes from the render thread.

use crate::backend::*;
use crate::error::{ViewerError, ViewerResult};

/// A run of consecutive descriptor slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    /// Index of the first slot in the heap.
    pub index: u32,
    /// Number of slots.
    pub count: u32,
    /// CPU handle of the first slot.
    pub cpu: CpuDescriptorHandle,
    /// GPU handle of the first slot.
    pub gpu: GpuDescriptorHandle,
    increment: u32,
}

impl DescriptorRange {
    /// CPU handle of slot `offset` within the range.
    pub fn cpu_handle(&self, offset: u32) -> CpuDescriptorHandle {
        debug_assert!(offset < self.count);
        self.cpu.offset(offset, self.increment)
    }

    /// GPU handle of slot `offset` within the range.
    pub fn gpu_handle(&self, offset: u32) -> GpuDescriptorHandle {
        debug_assert!(offset < self.count);
        self.gpu.offset(offset, self.increment)
    }

    /// CPU handles of every slot, in order.
    pub fn cpu_handles(&self) -> impl Iterator<Item = CpuDescriptorHandle> + '_ {
        (0..self.count).map(|offset| self.cpu_handle(offset))
    }
}

/// Free-list allocator over a shader-visible descriptor heap.
#[derive(Debug)]
pub struct DescriptorAllocator {
    heap: DescriptorHeapInfo,
    gpu_start: GpuDescriptorHandle,
    free: Vec<u32>,
    sorted: bool,
}

impl DescriptorAllocator {
    /// Create a shader-visible heap of `capacity` slots and manage it.
    pub fn create<D: GpuDevice>(device: &mut D, capacity: u32, label: &str) -> ViewerResult<Self> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDescriptor {
            label: Some(label.to_string()),
            capacity,
            shader_visible: true,
        })?;
        Self::new(heap)
    }

    /// Manage an existing shader-visible heap; all slots start free.
    pub fn new(heap: DescriptorHeapInfo) -> ViewerResult<Self> {
        let gpu_start = heap.gpu_start.ok_or_else(|| {
            ViewerError::InvalidOperation("descriptor allocator needs a shader-visible heap".to_string())
        })?;
        if heap.increment == 0 {
            return Err(ViewerError::InvalidOperation("descriptor increment is zero".to_string()));
        }
        Ok(Self {
            heap,
            gpu_start,
            free: (0..heap.capacity).collect(),
            sorted: true,
        })
    }

    /// The managed heap.
    pub fn heap(&self) -> &DescriptorHeapInfo {
        &self.heap
    }

    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Free slot indices, sorted.
    pub fn free_indices(&self) -> Vec<u32> {
        let mut indices = self.free.clone();
        indices.sort_unstable();
        indices
    }

    /// Allocate `count` consecutive slots, first fit.
    pub fn allocate_contiguous(&mut self, count: u32) -> ViewerResult<DescriptorRange> {
        if count == 0 {
            return Err(ViewerError::InvalidOperation(
                "descriptor allocation of zero slots".to_string(),
            ));
        }
        let available = self.free_count();
        if available < count {
            return Err(ViewerError::OutOfSlots {
                requested: count,
                available,
            });
        }
        if !self.sorted {
            self.free.sort_unstable();
            self.sorted = true;
        }

        let start = self
            .find_run(count as usize)
            .ok_or(ViewerError::NoContiguousRun {
                requested: count,
                available,
            })?;
        let index = self.free[start];
        self.free.drain(start..start + count as usize);

        log::trace!("DescriptorAllocator: allocated slots {}..{}", index, index + count);
        Ok(self.range(index, count))
    }

    /// Allocate one slot.
    pub fn allocate_single(&mut self) -> ViewerResult<DescriptorRange> {
        self.allocate_contiguous(1)
    }

    /// Return the slot at `cpu` to the pool.
    ///
    /// The free list is left untouched when the handle is rejected.
    pub fn free(&mut self, cpu: CpuDescriptorHandle) -> ViewerResult<()> {
        let index = self.index_of(cpu)?;
        if self.free.contains(&index) {
            return Err(ViewerError::InvalidHandle(format!(
                "descriptor slot {} is already free",
                index
            )));
        }
        self.free.push(index);
        self.sorted = false;
        Ok(())
    }

    /// Return every slot of `range` to the pool.
    ///
    /// All slots are checked first, so a rejected range leaves the free list
    /// untouched.
    pub fn free_range(&mut self, range: &DescriptorRange) -> ViewerResult<()> {
        let indices = range
            .cpu_handles()
            .map(|cpu| self.index_of(cpu))
            .collect::<ViewerResult<Vec<_>>>()?;
        let mut seen = indices.clone();
        seen.sort_unstable();
        if let Some(pair) = seen.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ViewerError::InvalidHandle(format!(
                "descriptor slot {} appears twice in the range",
                pair[0]
            )));
        }
        if let Some(index) = indices.iter().find(|&index| self.free.contains(index)) {
            return Err(ViewerError::InvalidHandle(format!(
                "descriptor slot {} is already free",
                index
            )));
        }
        self.free.extend(indices);
        self.sorted = false;
        Ok(())
    }

    /// Slot index of a CPU handle inside the managed heap.
    pub fn index_of(&self, cpu: CpuDescriptorHandle) -> ViewerResult<u32> {
        let base = self.heap.cpu_start.0;
        let increment = self.heap.increment as u64;
        if cpu.0 < base {
            return Err(ViewerError::InvalidHandle(format!(
                "handle {:#x} lies before the table start {:#x}",
                cpu.0, base
            )));
        }
        let offset = cpu.0 - base;
        if offset % increment != 0 {
            return Err(ViewerError::InvalidHandle(format!(
                "offset {} is not a multiple of the increment {}",
                offset, increment
            )));
        }
        let index = offset / increment;
        if index >= self.heap.capacity as u64 {
            return Err(ViewerError::IndexOutOfRange {
                index,
                capacity: self.heap.capacity,
            });
        }
        Ok(index as u32)
    }

    fn range(&self, index: u32, count: u32) -> DescriptorRange {
        DescriptorRange {
            index,
            count,
            cpu: self.heap.cpu_start.offset(index, self.heap.increment),
            gpu: self.gpu_start.offset(index, self.heap.increment),
            increment: self.heap.increment,
        }
    }

    /// Position in the sorted free list where a run of `count` consecutive indices starts.
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        for i in 0..self.free.len() {
            if i > run_start && self.free[i] != self.free[i - 1] + 1 {
                run_start = i;
            }
            if i + 1 - run_start == count {
                return Some(run_start);
            }
        }
        None
    }
}
