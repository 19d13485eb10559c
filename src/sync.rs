//! CPU/GPU frame synchronization.
//!
//! [`FrameSync`] drives the device fence with one monotonically increasing
//! counter and remembers, for every slot of the frame ring, the fence value
//! signaled after the last frame that used it.
//!
//! Anything tagged with ring slot N (its command allocator, its region of the
//! constant rings) may only be reset or rewritten once the fence has reached
//! the value recorded for slot N. [`FrameSync::advance_frame`] enforces that
//! by blocking only when the slot it hands out is still in flight, which lets
//! the CPU run up to `ring_depth - 1` frames ahead of the GPU.
//!
//! A fence wait that times out means the device is gone. There is no
//! recovery: the error propagates and the caller tears the device down.

use std::time::Duration;

use crate::backend::GpuDevice;
use crate::error::{ViewerError, ViewerResult};

/// Fence counter and per-slot retirement records for the frame ring.
#[derive(Debug)]
pub struct FrameSync {
    next_value: u64,
    slot_values: Vec<u64>,
    current: Option<usize>,
    timeout: Duration,
    stalls: u64,
}

impl FrameSync {
    /// Default time a fence wait may take before the device counts as lost.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(ring_depth: usize, timeout: Duration) -> ViewerResult<Self> {
        if ring_depth == 0 {
            return Err(ViewerError::InvalidOperation(
                "frame ring depth must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            next_value: 1,
            slot_values: vec![0; ring_depth],
            current: None,
            timeout,
            stalls: 0,
        })
    }

    pub fn ring_depth(&self) -> usize {
        self.slot_values.len()
    }

    /// Ring slot of the frame being recorded, if any frame started yet.
    pub fn current_slot(&self) -> Option<usize> {
        self.current
    }

    /// Value the next signal will use.
    pub fn next_value(&self) -> u64 {
        self.next_value
    }

    /// Fence value recorded at the last use of `slot` (0 if never used).
    pub fn slot_fence(&self, slot: usize) -> u64 {
        self.slot_values.get(slot).copied().unwrap_or(0)
    }

    /// Blocking waits [`Self::advance_frame`] has performed.
    pub fn stall_count(&self) -> u64 {
        self.stalls
    }

    /// Whether the GPU has retired every frame that used `slot`.
    pub fn is_slot_retired<D: GpuDevice>(&self, device: &D, slot: usize) -> bool {
        device.completed_value() >= self.slot_fence(slot)
    }

    /// Signal the current counter and advance it. Returns the signaled value.
    pub fn signal<D: GpuDevice>(&mut self, device: &mut D) -> ViewerResult<u64> {
        let value = self.next_value;
        device.signal(value)?;
        self.next_value += 1;
        Ok(value)
    }

    /// Block until the fence reaches `value`.
    pub fn wait_for_value<D: GpuDevice>(&mut self, device: &mut D, value: u64) -> ViewerResult<()> {
        if device.completed_value() < value {
            device.wait_for_value(value, self.timeout)?;
        }
        Ok(())
    }

    /// Drain the GPU: signal, block until it is reached, advance the counter.
    pub fn wait_for_idle<D: GpuDevice>(&mut self, device: &mut D) -> ViewerResult<()> {
        let value = self.next_value;
        device.signal(value)?;
        device.wait_for_value(value, self.timeout)?;
        self.next_value += 1;
        log::debug!("FrameSync: GPU idle at fence {}", value);
        Ok(())
    }

    /// Close the previous frame and hand out the ring slot for the next one.
    ///
    /// The signal issued here marks the end of everything submitted so far and
    /// is recorded against the slot the previous frame used. The returned slot
    /// is safe to reset: if the GPU has not yet retired its last use, this
    /// blocks until it has.
    pub fn advance_frame<D: GpuDevice>(&mut self, device: &mut D) -> ViewerResult<usize> {
        let value = self.next_value;
        device.signal(value)?;
        self.next_value += 1;

        let next = match self.current {
            Some(current) => {
                self.slot_values[current] = value;
                (current + 1) % self.slot_values.len()
            }
            None => 0,
        };

        let required = self.slot_values[next];
        if device.completed_value() < required {
            self.stalls += 1;
            log::trace!(
                "FrameSync: slot {} still in flight, waiting for fence {}",
                next,
                required
            );
            device.wait_for_value(required, self.timeout)?;
        }
        self.current = Some(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ExecutionMode, SoftwareDevice};
    use rstest::rstest;

    fn sync(depth: usize) -> FrameSync {
        FrameSync::new(depth, FrameSync::DEFAULT_TIMEOUT).unwrap()
    }

    #[rstest]
    #[case(2, 0)]
    #[case(2, 1)]
    #[case(2, 5)]
    #[case(3, 4)]
    fn test_ring_wraparound_stalls(#[case] depth: usize, #[case] extra: u64) {
        let mut device = SoftwareDevice::new(ExecutionMode::Deferred);
        let mut sync = sync(depth);

        for _ in 0..depth as u64 + extra {
            sync.advance_frame(&mut device).unwrap();
        }
        assert_eq!(sync.stall_count(), extra);
    }

    #[test]
    fn test_no_stall_when_gpu_keeps_up() {
        let mut device = SoftwareDevice::new(ExecutionMode::Immediate);
        let mut sync = sync(2);
        for _ in 0..10 {
            sync.advance_frame(&mut device).unwrap();
        }
        assert_eq!(sync.stall_count(), 0);
    }

    #[test]
    fn test_slots_cycle_round_robin() {
        let mut device = SoftwareDevice::default();
        let mut sync = sync(3);
        assert_eq!(sync.current_slot(), None);
        let slots: Vec<usize> = (0..7).map(|_| sync.advance_frame(&mut device).unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(sync.current_slot(), Some(0));
    }

    #[test]
    fn test_returned_slot_is_retired() {
        let mut device = SoftwareDevice::new(ExecutionMode::Deferred);
        let mut sync = sync(2);
        for _ in 0..6 {
            let slot = sync.advance_frame(&mut device).unwrap();
            assert!(sync.is_slot_retired(&device, slot));
        }
    }

    #[test]
    fn test_wait_for_idle_drains_and_advances() {
        let mut device = SoftwareDevice::new(ExecutionMode::Deferred);
        let mut sync = sync(2);
        sync.advance_frame(&mut device).unwrap();
        sync.advance_frame(&mut device).unwrap();

        let before = sync.next_value();
        sync.wait_for_idle(&mut device).unwrap();
        assert_eq!(device.completed_value(), before);
        assert_eq!(sync.next_value(), before + 1);
        assert_eq!(device.timeline().pending(), 0);
    }

    #[test]
    fn test_signal_returns_increasing_values() {
        let mut device = SoftwareDevice::default();
        let mut sync = sync(2);
        let a = sync.signal(&mut device).unwrap();
        let b = sync.signal(&mut device).unwrap();
        assert!(b > a);
        sync.wait_for_value(&mut device, b).unwrap();
    }

    #[test]
    fn test_zero_depth_is_rejected() {
        assert!(FrameSync::new(0, FrameSync::DEFAULT_TIMEOUT).is_err());
    }

    #[test]
    fn test_wait_for_unsignaled_value_is_device_lost() {
        let mut device = SoftwareDevice::default();
        let mut sync = sync(2);
        assert!(matches!(
            sync.wait_for_value(&mut device, 42),
            Err(ViewerError::DeviceLost(_))
        ));
    }
}
