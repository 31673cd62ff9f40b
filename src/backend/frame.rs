// Frame ring - per-slot scratch resources reused round-robin
//
// A slot's scratch may only be reset once the GPU has retired the last
// submission recorded against it. `acquire` is the single blocking point of
// the present pipeline: it throttles the CPU to the GPU's completion rate,
// so the render thread never runs more than ring-depth frames ahead.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::sync::{FenceTimeline, WaitOutcome};
use super::VulkanDevice;

/// Requested back-buffer count. The ring is sized to the count the
/// presentation subsystem actually created.
pub const NUM_FRAMES: usize = 3;

/// Per-slot command recording resource.
pub trait Scratch {
    /// Discard all previously recorded work. Only called once the slot's
    /// last submission has retired on the GPU.
    fn reset(&mut self) -> Result<()>;
}

/// Command pool plus one primary command buffer for a single frame slot.
/// Resetting the pool reclaims everything recorded for the slot's last frame.
pub struct CommandScratch {
    device: Arc<VulkanDevice>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl CommandScratch {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // TRANSIENT: buffers are re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            device
                .device
                .allocate_command_buffers(&alloc_info)
                .context("Failed to allocate command buffer")?
        };

        Ok(Self {
            device,
            pool,
            buffer: buffers[0],
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

impl Scratch for CommandScratch {
    fn reset(&mut self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .context("Failed to reset command pool")?;
        }
        Ok(())
    }
}

impl Drop for CommandScratch {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees its command buffer as well
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

struct FrameSlot<A> {
    scratch: A,
    /// Fence value of the most recent submission using this slot; 0 = never used.
    last_signaled: u64,
    /// Set between `acquire` and `record_submission`.
    acquired: bool,
}

/// Fixed-size pool of frame slots indexed by the current back-buffer index.
pub struct FrameRing<A> {
    slots: Vec<FrameSlot<A>>,
}

impl<A: Scratch> FrameRing<A> {
    pub fn new(scratch: Vec<A>) -> Self {
        let slots = scratch
            .into_iter()
            .map(|scratch| FrameSlot {
                scratch,
                last_signaled: 0,
                acquired: false,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Block until the slot's previous submission has retired, then reset its
    /// scratch and hand it out for fresh recording.
    pub fn acquire<C: FenceTimeline>(&mut self, index: usize, clock: &C) -> Result<&mut A> {
        match self.acquire_within(index, clock, Duration::MAX)? {
            Some(scratch) => Ok(scratch),
            None => anyhow::bail!("Unbounded wait for frame slot {} timed out", index),
        }
    }

    /// Bounded variant for hang detection: `None` means the GPU did not
    /// retire the slot's last submission within `timeout`.
    pub fn acquire_within<C: FenceTimeline>(
        &mut self,
        index: usize,
        clock: &C,
        timeout: Duration,
    ) -> Result<Option<&mut A>> {
        let slot = self
            .slots
            .get_mut(index)
            .with_context(|| format!("Frame slot {} out of range", index))?;

        if slot.acquired {
            anyhow::bail!(
                "Frame slot {} acquired twice without a recorded submission",
                index
            );
        }

        if slot.last_signaled != 0 {
            match clock.wait_until(slot.last_signaled, timeout)? {
                WaitOutcome::Complete => {}
                WaitOutcome::TimedOut => return Ok(None),
            }
        }

        slot.scratch.reset()?;
        slot.acquired = true;
        Ok(Some(&mut slot.scratch))
    }

    /// Store the fence value signaled for the work just recorded on this slot.
    /// Must follow the matching `acquire`.
    pub fn record_submission(&mut self, index: usize, value: u64) {
        let slot = &mut self.slots[index];
        debug_assert!(
            slot.acquired,
            "submission recorded on a slot that was never acquired"
        );
        slot.last_signaled = value;
        slot.acquired = false;
    }

    pub fn last_signaled(&self, index: usize) -> u64 {
        self.slots[index].last_signaled
    }

    /// Wait until every slot's last submission has retired.
    pub fn flush<C: FenceTimeline>(&self, clock: &C) -> Result<()> {
        for slot in &self.slots {
            if slot.last_signaled != 0 {
                match clock.wait_until(slot.last_signaled, Duration::MAX)? {
                    WaitOutcome::Complete => {}
                    WaitOutcome::TimedOut => anyhow::bail!("Unbounded flush wait timed out"),
                }
            }
        }
        Ok(())
    }

    /// Align every slot's bookkeeping to the highest recorded value. Called
    /// after a flush when back buffers are rebuilt, so no stale per-slot
    /// value is ever waited on against the new buffers.
    pub fn level_values(&mut self) {
        let top = self
            .slots
            .iter()
            .map(|slot| slot.last_signaled)
            .max()
            .unwrap_or(0);
        for slot in &mut self.slots {
            slot.last_signaled = top;
            slot.acquired = false;
        }
    }

    /// Access a slot's scratch after it has been acquired this frame.
    pub fn scratch_mut(&mut self, index: usize) -> &mut A {
        &mut self.slots[index].scratch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Simulated GPU timeline: completion only advances when the test says so.
    #[derive(Default)]
    struct TestClock {
        next: Cell<u64>,
        completed: Cell<u64>,
    }

    impl TestClock {
        fn retire_to(&self, value: u64) {
            self.completed.set(self.completed.get().max(value));
        }
    }

    impl FenceTimeline for TestClock {
        fn signal(&self) -> Result<u64> {
            self.next.set(self.next.get() + 1);
            Ok(self.next.get())
        }

        fn completed_value(&self) -> u64 {
            self.completed.get()
        }

        fn wait_until(&self, value: u64, timeout: Duration) -> Result<WaitOutcome> {
            if self.completed.get() >= value {
                return Ok(WaitOutcome::Complete);
            }
            if timeout == Duration::MAX {
                // The simulated GPU is stalled; an unbounded wait would
                // deadlock the test instead of failing it.
                panic!("unbounded wait while the simulated GPU is stalled");
            }
            Ok(WaitOutcome::TimedOut)
        }
    }

    struct TestScratch {
        resets: Rc<Cell<u32>>,
    }

    impl Scratch for TestScratch {
        fn reset(&mut self) -> Result<()> {
            self.resets.set(self.resets.get() + 1);
            Ok(())
        }
    }

    fn ring(n: usize) -> (FrameRing<TestScratch>, Rc<Cell<u32>>) {
        let resets = Rc::new(Cell::new(0));
        let ring = FrameRing::new(
            (0..n)
                .map(|_| TestScratch {
                    resets: resets.clone(),
                })
                .collect(),
        );
        (ring, resets)
    }

    #[test]
    fn fresh_slot_acquires_without_waiting() {
        let (mut ring, resets) = ring(3);
        let clock = TestClock::default();
        // A stalled clock panics on any real wait; a never-used slot must not wait.
        ring.acquire(0, &clock).unwrap();
        assert_eq!(resets.get(), 1);
    }

    #[test]
    fn double_acquire_without_record_is_an_error() {
        let (mut ring, _) = ring(3);
        let clock = TestClock::default();
        ring.acquire(0, &clock).unwrap();
        assert!(ring.acquire(0, &clock).is_err());
    }

    #[test]
    fn slot_reuse_blocks_until_completion() {
        let (mut ring, resets) = ring(3);
        let clock = TestClock::default();

        ring.acquire(0, &clock).unwrap();
        let value = clock.signal().unwrap();
        ring.record_submission(0, value);

        // GPU has not retired the submission: the slot must not be reset again
        let blocked = ring
            .acquire_within(0, &clock, Duration::from_millis(1))
            .unwrap();
        assert!(blocked.is_none());
        assert_eq!(resets.get(), 1);

        clock.retire_to(value);
        let granted = ring
            .acquire_within(0, &clock, Duration::from_millis(1))
            .unwrap();
        assert!(granted.is_some());
        assert_eq!(resets.get(), 2);
    }

    #[test]
    fn backpressure_caps_inflight_at_ring_depth() {
        let (mut ring, _) = ring(3);
        let clock = TestClock::default();

        // Three frames submit without the GPU retiring anything
        for i in 0..3 {
            ring.acquire(i, &clock).unwrap();
            let value = clock.signal().unwrap();
            ring.record_submission(i, value);
        }

        // The fourth frame wraps to slot 0 and must block
        let blocked = ring
            .acquire_within(0, &clock, Duration::from_millis(1))
            .unwrap();
        assert!(blocked.is_none());

        // One retirement frees exactly that slot
        clock.retire_to(1);
        assert!(ring
            .acquire_within(0, &clock, Duration::from_millis(1))
            .unwrap()
            .is_some());
        assert!(ring
            .acquire_within(1, &clock, Duration::from_millis(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn flush_covers_every_slot() {
        let (mut ring, _) = ring(3);
        let clock = TestClock::default();

        for i in 0..3 {
            ring.acquire(i, &clock).unwrap();
            let value = clock.signal().unwrap();
            ring.record_submission(i, value);
        }

        clock.retire_to(3);
        ring.flush(&clock).unwrap();
        assert!(clock.completed_value() >= ring.last_signaled(2));
    }

    #[test]
    fn level_values_aligns_bookkeeping() {
        let (mut ring, _) = ring(3);
        let clock = TestClock::default();

        for i in 0..3 {
            ring.acquire(i, &clock).unwrap();
            let value = clock.signal().unwrap();
            ring.record_submission(i, value);
        }

        ring.level_values();
        for i in 0..3 {
            assert_eq!(ring.last_signaled(i), 3);
        }
    }

    #[test]
    fn signal_values_are_strictly_increasing() {
        let clock = TestClock::default();
        let mut previous = 0;
        for _ in 0..100 {
            let value = clock.signal().unwrap();
            assert!(value > previous);
            previous = value;
        }
    }
}
