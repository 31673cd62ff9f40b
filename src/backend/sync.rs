// Fence clock - the single CPU/GPU synchronization primitive
//
// One Vulkan timeline semaphore whose 64-bit counter only moves forward.
// Bridges CPU-thread time and GPU-queue time: the queue raises the counter
// as submissions retire, the render thread queries or waits on it.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::VulkanDevice;

/// Result of a bounded wait on the fence clock.
///
/// A timeout is an outcome, not an error - callers use it to detect GPU hangs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Complete,
    TimedOut,
}

/// GPU timeline contract: queue-ordered signals, a non-blocking completion
/// query, and a bounded blocking wait.
///
/// [`FenceClock`] implements this against the device. Tests drive the frame
/// ring and the swap chain controller with a simulated timeline instead.
pub trait FenceTimeline {
    /// Increment the counter and enqueue a signal to the new value.
    /// Returns that value, strictly greater than any previously returned.
    /// The value is only meaningful relative to prior submissions on the
    /// same queue.
    fn signal(&self) -> Result<u64>;

    /// Highest value the GPU has finished. Never blocks and never fails
    /// (reports the last known value if the device has errored).
    fn completed_value(&self) -> u64;

    /// Block until `completed_value() >= value` or `timeout` elapses.
    /// Returns immediately, without a syscall, when already complete.
    fn wait_until(&self, value: u64, timeout: Duration) -> Result<WaitOutcome>;
}

/// Monotonic fence built on a Vulkan timeline semaphore.
pub struct FenceClock {
    device: Arc<VulkanDevice>,
    semaphore: vk::Semaphore,
    /// Next value handed out by `signal`; only ever incremented, never reset.
    next: Mutex<u64>,
    /// Last completion value observed from the device.
    last_completed: AtomicU64,
}

impl FenceClock {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);

        let semaphore = unsafe {
            device
                .device
                .create_semaphore(&create_info, None)
                .context("Failed to create timeline semaphore")?
        };

        log::info!("Created fence clock");

        Ok(Self {
            device,
            semaphore,
            next: Mutex::new(0),
            last_completed: AtomicU64::new(0),
        })
    }

    /// Signal and wait unbounded: everything submitted to the queue so far
    /// has retired when this returns.
    pub fn flush(&self) -> Result<()> {
        let value = self.signal()?;
        match self.wait_until(value, Duration::MAX)? {
            WaitOutcome::Complete => Ok(()),
            WaitOutcome::TimedOut => anyhow::bail!("Unbounded fence wait timed out"),
        }
    }
}

impl FenceTimeline for FenceClock {
    fn signal(&self) -> Result<u64> {
        let mut next = self.next.lock();
        *next += 1;
        let value = *next;

        // Queue-ordered signal: an empty submission that raises the timeline
        // once all prior work on the queue has retired.
        let signal_values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::builder().signal_semaphore_values(&signal_values);
        let signal_semaphores = [self.semaphore];
        let submit_info = vk::SubmitInfo::builder()
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    vk::Fence::null(),
                )
                .context("Failed to submit fence signal")?;
        }

        Ok(value)
    }

    fn completed_value(&self) -> u64 {
        match unsafe {
            self.device
                .device
                .get_semaphore_counter_value(self.semaphore)
        } {
            Ok(value) => {
                self.last_completed.store(value, Ordering::Relaxed);
                value
            }
            Err(e) => {
                log::warn!("Fence completion query failed: {}", e);
                self.last_completed.load(Ordering::Relaxed)
            }
        }
    }

    fn wait_until(&self, value: u64, timeout: Duration) -> Result<WaitOutcome> {
        if self.completed_value() >= value {
            return Ok(WaitOutcome::Complete);
        }

        // The driver parks the thread on an OS event registered against the
        // semaphore; no busy-polling here.
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(WaitOutcome::Complete),
            Err(vk::Result::TIMEOUT) => Ok(WaitOutcome::TimedOut),
            Err(e) => Err(e).context("Fence wait failed"),
        }
    }
}

impl Drop for FenceClock {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, None);
        }
    }
}
