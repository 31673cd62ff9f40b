// Present-loop scenario against a simulated GPU.
//
// Drives the swap chain controller through the exact per-frame sequence the
// render context uses (acquire index -> acquire slot -> submit -> signal ->
// record -> present) with a GPU that only retires work under backpressure,
// and checks the steady-state bounds end to end.

use anyhow::Result;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use flipframe::backend::frame::Scratch;
use flipframe::backend::present::{PresentStatus, PresentTarget, SwapchainController};
use flipframe::backend::sync::{FenceTimeline, WaitOutcome};

const NUM_FRAMES: usize = 3;

/// Simulated GPU timeline. Work retires only when the render thread blocks
/// on it (the backpressure path) or when the test retires it explicitly.
#[derive(Default)]
struct SimClock {
    next: Cell<u64>,
    completed: Rc<Cell<u64>>,
    forced_waits: Cell<u32>,
}

impl FenceTimeline for SimClock {
    fn signal(&self) -> Result<u64> {
        self.next.set(self.next.get() + 1);
        Ok(self.next.get())
    }

    fn completed_value(&self) -> u64 {
        self.completed.get()
    }

    fn wait_until(&self, value: u64, _timeout: Duration) -> Result<WaitOutcome> {
        if self.completed.get() < value {
            self.forced_waits.set(self.forced_waits.get() + 1);
            self.completed.set(value);
        }
        Ok(WaitOutcome::Complete)
    }
}

/// Scratch spy: asserts it is never reset while its last submission is
/// still outstanding on the simulated GPU.
struct SimScratch {
    /// Value recorded against this slot's most recent submission.
    last_signaled: Rc<Cell<u64>>,
    completed: Rc<Cell<u64>>,
    resets: Cell<u32>,
}

impl Scratch for SimScratch {
    fn reset(&mut self) -> Result<()> {
        assert!(
            self.completed.get() >= self.last_signaled.get(),
            "slot scratch reset while its submission was still in flight"
        );
        self.resets.set(self.resets.get() + 1);
        Ok(())
    }
}

/// Flip-model presentation fake: rotates the current index after each
/// present and bumps a buffer generation on rebuild.
struct SimTarget {
    images: usize,
    index: usize,
    generation: u32,
    acquired_generation: u32,
    presents: u32,
}

impl SimTarget {
    fn new(images: usize) -> Self {
        Self {
            images,
            index: 0,
            generation: 0,
            acquired_generation: 0,
            presents: 0,
        }
    }
}

impl PresentTarget for SimTarget {
    fn image_count(&self) -> usize {
        self.images
    }

    fn tearing_supported(&self) -> bool {
        false
    }

    fn acquire_index(&mut self) -> Result<Option<usize>> {
        self.acquired_generation = self.generation;
        Ok(Some(self.index))
    }

    fn present(&mut self, index: usize, _vsync: bool, _tearing: bool) -> Result<PresentStatus> {
        assert_eq!(
            self.acquired_generation, self.generation,
            "presented a back buffer from before a rebuild"
        );
        self.presents += 1;
        self.index = (index + 1) % self.images;
        Ok(PresentStatus::Presented)
    }

    fn rebuild(&mut self, _width: u32, _height: u32, _vsync: bool, _tearing: bool) -> Result<()> {
        self.generation += 1;
        self.index = 0;
        Ok(())
    }
}

struct Harness {
    controller: SwapchainController<SimTarget, SimScratch>,
    clock: SimClock,
    slot_values: Vec<Rc<Cell<u64>>>,
}

impl Harness {
    fn new() -> Self {
        let clock = SimClock::default();
        let slot_values: Vec<Rc<Cell<u64>>> =
            (0..NUM_FRAMES).map(|_| Rc::new(Cell::new(0))).collect();
        let scratch = slot_values
            .iter()
            .map(|last| SimScratch {
                last_signaled: last.clone(),
                completed: clock.completed.clone(),
                resets: Cell::new(0),
            })
            .collect();
        let controller =
            SwapchainController::new(SimTarget::new(NUM_FRAMES), scratch, 1280, 720, true, false)
                .unwrap();
        Self {
            controller,
            clock,
            slot_values,
        }
    }

    /// One full present-loop iteration; returns this frame's fence value.
    fn run_frame(&mut self) -> u64 {
        let index = self.controller.begin_frame(&self.clock).unwrap().unwrap();
        // (recording and queue submission happen here in the real driver)
        let value = self.clock.signal().unwrap();
        self.controller.record_submission(index, value);
        self.slot_values[index].set(value);
        self.controller.present().unwrap();
        value
    }

    fn outstanding(&self) -> u64 {
        self.clock.next.get() - self.clock.completed.get()
    }
}

#[test]
fn steady_state_keeps_exactly_ring_depth_outstanding() {
    let mut harness = Harness::new();

    let mut last_value = 0;
    for frame in 1..=10 {
        last_value = harness.run_frame();

        if frame <= NUM_FRAMES as u64 {
            // The first N frames never block: their slots were never used
            assert_eq!(harness.clock.forced_waits.get(), 0);
        } else {
            // Steady state: the CPU is exactly ring-depth submissions ahead
            // and each extra frame forced exactly one wait
            assert_eq!(harness.outstanding(), NUM_FRAMES as u64);
            assert_eq!(
                harness.clock.forced_waits.get(),
                (frame - NUM_FRAMES as u64) as u32
            );
        }
    }

    assert_eq!(last_value, 10);
    assert_eq!(harness.controller.target().presents, 10);
}

#[test]
fn fence_values_are_strictly_monotonic_across_frames() {
    let mut harness = Harness::new();
    let mut previous = 0;
    for _ in 0..10 {
        let value = harness.run_frame();
        assert!(value > previous);
        previous = value;
    }
}

#[test]
fn shutdown_drains_all_signaled_work() {
    let mut harness = Harness::new();
    let mut last_value = 0;
    for _ in 0..5 {
        last_value = harness.run_frame();
    }

    // Shutdown: flush the clock, then close the controller
    let flush_value = harness.clock.signal().unwrap();
    harness
        .clock
        .wait_until(flush_value, Duration::MAX)
        .unwrap();
    harness.controller.close(&harness.clock).unwrap();

    assert!(harness.clock.completed_value() >= last_value);
    assert!(harness.clock.completed_value() >= flush_value);
}

#[test]
fn resize_mid_stream_never_reuses_old_buffers() {
    let mut harness = Harness::new();
    for _ in 0..5 {
        harness.run_frame();
    }

    let clock = &harness.clock;
    harness
        .controller
        .resize(1920, 1080, clock, || {
            Ok(SimScratch {
                last_signaled: Rc::new(Cell::new(0)),
                completed: clock.completed.clone(),
                resets: Cell::new(0),
            })
        })
        .unwrap();

    // The target asserts every post-resize present uses a fresh acquisition
    for _ in 0..5 {
        harness.run_frame();
    }
    assert_eq!(harness.controller.target().generation, 1);
}
