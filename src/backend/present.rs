// Swap chain controller - acquire/present/resize sequencing
//
// Owns the presentable target and the frame ring (the slot count always
// matches the back-buffer count). All sequencing rules live here:
// - a slot is reused only after its last submission retired (ring acquire)
// - present never waits for GPU availability; that wait lands on the *next*
//   frame's acquire
// - no back buffer created before a resize is referenced after it

use anyhow::{Context, Result};

use super::frame::{FrameRing, Scratch};
use super::sync::FenceTimeline;

/// Outcome of a present request.
///
/// `Skipped` and `NeedsRebuild` are transient, not errors: fence bookkeeping
/// for the frame was already recorded by the time present runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// The frame was dropped (e.g. occluded output); nothing was shown.
    Skipped,
    /// Presented (or dropped) and the target must be rebuilt before the
    /// next frame.
    NeedsRebuild,
}

/// Lifecycle of the swap chain: `Ready -> Resizing -> Ready -> ... -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Ready,
    Resizing,
    Closed,
}

/// The presentation subsystem as the controller sees it. Implemented by the
/// Vulkan swap chain; tests substitute a spy that tracks buffer generations.
pub trait PresentTarget {
    fn image_count(&self) -> usize;

    /// Whether tearing presentation is available on this output. Queried once
    /// at creation and cached by implementations.
    fn tearing_supported(&self) -> bool;

    /// Ask the presentation subsystem which back buffer to use next. The
    /// index is assigned by the subsystem, never computed by the caller.
    /// `None` means the target is out of date and must be rebuilt.
    fn acquire_index(&mut self) -> Result<Option<usize>>;

    fn present(&mut self, index: usize, vsync: bool, allow_tearing: bool)
        -> Result<PresentStatus>;

    /// Replace every back buffer with freshly created ones of the given size.
    /// Callers guarantee no buffer is still referenced by in-flight work.
    fn rebuild(&mut self, width: u32, height: u32, vsync: bool, allow_tearing: bool)
        -> Result<()>;
}

/// Sequencing core tying the presentation target to the frame ring.
pub struct SwapchainController<P, A> {
    target: P,
    ring: FrameRing<A>,
    width: u32,
    height: u32,
    vsync: bool,
    allow_tearing: bool,
    needs_rebuild: bool,
    state: ChainState,
    /// Back-buffer index reported by the target for the frame in progress.
    current: Option<usize>,
}

impl<P: PresentTarget, A: Scratch> SwapchainController<P, A> {
    pub fn new(
        target: P,
        scratch: Vec<A>,
        width: u32,
        height: u32,
        vsync: bool,
        allow_tearing: bool,
    ) -> Result<Self> {
        anyhow::ensure!(
            scratch.len() == target.image_count(),
            "frame ring size {} must match back-buffer count {}",
            scratch.len(),
            target.image_count()
        );

        if allow_tearing && !target.tearing_supported() {
            log::warn!("Tearing requested but not supported by the output");
        }

        Ok(Self {
            target,
            ring: FrameRing::new(scratch),
            width: width.max(1),
            height: height.max(1),
            vsync,
            allow_tearing,
            needs_rebuild: false,
            state: ChainState::Ready,
            current: None,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn vsync(&self) -> bool {
        self.vsync
    }

    pub fn tearing_supported(&self) -> bool {
        self.target.tearing_supported()
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn target(&self) -> &P {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut P {
        &mut self.target
    }

    pub fn set_vsync(&mut self, on: bool) {
        if self.vsync != on {
            self.vsync = on;
            self.needs_rebuild = true;
            log::info!("VSync {}", if on { "enabled" } else { "disabled" });
        }
    }

    /// Only effective while the output reported tearing support.
    pub fn set_tearing_allowed(&mut self, on: bool) {
        if on && !self.target.tearing_supported() {
            log::warn!("Tearing requested but not supported by the output");
        }
        if self.allow_tearing != on {
            self.allow_tearing = on;
            self.needs_rebuild = true;
        }
    }

    fn effective_tearing(&self) -> bool {
        self.allow_tearing && self.target.tearing_supported() && !self.vsync
    }

    /// Acquire the current back-buffer index and its frame slot, blocking
    /// until the slot's previous submission has retired. Returns `None` when
    /// the target is out of date; rebuild and try again next frame.
    pub fn begin_frame<C: FenceTimeline>(&mut self, clock: &C) -> Result<Option<usize>> {
        anyhow::ensure!(
            self.state == ChainState::Ready,
            "begin_frame in state {:?}",
            self.state
        );
        if self.needs_rebuild {
            return Ok(None);
        }

        let index = match self.current {
            Some(index) => index,
            None => match self.target.acquire_index()? {
                Some(index) => {
                    self.current = Some(index);
                    index
                }
                None => {
                    self.needs_rebuild = true;
                    return Ok(None);
                }
            },
        };

        self.ring.acquire(index, clock)?;
        Ok(Some(index))
    }

    /// The scratch acquired by the last `begin_frame`.
    pub fn scratch(&mut self, index: usize) -> &mut A {
        self.ring.scratch_mut(index)
    }

    /// Record the fence value signaled for this frame's submission.
    pub fn record_submission(&mut self, index: usize, value: u64) {
        self.ring.record_submission(index, value);
    }

    /// Submit the present request. Never waits for the GPU; any wait for
    /// availability belongs to the next frame's `begin_frame`.
    pub fn present(&mut self) -> Result<PresentStatus> {
        anyhow::ensure!(
            self.state == ChainState::Ready,
            "present in state {:?}",
            self.state
        );
        let index = self
            .current
            .take()
            .context("Present without an acquired back buffer")?;

        let status = self
            .target
            .present(index, self.vsync, self.effective_tearing())?;
        if status == PresentStatus::NeedsRebuild {
            self.needs_rebuild = true;
        }
        Ok(status)
    }

    /// Resize the back buffers. Idempotent: unchanged dimensions perform no
    /// flush and no resource churn. Zero dimensions are clamped to 1.
    pub fn resize<C, F>(
        &mut self,
        width: u32,
        height: u32,
        clock: &C,
        make_scratch: F,
    ) -> Result<bool>
    where
        C: FenceTimeline,
        F: FnMut() -> Result<A>,
    {
        let width = width.max(1);
        let height = height.max(1);
        if width == self.width && height == self.height && !self.needs_rebuild {
            return Ok(false);
        }
        self.rebuild(width, height, clock, make_scratch)?;
        Ok(true)
    }

    /// Rebuild at the current size (present-mode change, out-of-date target).
    pub fn refresh<C, F>(&mut self, clock: &C, make_scratch: F) -> Result<()>
    where
        C: FenceTimeline,
        F: FnMut() -> Result<A>,
    {
        let (width, height) = (self.width, self.height);
        self.rebuild(width, height, clock, make_scratch)
    }

    fn rebuild<C, F>(&mut self, width: u32, height: u32, clock: &C, mut make_scratch: F) -> Result<()>
    where
        C: FenceTimeline,
        F: FnMut() -> Result<A>,
    {
        anyhow::ensure!(
            self.state == ChainState::Ready,
            "rebuild in state {:?}",
            self.state
        );
        self.state = ChainState::Resizing;
        self.current = None;

        // No back buffer may still be referenced by an un-retired submission
        self.ring.flush(clock)?;

        self.target
            .rebuild(width, height, self.vsync, self.effective_tearing())?;

        let count = self.target.image_count();
        if count == self.ring.len() {
            self.ring.level_values();
        } else {
            let scratch = (0..count)
                .map(|_| make_scratch())
                .collect::<Result<Vec<_>>>()?;
            self.ring = FrameRing::new(scratch);
        }

        self.width = width;
        self.height = height;
        self.needs_rebuild = false;
        self.state = ChainState::Ready;
        log::info!("Swap chain rebuilt: {}x{}", width, height);
        Ok(())
    }

    /// Drain all in-flight work and refuse further frames.
    pub fn close<C: FenceTimeline>(&mut self, clock: &C) -> Result<()> {
        if self.state == ChainState::Closed {
            return Ok(());
        }
        self.ring.flush(clock)?;
        self.current = None;
        self.state = ChainState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::WaitOutcome;
    use std::cell::Cell;
    use std::time::Duration;

    #[derive(Default)]
    struct TestClock {
        next: Cell<u64>,
        completed: Cell<u64>,
        waits: Cell<u32>,
    }

    impl FenceTimeline for TestClock {
        fn signal(&self) -> Result<u64> {
            self.next.set(self.next.get() + 1);
            Ok(self.next.get())
        }

        fn completed_value(&self) -> u64 {
            self.completed.get()
        }

        fn wait_until(&self, value: u64, _timeout: Duration) -> Result<WaitOutcome> {
            self.waits.set(self.waits.get() + 1);
            // The simulated GPU retires everything on demand
            self.completed.set(self.completed.get().max(value));
            Ok(WaitOutcome::Complete)
        }
    }

    struct TestScratch;

    impl Scratch for TestScratch {
        fn reset(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Presentation spy: tracks a buffer generation that changes on every
    /// rebuild and refuses to present an index acquired under an older one.
    struct TestTarget {
        images: usize,
        supports_tearing: bool,
        generation: u32,
        acquired_generation: Cell<u32>,
        index: usize,
        rebuilds: u32,
        presents: u32,
        last_tearing: Option<bool>,
        skip_next: bool,
    }

    impl TestTarget {
        fn new(images: usize, supports_tearing: bool) -> Self {
            Self {
                images,
                supports_tearing,
                generation: 0,
                acquired_generation: Cell::new(0),
                index: 0,
                rebuilds: 0,
                presents: 0,
                last_tearing: None,
                skip_next: false,
            }
        }
    }

    impl PresentTarget for TestTarget {
        fn image_count(&self) -> usize {
            self.images
        }

        fn tearing_supported(&self) -> bool {
            self.supports_tearing
        }

        fn acquire_index(&mut self) -> Result<Option<usize>> {
            self.acquired_generation.set(self.generation);
            Ok(Some(self.index))
        }

        fn present(
            &mut self,
            index: usize,
            vsync: bool,
            allow_tearing: bool,
        ) -> Result<PresentStatus> {
            assert_eq!(
                self.acquired_generation.get(),
                self.generation,
                "presented a back buffer from before a resize"
            );
            assert!(index < self.images);
            if allow_tearing {
                assert!(self.supports_tearing && !vsync);
            }
            self.last_tearing = Some(allow_tearing);
            if self.skip_next {
                self.skip_next = false;
                return Ok(PresentStatus::Skipped);
            }
            self.presents += 1;
            self.index = (index + 1) % self.images;
            Ok(PresentStatus::Presented)
        }

        fn rebuild(&mut self, width: u32, height: u32, _vsync: bool, _tearing: bool) -> Result<()> {
            assert!(width >= 1 && height >= 1);
            self.generation += 1;
            self.rebuilds += 1;
            self.index = 0;
            Ok(())
        }
    }

    fn controller(
        images: usize,
        tearing: bool,
    ) -> (SwapchainController<TestTarget, TestScratch>, TestClock) {
        let target = TestTarget::new(images, tearing);
        let scratch = (0..images).map(|_| TestScratch).collect();
        let controller = SwapchainController::new(target, scratch, 800, 600, true, false).unwrap();
        (controller, TestClock::default())
    }

    fn run_frame(
        controller: &mut SwapchainController<TestTarget, TestScratch>,
        clock: &TestClock,
    ) -> usize {
        let index = controller.begin_frame(clock).unwrap().unwrap();
        let value = clock.signal().unwrap();
        controller.record_submission(index, value);
        controller.present().unwrap();
        index
    }

    #[test]
    fn resize_is_idempotent() {
        let (mut controller, clock) = controller(3, false);
        run_frame(&mut controller, &clock);

        let changed = controller
            .resize(1024, 768, &clock, || Ok(TestScratch))
            .unwrap();
        assert!(changed);
        let flushes = clock.waits.get();
        let rebuilds = controller.target().rebuilds;

        // Same dimensions again: no flush, no resource churn
        let changed = controller
            .resize(1024, 768, &clock, || Ok(TestScratch))
            .unwrap();
        assert!(!changed);
        assert_eq!(clock.waits.get(), flushes);
        assert_eq!(controller.target().rebuilds, rebuilds);
    }

    #[test]
    fn zero_size_resize_is_clamped() {
        let (mut controller, clock) = controller(3, false);
        controller.resize(0, 0, &clock, || Ok(TestScratch)).unwrap();
        assert_eq!(controller.width(), 1);
        assert_eq!(controller.height(), 1);
    }

    #[test]
    fn no_stale_buffer_survives_resize() {
        let (mut controller, clock) = controller(3, false);
        for _ in 0..4 {
            run_frame(&mut controller, &clock);
        }
        controller
            .resize(640, 480, &clock, || Ok(TestScratch))
            .unwrap();
        // The spy target panics if a pre-resize acquisition reaches present
        for _ in 0..4 {
            run_frame(&mut controller, &clock);
        }
    }

    #[test]
    fn resize_flushes_inflight_work() {
        let (mut controller, clock) = controller(3, false);
        let index = controller.begin_frame(&clock).unwrap().unwrap();
        let value = clock.signal().unwrap();
        controller.record_submission(index, value);
        controller.present().unwrap();

        controller
            .resize(320, 240, &clock, || Ok(TestScratch))
            .unwrap();
        assert!(clock.completed_value() >= value);
    }

    #[test]
    fn tearing_flag_requires_support_and_no_vsync() {
        // Unsupported output: flag never reaches the target
        {
            let (mut controller, clock) = controller(3, false);
            controller.set_vsync(false);
            controller.set_tearing_allowed(true);
            controller.refresh(&clock, || Ok(TestScratch)).unwrap();
            run_frame(&mut controller, &clock);
            assert_eq!(controller.target().last_tearing, Some(false));
        }

        // Supported output, vsync off: tearing allowed
        let (mut controller, clock) = controller(3, true);
        controller.set_vsync(false);
        controller.set_tearing_allowed(true);
        controller.refresh(&clock, || Ok(TestScratch)).unwrap();
        run_frame(&mut controller, &clock);
        assert_eq!(controller.target().last_tearing, Some(true));

        // VSync back on: tearing masked
        controller.set_vsync(true);
        controller.refresh(&clock, || Ok(TestScratch)).unwrap();
        run_frame(&mut controller, &clock);
        assert_eq!(controller.target().last_tearing, Some(false));
    }

    #[test]
    fn policy_change_requests_rebuild() {
        let (mut controller, clock) = controller(3, false);
        controller.set_vsync(false);
        assert!(controller.needs_rebuild());
        // begin_frame refuses to render until the rebuild happens
        assert!(controller.begin_frame(&clock).unwrap().is_none());
        controller.refresh(&clock, || Ok(TestScratch)).unwrap();
        assert!(!controller.needs_rebuild());
        assert!(controller.begin_frame(&clock).unwrap().is_some());
    }

    #[test]
    fn skipped_present_keeps_bookkeeping_consistent() {
        let (mut controller, clock) = controller(3, false);
        controller.target_mut().skip_next = true;

        let index = controller.begin_frame(&clock).unwrap().unwrap();
        let value = clock.signal().unwrap();
        controller.record_submission(index, value);
        assert_eq!(controller.present().unwrap(), PresentStatus::Skipped);

        // The signaled value stays recorded against the slot and the next
        // frame proceeds normally
        assert_eq!(controller.ring.last_signaled(index), value);
        run_frame(&mut controller, &clock);
    }

    #[test]
    fn present_without_acquire_is_an_error() {
        let (mut controller, _clock) = controller(3, false);
        assert!(controller.present().is_err());
    }

    #[test]
    fn closed_controller_refuses_frames() {
        let (mut controller, clock) = controller(3, false);
        run_frame(&mut controller, &clock);
        controller.close(&clock).unwrap();
        assert_eq!(controller.state(), ChainState::Closed);
        assert!(controller.begin_frame(&clock).is_err());
        assert!(controller
            .resize(100, 100, &clock, || Ok(TestScratch))
            .is_err());
    }

    #[test]
    fn close_drains_inflight_work() {
        let (mut controller, clock) = controller(3, false);
        let mut last = 0;
        for _ in 0..3 {
            let index = controller.begin_frame(&clock).unwrap().unwrap();
            last = clock.signal().unwrap();
            controller.record_submission(index, last);
            controller.present().unwrap();
        }
        controller.close(&clock).unwrap();
        assert!(clock.completed_value() >= last);
    }
}
