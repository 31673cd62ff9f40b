// Render context - owns the device, fence clock and swap chain controller
//
// Constructed once, threaded through all calls. `render_frame` is the
// per-frame driver:
//
//   acquire index -> acquire slot (blocking) -> record -> submit
//     -> signal + record value -> present
//
// The steps must not be reordered: the wait for a slot's previous submission
// happens on acquire, never around present.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::frame::CommandScratch;
use crate::backend::present::{PresentStatus, PresentTarget, SwapchainController};
use crate::backend::swapchain::Swapchain;
use crate::backend::sync::{FenceClock, FenceTimeline};
use crate::backend::VulkanDevice;
use crate::config::GraphicsConfig;

/// Everything the recording callback needs for the current frame. The scratch
/// command buffer is open and the back buffer is in render-target layout;
/// the driver restores the presentable layout afterwards.
pub struct FrameContext<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub back_buffer_index: usize,
}

pub struct RenderContext {
    // Field order matters for Drop: chain before clock before surface
    // before device.
    controller: SwapchainController<Swapchain, CommandScratch>,
    clock: FenceClock,
    surface: SurfaceHandle,
    device: Arc<VulkanDevice>,
    wait_stages: [vk::PipelineStageFlags; 1],
    shut_down: bool,
}

impl RenderContext {
    /// Bring up the whole rendering front-end for a window.
    ///
    /// Fails fatally when no capable adapter, device or surface can be
    /// created; no partial state is left behind.
    pub fn new(window: &Window, graphics: &GraphicsConfig, debug_enabled: bool) -> Result<Self> {
        let device = VulkanDevice::new("flipframe", debug_enabled)?;

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        let surface = SurfaceHandle {
            raw: device.create_surface(display_handle, window_handle)?,
            device: device.clone(),
        };

        // Verify the GPU supports presenting to this surface
        let surface_support = unsafe {
            device.surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface.raw,
            )?
        };
        if !surface_support {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let clock = FenceClock::new(device.clone())?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface.raw,
            size.width,
            size.height,
            graphics.vsync,
            graphics.allow_tearing,
        )?;

        let scratch = (0..swapchain.image_count())
            .map(|_| CommandScratch::new(device.clone()))
            .collect::<Result<Vec<_>>>()?;

        let controller = SwapchainController::new(
            swapchain,
            scratch,
            size.width,
            size.height,
            graphics.vsync,
            graphics.allow_tearing,
        )?;

        log::info!("Render context initialized");

        Ok(Self {
            controller,
            clock,
            surface,
            device,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            shut_down: false,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.controller.target().extent()
    }

    pub fn vsync(&self) -> bool {
        self.controller.vsync()
    }

    pub fn tearing_supported(&self) -> bool {
        self.controller.tearing_supported()
    }

    pub fn set_vsync(&mut self, on: bool) {
        self.controller.set_vsync(on);
    }

    /// Only effective if the output reported tearing support.
    pub fn set_tearing_allowed(&mut self, on: bool) {
        self.controller.set_tearing_allowed(on);
    }

    /// Resize the back buffers. A no-op when dimensions are unchanged;
    /// zero dimensions are clamped to 1.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let device = self.device.clone();
        self.controller
            .resize(width, height, &self.clock, || {
                CommandScratch::new(device.clone())
            })
            .map(|_| ())
    }

    /// Render one frame. The callback records draw commands into the frame's
    /// scratch command buffer with the guarantee that the GPU is not reading
    /// any of the slot's resources. Returns false if the frame was skipped
    /// (swap chain being rebuilt).
    pub fn render_frame<F>(&mut self, record: F) -> Result<bool>
    where
        F: FnOnce(&mut FrameContext) -> Result<()>,
    {
        if self.shut_down {
            anyhow::bail!("render_frame after shutdown");
        }

        // Pick up a pending rebuild (present-mode change, out-of-date chain)
        if self.controller.needs_rebuild() {
            let device = self.device.clone();
            self.controller
                .refresh(&self.clock, || CommandScratch::new(device.clone()))?;
        }

        // Current index, then its frame slot - the one blocking point
        let index = match self.controller.begin_frame(&self.clock)? {
            Some(index) => index,
            None => return Ok(false),
        };

        let cmd = self.controller.scratch(index).command_buffer();

        let target = self.controller.target_mut();
        let old_layout = target.prior_layout(index);
        let image = target.image(index);
        let view = target.view(index);
        let extent = target.extent();
        let format = target.format();
        let wait_semaphore = target.frame_wait_semaphore();
        let signal_semaphore = target.frame_signal_semaphore(index);

        let device = &self.device.device;

        // Record, bracketed by the layout transitions
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        transition(
            device,
            cmd,
            image,
            old_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let mut frame = FrameContext {
            device,
            cmd,
            image,
            view,
            extent,
            format,
            back_buffer_index: index,
        };
        record(&mut frame)?;

        transition(
            device,
            cmd,
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        unsafe {
            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }

        // Submit
        let wait_semaphores = [wait_semaphore];
        let signal_semaphores = [signal_semaphore];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    vk::Fence::null(),
                )
                .context("Failed to submit frame")?;
        }

        // Signal and record against the slot, then present; the present
        // call itself is the only thing this step may block on
        let value = self.clock.signal()?;
        self.controller.record_submission(index, value);

        match self.controller.present()? {
            PresentStatus::Presented => {}
            PresentStatus::Skipped => log::debug!("Present skipped"),
            PresentStatus::NeedsRebuild => log::debug!("Swap chain flagged for rebuild"),
        }

        Ok(true)
    }

    /// Flush all outstanding GPU work, then refuse further frames.
    /// Resources are released by drop, strictly after the flush.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        log::info!("Shutting down renderer...");
        self.clock.flush()?;
        self.controller.close(&self.clock)?;
        self.device.wait_idle()?;
        self.shut_down = true;
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if !self.shut_down {
            // Nothing may be freed while the GPU could still reference it
            if let Err(e) = self.shutdown() {
                log::error!("Shutdown during drop failed: {:?}", e);
            }
        }
    }
}

/// Presentation surface with scoped destruction (after the swap chain,
/// before the device).
struct SurfaceHandle {
    raw: vk::SurfaceKHR,
    device: Arc<VulkanDevice>,
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        unsafe {
            self.device.surface_loader.destroy_surface(self.raw, None);
        }
    }
}

fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let src_access = if old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
    } else {
        vk::AccessFlags::empty()
    };
    let dst_access = if new_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE
    } else {
        vk::AccessFlags::empty()
    };
    let src_stage = if old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    } else {
        vk::PipelineStageFlags::TOP_OF_PIPE
    };
    let dst_stage = if new_layout == vk::ImageLayout::PRESENT_SRC_KHR {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    };

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}
