// Swapchain - window presentation
//
// Owns the chain of presentable images, their views, and the binary
// semaphores presentation needs (acquire/present cannot use the timeline
// semaphore). Implements `PresentTarget` for the swap chain controller.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::frame::NUM_FRAMES;
use super::present::{PresentStatus, PresentTarget};
use super::VulkanDevice;

pub struct Swapchain {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,
    loader: ash::extensions::khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    /// Present modes the surface reported at creation; queried once.
    supported_modes: Vec<vk::PresentModeKHR>,
    /// One acquire semaphore per ring position, rotated each frame.
    acquire_semaphores: Vec<vk::Semaphore>,
    /// One present-wait semaphore per swapchain image.
    present_semaphores: Vec<vk::Semaphore>,
    acquire_cursor: usize,
    /// Semaphore the most recent acquire will signal.
    frame_wait: vk::Semaphore,
    /// Which images have been rendered to since (re)creation; the first
    /// transition of an image starts from UNDEFINED instead of PRESENT_SRC.
    initialized: Vec<bool>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
        allow_tearing: bool,
    ) -> Result<Self> {
        let supported_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }
        .context("Failed to query surface present modes")?;

        let tearing = allow_tearing && supports_tearing(&supported_modes) && !vsync;
        let present_mode = choose_present_mode(&supported_modes, vsync, tearing);

        let loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let (swapchain, images, image_views, format, extent) =
            create_chain(&device, surface, &loader, width, height, present_mode)?;

        let acquire_semaphores = create_semaphores(&device, images.len())?;
        let present_semaphores = create_semaphores(&device, images.len())?;
        let initialized = vec![false; images.len()];
        let frame_wait = acquire_semaphores[0];

        Ok(Self {
            device,
            surface,
            loader,
            swapchain,
            images,
            image_views,
            format,
            extent,
            present_mode,
            supported_modes,
            acquire_semaphores,
            present_semaphores,
            acquire_cursor: 0,
            frame_wait,
            initialized,
        })
    }

    pub fn image(&self, index: usize) -> vk::Image {
        self.images[index]
    }

    pub fn view(&self, index: usize) -> vk::ImageView {
        self.image_views[index]
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Semaphore signaled by this frame's image acquisition; the frame's
    /// submission must wait on it.
    pub fn frame_wait_semaphore(&self) -> vk::Semaphore {
        self.frame_wait
    }

    /// Semaphore the frame's submission must signal; present waits on it.
    pub fn frame_signal_semaphore(&self, index: usize) -> vk::Semaphore {
        self.present_semaphores[index]
    }

    /// Layout the image is in before this frame renders to it. Marks the
    /// image as used.
    pub fn prior_layout(&mut self, index: usize) -> vk::ImageLayout {
        if self.initialized[index] {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            self.initialized[index] = true;
            vk::ImageLayout::UNDEFINED
        }
    }

    fn destroy_resources(&mut self) {
        unsafe {
            for &semaphore in self
                .acquire_semaphores
                .iter()
                .chain(self.present_semaphores.iter())
            {
                self.device.device.destroy_semaphore(semaphore, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        self.acquire_semaphores.clear();
        self.present_semaphores.clear();
        self.image_views.clear();
        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
    }
}

impl PresentTarget for Swapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn tearing_supported(&self) -> bool {
        supports_tearing(&self.supported_modes)
    }

    fn acquire_index(&mut self) -> Result<Option<usize>> {
        let semaphore = self.acquire_semaphores[self.acquire_cursor];

        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.acquire_cursor = (self.acquire_cursor + 1) % self.acquire_semaphores.len();
                self.frame_wait = semaphore;
                if suboptimal {
                    log::debug!("Swapchain suboptimal during acquire");
                }
                Ok(Some(index as usize))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date during acquire");
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    fn present(
        &mut self,
        index: usize,
        vsync: bool,
        allow_tearing: bool,
    ) -> Result<PresentStatus> {
        let wait_semaphores = [self.present_semaphores[index]];
        let swapchains = [self.swapchain];
        let image_indices = [index as u32];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        // A policy change (vsync/tearing) means the chain was built with the
        // wrong present mode; present this frame, then rebuild.
        let desired = choose_present_mode(&self.supported_modes, vsync, allow_tearing);

        match result {
            Ok(false) if desired == self.present_mode => Ok(PresentStatus::Presented),
            Ok(_) => Ok(PresentStatus::NeedsRebuild),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::NeedsRebuild),
            Err(e) => Err(e).context("Present failed"),
        }
    }

    fn rebuild(
        &mut self,
        width: u32,
        height: u32,
        vsync: bool,
        allow_tearing: bool,
    ) -> Result<()> {
        // The surface can only have one swapchain at a time: drop the old
        // one (the controller has already flushed all in-flight work)
        self.destroy_resources();

        self.present_mode = choose_present_mode(&self.supported_modes, vsync, allow_tearing);

        let (swapchain, images, image_views, format, extent) = create_chain(
            &self.device,
            self.surface,
            &self.loader,
            width,
            height,
            self.present_mode,
        )?;

        self.acquire_semaphores = create_semaphores(&self.device, images.len())?;
        self.present_semaphores = create_semaphores(&self.device, images.len())?;
        self.initialized = vec![false; images.len()];
        self.acquire_cursor = 0;
        self.frame_wait = self.acquire_semaphores[0];

        self.swapchain = swapchain;
        self.images = images;
        self.image_views = image_views;
        self.format = format;
        self.extent = extent;

        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            self.destroy_resources();
        }
    }
}

fn supports_tearing(modes: &[vk::PresentModeKHR]) -> bool {
    modes.contains(&vk::PresentModeKHR::IMMEDIATE)
}

/// Map the vsync/tearing policy onto a present mode.
///
/// IMMEDIATE: no vsync, may tear. MAILBOX: no vsync, no tearing.
/// FIFO: vsync, always available.
fn choose_present_mode(
    supported: &[vk::PresentModeKHR],
    vsync: bool,
    allow_tearing: bool,
) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    if allow_tearing && supported.contains(&vk::PresentModeKHR::IMMEDIATE) {
        return vk::PresentModeKHR::IMMEDIATE;
    }
    if supported.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

#[allow(clippy::type_complexity)]
fn create_chain(
    device: &VulkanDevice,
    surface: vk::SurfaceKHR,
    loader: &ash::extensions::khr::Swapchain,
    width: u32,
    height: u32,
    present_mode: vk::PresentModeKHR,
) -> Result<(
    vk::SwapchainKHR,
    Vec<vk::Image>,
    Vec<vk::ImageView>,
    vk::Format,
    vk::Extent2D,
)> {
    log::info!("Creating swapchain: {}x{} ({:?})", width, height, present_mode);

    let surface_caps = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_capabilities(device.physical_device, surface)
    }
    .context("Failed to query surface capabilities")?;

    let formats = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_formats(device.physical_device, surface)
    }
    .context("Failed to query surface formats")?;

    // Choose surface format (prefer SRGB)
    let surface_format = formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .context("No suitable surface format")?;

    // Choose extent (never 0 in either dimension)
    let extent = if surface_caps.current_extent.width != u32::MAX {
        surface_caps.current_extent
    } else {
        vk::Extent2D {
            width: width.max(1).clamp(
                surface_caps.min_image_extent.width,
                surface_caps.max_image_extent.width,
            ),
            height: height.max(1).clamp(
                surface_caps.min_image_extent.height,
                surface_caps.max_image_extent.height,
            ),
        }
    };

    // Triple buffering, within what the surface allows
    let mut image_count = (NUM_FRAMES as u32).max(surface_caps.min_image_count);
    if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
        image_count = surface_caps.max_image_count;
    }

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
        .context("Failed to create swapchain")?;

    let images = unsafe { loader.get_swapchain_images(swapchain) }
        .context("Failed to get swapchain images")?;

    log::info!("Created swapchain with {} images", images.len());

    let image_views: Result<Vec<_>> = images
        .iter()
        .map(|&image| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe {
                device
                    .device
                    .create_image_view(&create_info, None)
                    .context("Failed to create image view")
            }
        })
        .collect();

    Ok((
        swapchain,
        images,
        image_views?,
        surface_format.format,
        extent,
    ))
}

fn create_semaphores(device: &VulkanDevice, count: usize) -> Result<Vec<vk::Semaphore>> {
    let create_info = vk::SemaphoreCreateInfo::builder();
    (0..count)
        .map(|_| unsafe {
            device
                .device
                .create_semaphore(&create_info, None)
                .context("Failed to create semaphore")
        })
        .collect()
}
