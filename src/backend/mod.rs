// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// The traits (FenceTimeline, PresentTarget, Scratch) are the seams the
// frame-pacing logic is written against; tests substitute simulated GPUs.

pub mod device;
pub mod frame;
pub mod present;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
