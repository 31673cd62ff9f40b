// Application interface - what the host drives each frame
//
// One trait, one implementation per application mode. The renderer only sees
// `record`: draw commands are opaque to the frame engine.

use anyhow::Result;
use ash::vk;

use crate::context::{FrameContext, RenderContext};

pub trait Application {
    fn init(&mut self, ctx: &mut RenderContext) -> Result<()>;

    /// Record this frame's draw commands. The scratch command buffer is open
    /// and the back buffer is in render-target layout.
    fn record(&mut self, frame: &mut FrameContext) -> Result<()>;

    fn window_size_changed(&mut self, width: u32, height: u32);

    fn finish(&mut self, ctx: &mut RenderContext) -> Result<()>;
}

/// Runtime mode: clears the back buffer to a fixed color every frame.
pub struct ClearApp {
    clear_color: [f32; 4],
}

impl ClearApp {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self { clear_color }
    }
}

impl Application for ClearApp {
    fn init(&mut self, _ctx: &mut RenderContext) -> Result<()> {
        Ok(())
    }

    fn record(&mut self, frame: &mut FrameContext) -> Result<()> {
        let clear_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };

        let attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(frame.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value);
        let attachments = [attachment.build()];

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: frame.extent,
            })
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            frame.device.cmd_begin_rendering(frame.cmd, &rendering_info);
            frame.device.cmd_end_rendering(frame.cmd);
        }

        Ok(())
    }

    fn window_size_changed(&mut self, width: u32, height: u32) {
        log::debug!("Application resized to {}x{}", width, height);
    }

    fn finish(&mut self, _ctx: &mut RenderContext) -> Result<()> {
        Ok(())
    }
}
