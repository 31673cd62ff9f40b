// =============================================================================
// FLIPFRAME HOST - window, input, and the frame loop driver
// =============================================================================
//
// Thin winit host around the rendering front-end. All frame pacing and
// swap-chain sequencing lives in RenderContext; this file only owns the
// window, forwards resize notifications, and asks for one frame per redraw.

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::KeyCode,
    window::{Fullscreen, Window, WindowAttributes},
};

use flipframe::app::{Application, ClearApp};
use flipframe::config::Config;
use flipframe::context::RenderContext;

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting flipframe");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!(
        "VSync: {}, tearing allowed: {}",
        config.graphics.vsync,
        config.graphics.allow_tearing
    );

    let event_loop = EventLoop::new()?;
    let mut host = Host::new(config);
    event_loop.run_app(&mut host)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== flipframe log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Map a key name from config.toml to a winit key code.
fn parse_key(name: &str) -> Option<KeyCode> {
    match name {
        "Escape" => Some(KeyCode::Escape),
        "Space" => Some(KeyCode::Space),
        "F10" => Some(KeyCode::F10),
        "F11" => Some(KeyCode::F11),
        "F12" => Some(KeyCode::F12),
        "V" | "KeyV" => Some(KeyCode::KeyV),
        "T" | "KeyT" => Some(KeyCode::KeyT),
        "Q" | "KeyQ" => Some(KeyCode::KeyQ),
        _ => {
            log::warn!("Unknown key binding '{}'", name);
            None
        }
    }
}

// =============================================================================
// HOST STATE
// =============================================================================

struct Host {
    config: Config,

    // Window
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // Rendering front-end and the active application mode
    ctx: Option<RenderContext>,
    app: Box<dyn Application>,

    // Key bindings resolved from config
    quit_key: Option<KeyCode>,
    fullscreen_key: Option<KeyCode>,
    vsync_key: Option<KeyCode>,

    // State flags
    pending_resize: Option<(u32, u32)>,
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl Host {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let app = Box::new(ClearApp::new(config.graphics.clear_color));
        let quit_key = parse_key(&config.controls.quit_key);
        let fullscreen_key = parse_key(&config.controls.fullscreen_key);
        let vsync_key = parse_key(&config.controls.vsync_key);
        let now = Instant::now();
        Self {
            config,
            window: None,
            is_fullscreen,
            ctx: None,
            app,
            quit_key,
            fullscreen_key,
            vsync_key,
            pending_resize: None,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;

        let mut ctx = RenderContext::new(&window, &self.config.graphics, enable_validation)?;
        self.app.init(&mut ctx)?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn render(&mut self) -> Result<bool> {
        // Skip rendering if minimized
        if self.is_minimized {
            return Ok(false);
        }

        let Some(ctx) = self.ctx.as_mut() else {
            return Ok(false);
        };

        // Apply a pending window resize before rendering
        if let Some((width, height)) = self.pending_resize.take() {
            ctx.resize(width, height)?;
            self.app.window_size_changed(width, height);
        }

        let app = &mut self.app;
        ctx.render_frame(|frame| app.record(frame))
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resize lands through the Resized event
        }
    }

    fn toggle_vsync(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            let vsync = !ctx.vsync();
            ctx.set_vsync(vsync);
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen {
                    "fullscreen"
                } else {
                    "windowed"
                };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = self.app.finish(&mut ctx) {
                log::error!("Application finish failed: {:?}", e);
            }
            if let Err(e) = ctx.shutdown() {
                log::error!("Renderer shutdown failed: {:?}", e);
            }
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for Host {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window.clone()) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.pending_resize = Some((size.width, size.height));
                }
            }

            WindowEvent::RedrawRequested => {
                match self.render() {
                    Ok(rendered) => {
                        if rendered {
                            self.update_fps();
                        }
                    }
                    Err(e) => {
                        // A failed frame aborts the session rather than
                        // risking inconsistent back-buffer/fence state
                        log::error!("Render error: {:?}", e);
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::PhysicalKey;

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        if Some(key) == self.quit_key {
                            log::info!("Quit key pressed, exiting...");
                            self.shutdown();
                            event_loop.exit();
                        } else if Some(key) == self.fullscreen_key {
                            self.toggle_fullscreen();
                        } else if Some(key) == self.vsync_key {
                            self.toggle_vsync();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for an uncapped frame loop.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
