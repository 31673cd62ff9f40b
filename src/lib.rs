// =============================================================================
// FLIPFRAME - Minimal real-time rendering front-end
// =============================================================================
//
// Owns a graphics device, a presentable swap chain, and the per-frame
// GPU/CPU synchronization needed to safely reuse a small ring of back
// buffers and command resources across frames.
//
// FRAME FLOW:
// 1. Ask the swap chain which back buffer is current
// 2. Acquire that frame slot (blocks until its last submission retired)
// 3. Record draw commands via the application callback
// 4. Submit, signal the fence clock, record the value against the slot
// 5. Present
//
// =============================================================================

pub mod app;
pub mod backend;
pub mod config;
pub mod context;
